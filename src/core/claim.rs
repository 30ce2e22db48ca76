//! Purpose: Caller-facing handle over a reserved, not yet committed frame.
//! Exports: `BufferClaim`.
//! Role: Second half of the claim/commit protocol started by `Publication::try_claim`.
//! Invariants: Exactly one of commit/abort happens per claim; dropping an open claim aborts it.
//! Invariants: The payload slice is exclusive to the claim holder until commit.
use std::fmt;
use std::marker::PhantomData;

use crate::core::atomic_buffer::AtomicBuffer;
use crate::core::frame::{
    self, FrameType, HEADER_LENGTH, RESERVED_VALUE_FIELD_OFFSET,
};

/// A frame reserved in the log. The lifetime ties it to the publication (and through it, the
/// mapped log) it was claimed from.
pub struct BufferClaim<'a> {
    frame: AtomicBuffer,
    position: i64,
    open: bool,
    _publication: PhantomData<&'a ()>,
}

impl<'a> BufferClaim<'a> {
    pub(crate) fn new(frame: AtomicBuffer, position: i64) -> Self {
        Self {
            frame,
            position,
            open: true,
            _publication: PhantomData,
        }
    }

    /// Stream position just past this frame once committed.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn length(&self) -> usize {
        self.frame.capacity() - HEADER_LENGTH
    }

    pub fn buffer(&self) -> &[u8] {
        // SAFETY: the range is reserved for this claim and readers cannot see it before commit.
        unsafe { self.frame.as_slice(HEADER_LENGTH, self.length()) }
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` keeps the slice unique within this process.
        unsafe { self.frame.as_mut_slice(HEADER_LENGTH, self.length()) }
    }

    pub fn put_bytes(&mut self, offset: usize, src: &[u8]) {
        self.buffer_mut()[offset..offset + src.len()].copy_from_slice(src);
    }

    pub fn reserved_value(&self) -> i64 {
        self.frame.get_i64(RESERVED_VALUE_FIELD_OFFSET)
    }

    pub fn set_reserved_value(&mut self, value: i64) -> &mut Self {
        self.frame.put_i64(RESERVED_VALUE_FIELD_OFFSET, value);
        self
    }

    pub fn set_flags(&mut self, flags: u8) -> &mut Self {
        frame::frame_flags(&self.frame, 0, flags);
        self
    }

    /// Publishes the frame to consumers.
    pub fn commit(mut self) -> i64 {
        self.open = false;
        frame::frame_length_ordered(&self.frame, 0, self.frame.capacity() as i32);
        self.position
    }

    /// Turns the frame into padding so consumers skip it.
    pub fn abort(mut self) {
        self.open = false;
        self.abort_in_place();
    }

    fn abort_in_place(&self) {
        frame::frame_type(&self.frame, 0, FrameType::Pad);
        frame::frame_length_ordered(&self.frame, 0, self.frame.capacity() as i32);
    }
}

impl Drop for BufferClaim<'_> {
    fn drop(&mut self) {
        if self.open {
            tracing::warn!(
                position = self.position,
                length = self.length(),
                "claim dropped without commit; aborting"
            );
            self.abort_in_place();
        }
    }
}

impl fmt::Debug for BufferClaim<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferClaim")
            .field("position", &self.position)
            .field("length", &self.length())
            .field("open", &self.open)
            .finish()
    }
}
