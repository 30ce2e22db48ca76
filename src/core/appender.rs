//! Purpose: Lock-free append of single frames into one term partition.
//! Exports: `TermAppender`, `AppendOutcome`.
//! Role: Bound 1:1 to a partition (term buffer + tail counter); holds no mutable state itself.
//! Invariants: Every reservation is an unconditional fetch-and-add on the tail counter; space
//! reserved past the end of the term is never reused.
//! Invariants: A frame becomes visible only through the release store of its length field.
use crate::core::atomic_buffer::AtomicBuffer;
use crate::core::descriptor::{
    self, TERM_STATUS_OFFSET, TERM_TAIL_COUNTER_OFFSET, TermStatus,
};
use crate::core::frame::{self, FrameType, HEADER_LENGTH, HeaderWriter, RESERVED_VALUE_FIELD_OFFSET};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AppendOutcome {
    /// The frame at `frame_offset` is reserved (claim) or committed (append); the tail now
    /// stands at `resulting_offset`.
    Appended {
        term_id: i32,
        frame_offset: usize,
        frame_length: usize,
        resulting_offset: usize,
    },
    /// This reservation crossed the end of the term; the remainder was committed as padding.
    Tripped { term_id: i32 },
    /// The term was already exhausted when the reservation was made; nothing was written.
    Failed { term_id: i32 },
}

impl AppendOutcome {
    pub fn is_term_exhausted(&self) -> bool {
        !matches!(self, AppendOutcome::Appended { .. })
    }

    pub fn term_id(&self) -> i32 {
        match *self {
            AppendOutcome::Appended { term_id, .. }
            | AppendOutcome::Tripped { term_id }
            | AppendOutcome::Failed { term_id } => term_id,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct TermAppender {
    term: AtomicBuffer,
    meta: AtomicBuffer,
}

impl TermAppender {
    pub fn new(term: AtomicBuffer, meta: AtomicBuffer) -> Self {
        Self { term, meta }
    }

    pub fn term_buffer(&self) -> &AtomicBuffer {
        &self.term
    }

    pub fn term_length(&self) -> usize {
        self.term.capacity()
    }

    pub fn raw_tail_volatile(&self) -> i64 {
        self.meta.get_i64_volatile(TERM_TAIL_COUNTER_OFFSET)
    }

    /// Moves this partition's tail from `expected_raw_tail` to the start of `term_id`. Only one
    /// of any number of racing callers can succeed for a given expected value.
    pub fn reset_tail(&self, expected_raw_tail: i64, term_id: i32) -> bool {
        self.meta.compare_and_set_i64(
            TERM_TAIL_COUNTER_OFFSET,
            expected_raw_tail,
            descriptor::pack_tail(term_id, 0),
        )
    }

    pub fn status_volatile(&self) -> i32 {
        self.meta.get_i32_volatile(TERM_STATUS_OFFSET)
    }

    pub fn status_ordered(&self, status: TermStatus) {
        self.meta.put_i32_ordered(TERM_STATUS_OFFSET, status as i32);
    }

    /// Reserves a frame for `length` payload bytes without committing it. On `Appended` the
    /// header is written with a zero length; the caller owns the payload range until it stores
    /// the length with `frame::frame_length_ordered`.
    pub fn claim(&self, header: &HeaderWriter, length: usize) -> AppendOutcome {
        let frame_length = length + HEADER_LENGTH;
        let aligned_length = frame::align_frame_length(frame_length);
        let (term_id, offset) = self.reserve(aligned_length);

        match self.check_room(term_id, offset, aligned_length, header) {
            Some(outcome) => outcome,
            None => {
                header.write(&self.term, offset, term_id);
                AppendOutcome::Appended {
                    term_id,
                    frame_offset: offset,
                    frame_length,
                    resulting_offset: offset + aligned_length,
                }
            }
        }
    }

    /// Reserves, writes and commits a whole frame carrying `payload`.
    pub fn append_unfragmented(&self, header: &HeaderWriter, payload: &[u8]) -> AppendOutcome {
        self.append_with(header, payload, None)
    }

    /// As `append_unfragmented`, but `reserved_value` sees the complete frame (length still
    /// zero) and its result is stored in the header's reserved field before commit.
    pub fn append_unfragmented_with_reserved_value(
        &self,
        header: &HeaderWriter,
        payload: &[u8],
        reserved_value: &dyn Fn(&[u8]) -> i64,
    ) -> AppendOutcome {
        self.append_with(header, payload, Some(reserved_value))
    }

    fn append_with(
        &self,
        header: &HeaderWriter,
        payload: &[u8],
        reserved_value: Option<&dyn Fn(&[u8]) -> i64>,
    ) -> AppendOutcome {
        let frame_length = payload.len() + HEADER_LENGTH;
        let aligned_length = frame::align_frame_length(frame_length);
        let (term_id, offset) = self.reserve(aligned_length);

        if let Some(outcome) = self.check_room(term_id, offset, aligned_length, header) {
            return outcome;
        }

        header.write(&self.term, offset, term_id);
        self.term.put_bytes(offset + HEADER_LENGTH, payload);
        if let Some(supplier) = reserved_value {
            // SAFETY: the range was reserved by this call and is not yet visible to readers.
            let frame_bytes = unsafe { self.term.as_slice(offset, frame_length) };
            let value = supplier(frame_bytes);
            self.term.put_i64(offset + RESERVED_VALUE_FIELD_OFFSET, value);
        }
        frame::frame_length_ordered(&self.term, offset, frame_length as i32);

        AppendOutcome::Appended {
            term_id,
            frame_offset: offset,
            frame_length,
            resulting_offset: offset + aligned_length,
        }
    }

    fn reserve(&self, aligned_length: usize) -> (i32, usize) {
        let raw_tail = self
            .meta
            .get_and_add_i64(TERM_TAIL_COUNTER_OFFSET, aligned_length as i64);
        let term_id = descriptor::tail_term_id(raw_tail);
        let offset = (raw_tail & 0xFFFF_FFFF) as usize;
        (term_id, offset)
    }

    /// `None` when the reservation fits; otherwise handles the end-of-term condition.
    fn check_room(
        &self,
        term_id: i32,
        offset: usize,
        aligned_length: usize,
        header: &HeaderWriter,
    ) -> Option<AppendOutcome> {
        let term_length = self.term.capacity();
        if offset + aligned_length <= term_length {
            return None;
        }
        if offset >= term_length {
            return Some(AppendOutcome::Failed { term_id });
        }

        let padding_length = term_length - offset;
        header.write(&self.term, offset, term_id);
        frame::frame_type(&self.term, offset, FrameType::Pad);
        frame::frame_length_ordered(&self.term, offset, padding_length as i32);
        tracing::trace!(term_id, offset, padding_length, "term tripped");
        Some(AppendOutcome::Tripped { term_id })
    }
}
