//! Purpose: Typed, bounds-checked access to raw shared memory.
//! Exports: `AtomicBuffer`.
//! Role: The only place that touches log memory through raw pointers.
//! Invariants: A view never outlives the mapping it was cut from; owners (`LogBuffers`)
//! hand views out only to types that also hold the owner alive.
//! Invariants: Plain accessors are little-endian; atomic accessors are native-endian, which the
//! crate root pins to little-endian.
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

/// Non-owning view over a region of shared memory.
///
/// All writers go through raw pointers, never `&mut` references, so several threads (and other
/// processes mapping the same file) may write disjoint ranges concurrently. Ordering between them
/// is established only by the atomic accessors.
#[derive(Clone, Copy, Debug)]
pub struct AtomicBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The view is a pointer into memory whose owner is `Sync`; all mutation is either atomic or
// confined to ranges a writer has exclusively reserved.
unsafe impl Send for AtomicBuffer {}
unsafe impl Sync for AtomicBuffer {}

impl AtomicBuffer {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as the view (and any
    /// view derived from it) is used, and must be 8-byte aligned.
    pub(crate) unsafe fn wrap(ptr: NonNull<u8>, len: usize) -> Self {
        debug_assert_eq!(ptr.as_ptr() as usize % 8, 0, "buffer must be 8-byte aligned");
        Self { ptr, len }
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Sub-view of `length` bytes starting at `offset`.
    pub fn view(&self, offset: usize, length: usize) -> AtomicBuffer {
        self.bounds_check(offset, length);
        // SAFETY: the range was just checked against this view, which is itself valid.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) };
        Self { ptr, len: length }
    }

    pub fn get_u8(&self, offset: usize) -> u8 {
        self.bounds_check(offset, 1);
        unsafe { self.ptr.as_ptr().add(offset).read() }
    }

    pub fn put_u8(&self, offset: usize, value: u8) {
        self.bounds_check(offset, 1);
        unsafe { self.ptr.as_ptr().add(offset).write(value) }
    }

    pub fn get_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    pub fn put_u16(&self, offset: usize, value: u16) {
        self.write_array(offset, value.to_le_bytes());
    }

    pub fn get_i32(&self, offset: usize) -> i32 {
        i32::from_le_bytes(self.read_array(offset))
    }

    pub fn put_i32(&self, offset: usize, value: i32) {
        self.write_array(offset, value.to_le_bytes());
    }

    pub fn get_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.read_array(offset))
    }

    pub fn put_i64(&self, offset: usize, value: i64) {
        self.write_array(offset, value.to_le_bytes());
    }

    pub fn get_i32_volatile(&self, offset: usize) -> i32 {
        self.atomic_i32(offset).load(Ordering::Acquire)
    }

    pub fn put_i32_ordered(&self, offset: usize, value: i32) {
        self.atomic_i32(offset).store(value, Ordering::Release);
    }

    pub fn compare_and_set_i32(&self, offset: usize, expected: i32, update: i32) -> bool {
        self.atomic_i32(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn get_i64_volatile(&self, offset: usize) -> i64 {
        self.atomic_i64(offset).load(Ordering::Acquire)
    }

    pub fn put_i64_ordered(&self, offset: usize, value: i64) {
        self.atomic_i64(offset).store(value, Ordering::Release);
    }

    pub fn get_and_add_i64(&self, offset: usize, delta: i64) -> i64 {
        self.atomic_i64(offset).fetch_add(delta, Ordering::AcqRel)
    }

    pub fn compare_and_set_i64(&self, offset: usize, expected: i64, update: i64) -> bool {
        self.atomic_i64(offset)
            .compare_exchange(expected, update, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn put_bytes(&self, offset: usize, src: &[u8]) {
        self.bounds_check(offset, src.len());
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }

    pub fn get_bytes(&self, offset: usize, dst: &mut [u8]) {
        self.bounds_check(offset, dst.len());
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }

    pub fn set_memory(&self, offset: usize, length: usize, value: u8) {
        self.bounds_check(offset, length);
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr().add(offset), value, length) }
    }

    /// Borrows `length` bytes at `offset` as a slice.
    ///
    /// # Safety
    ///
    /// No other thread or process may write the range while the slice is alive.
    pub unsafe fn as_slice(&self, offset: usize, length: usize) -> &[u8] {
        self.bounds_check(offset, length);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), length) }
    }

    /// Borrows `length` bytes at `offset` as a mutable slice.
    ///
    /// # Safety
    ///
    /// The caller must hold the range exclusively (e.g. through a tail-counter reservation) for
    /// as long as the slice is alive.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self, offset: usize, length: usize) -> &mut [u8] {
        self.bounds_check(offset, length);
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), length) }
    }

    fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        self.bounds_check(offset, N);
        unsafe { self.ptr.as_ptr().add(offset).cast::<[u8; N]>().read_unaligned() }
    }

    fn write_array<const N: usize>(&self, offset: usize, bytes: [u8; N]) {
        self.bounds_check(offset, N);
        unsafe {
            self.ptr
                .as_ptr()
                .add(offset)
                .cast::<[u8; N]>()
                .write_unaligned(bytes)
        }
    }

    fn atomic_i32(&self, offset: usize) -> &AtomicI32 {
        self.bounds_check(offset, 4);
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        assert_eq!(ptr as usize % 4, 0, "unaligned atomic access at offset {offset}");
        // SAFETY: in bounds, aligned, and the memory lives as long as `self` is valid.
        unsafe { AtomicI32::from_ptr(ptr.cast()) }
    }

    fn atomic_i64(&self, offset: usize) -> &AtomicI64 {
        self.bounds_check(offset, 8);
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        assert_eq!(ptr as usize % 8, 0, "unaligned atomic access at offset {offset}");
        // SAFETY: in bounds, aligned, and the memory lives as long as `self` is valid.
        unsafe { AtomicI64::from_ptr(ptr.cast()) }
    }

    #[inline(always)]
    fn bounds_check(&self, offset: usize, length: usize) {
        assert!(
            offset <= self.len && length <= self.len - offset,
            "access out of bounds: offset={offset} length={length} capacity={}",
            self.len
        );
    }
}

#[cfg(test)]
mod tests {
    use super::AtomicBuffer;
    use std::ptr::NonNull;

    fn with_buffer(len: usize, f: impl FnOnce(AtomicBuffer)) {
        let mut storage = vec![0u64; len / 8];
        let ptr = NonNull::new(storage.as_mut_ptr().cast::<u8>()).expect("ptr");
        let buffer = unsafe { AtomicBuffer::wrap(ptr, len) };
        f(buffer);
        drop(storage);
    }

    #[test]
    fn plain_accessors_are_little_endian() {
        with_buffer(64, |buffer| {
            buffer.put_i32(0, 0x0102_0304);
            let mut bytes = [0u8; 4];
            buffer.get_bytes(0, &mut bytes);
            assert_eq!(bytes, [4, 3, 2, 1]);

            buffer.put_u16(6, 0xBEEF);
            assert_eq!(buffer.get_u8(6), 0xEF);
            assert_eq!(buffer.get_u8(7), 0xBE);

            buffer.put_i64(8, -2);
            assert_eq!(buffer.get_i64(8), -2);
        });
    }

    #[test]
    fn get_and_add_returns_previous_value() {
        with_buffer(64, |buffer| {
            buffer.put_i64_ordered(8, 100);
            assert_eq!(buffer.get_and_add_i64(8, 32), 100);
            assert_eq!(buffer.get_i64_volatile(8), 132);
        });
    }

    #[test]
    fn compare_and_set_only_applies_on_match() {
        with_buffer(64, |buffer| {
            buffer.put_i32_ordered(0, 7);
            assert!(!buffer.compare_and_set_i32(0, 6, 8));
            assert!(buffer.compare_and_set_i32(0, 7, 8));
            assert_eq!(buffer.get_i32_volatile(0), 8);

            buffer.put_i64_ordered(8, 1 << 40);
            assert!(buffer.compare_and_set_i64(8, 1 << 40, 5));
            assert_eq!(buffer.get_i64(8), 5);
        });
    }

    #[test]
    fn view_offsets_into_parent() {
        with_buffer(64, |buffer| {
            let view = buffer.view(32, 16);
            view.put_i32(0, 99);
            assert_eq!(buffer.get_i32(32), 99);
            assert_eq!(view.capacity(), 16);
        });
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn out_of_bounds_access_panics() {
        with_buffer(16, |buffer| {
            buffer.put_i64(12, 1);
        });
    }
}
