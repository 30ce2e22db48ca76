//! Purpose: Byte layout of a log: three terms, their metadata, and the log metadata section.
//! Exports: layout constants, `check_term_length`, `compute_log_length`, `compute_term_length`,
//! `LogMetadata`, `TermStatus`, tail-counter packing helpers.
//! Role: Single source of truth for offsets shared with the driver and any consumer.
//! Invariants: Offsets are computed from constants and the term length; nothing is stored twice
//! except term length, which `LogBuffers::map_existing` cross-checks against the file size.
//!
//! ```text
//!  +----------------------------+
//!  |           Term 0           |
//!  +----------------------------+
//!  |           Term 1           |
//!  +----------------------------+
//!  |           Term 2           |
//!  +----------------------------+
//!  |      Term Meta Data 0      |  tail counter @128, status @256
//!  +----------------------------+
//!  |      Term Meta Data 1      |
//!  +----------------------------+
//!  |      Term Meta Data 2      |
//!  +----------------------------+
//!  |        Log Meta Data       |  active term id @0, time of last SM @128,
//!  +----------------------------+  registration id @256, initial term id @264,
//!                                   default header length @268, MTU @272,
//!                                   term length @276, default header @320
//! ```
use crate::core::atomic_buffer::AtomicBuffer;
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{FRAME_ALIGNMENT, HEADER_LENGTH};

pub const PARTITION_COUNT: usize = 3;
pub const CACHE_LINE_LENGTH: usize = 64;

pub const TERM_MIN_LENGTH: usize = 64 * 1024;
pub const TERM_MAX_LENGTH: usize = 1024 * 1024 * 1024;

pub const TERM_TAIL_COUNTER_OFFSET: usize = CACHE_LINE_LENGTH * 2;
pub const TERM_STATUS_OFFSET: usize = CACHE_LINE_LENGTH * 2 * 2;
pub const TERM_META_DATA_LENGTH: usize = CACHE_LINE_LENGTH * 2 * 3;

pub const LOG_ACTIVE_TERM_ID_OFFSET: usize = 0;
pub const LOG_TIME_OF_LAST_SM_OFFSET: usize = CACHE_LINE_LENGTH * 2;
pub const LOG_REGISTRATION_ID_OFFSET: usize = CACHE_LINE_LENGTH * 4;
pub const LOG_INITIAL_TERM_ID_OFFSET: usize = LOG_REGISTRATION_ID_OFFSET + 8;
pub const LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET: usize = LOG_INITIAL_TERM_ID_OFFSET + 4;
pub const LOG_MTU_LENGTH_OFFSET: usize = LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET + 4;
pub const LOG_TERM_LENGTH_OFFSET: usize = LOG_MTU_LENGTH_OFFSET + 4;
pub const LOG_DEFAULT_FRAME_HEADER_OFFSET: usize = CACHE_LINE_LENGTH * 5;
pub const LOG_DEFAULT_FRAME_HEADER_MAX_LENGTH: usize = CACHE_LINE_LENGTH * 2;
pub const LOG_META_DATA_LENGTH: usize =
    LOG_DEFAULT_FRAME_HEADER_OFFSET + LOG_DEFAULT_FRAME_HEADER_MAX_LENGTH;

const META_DATA_SECTION_LENGTH: usize =
    TERM_META_DATA_LENGTH * PARTITION_COUNT + LOG_META_DATA_LENGTH;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TermStatus {
    Clean = 0,
    NeedsCleaning = 1,
}

impl TermStatus {
    pub fn from_i32(value: i32) -> Result<Self, Error> {
        match value {
            0 => Ok(TermStatus::Clean),
            1 => Ok(TermStatus::NeedsCleaning),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid term status")),
        }
    }
}

pub fn check_term_length(term_length: usize) -> Result<(), Error> {
    if term_length < TERM_MIN_LENGTH {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "term length less than min size of {TERM_MIN_LENGTH}: {term_length}"
        )));
    }
    if term_length > TERM_MAX_LENGTH {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "term length greater than max size of {TERM_MAX_LENGTH}: {term_length}"
        )));
    }
    if !term_length.is_power_of_two() {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("term length not a power of 2: {term_length}")));
    }
    Ok(())
}

pub fn check_mtu_length(mtu_length: usize, term_length: usize) -> Result<(), Error> {
    if mtu_length <= HEADER_LENGTH {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "mtu length must exceed header length of {HEADER_LENGTH}: {mtu_length}"
        )));
    }
    if mtu_length % FRAME_ALIGNMENT != 0 {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "mtu length not a multiple of {FRAME_ALIGNMENT}: {mtu_length}"
        )));
    }
    if mtu_length > term_length {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "mtu length {mtu_length} exceeds term length {term_length}"
        )));
    }
    Ok(())
}

pub fn compute_log_length(term_length: usize) -> usize {
    term_length * PARTITION_COUNT + META_DATA_SECTION_LENGTH
}

pub fn compute_term_length(log_length: usize) -> usize {
    log_length.saturating_sub(META_DATA_SECTION_LENGTH) / PARTITION_COUNT
}

pub fn term_offset_in_log(index: usize, term_length: usize) -> usize {
    index * term_length
}

pub fn term_meta_data_offset_in_log(index: usize, term_length: usize) -> usize {
    term_length * PARTITION_COUNT + index * TERM_META_DATA_LENGTH
}

pub fn log_meta_data_offset_in_log(term_length: usize) -> usize {
    term_length * PARTITION_COUNT + TERM_META_DATA_LENGTH * PARTITION_COUNT
}

pub fn pack_tail(term_id: i32, term_offset: i32) -> i64 {
    ((term_id as i64) << 32) | (term_offset as u32 as i64)
}

pub fn tail_term_id(raw_tail: i64) -> i32 {
    (raw_tail >> 32) as i32
}

/// Offset part of a raw tail, clamped to the term: concurrent reservations can push the raw
/// value past the end of the term.
pub fn tail_term_offset(raw_tail: i64, term_length: usize) -> i32 {
    let tail = raw_tail & 0xFFFF_FFFF;
    tail.min(term_length as i64) as i32
}

/// Typed accessors over the log metadata section.
#[derive(Clone, Copy, Debug)]
pub struct LogMetadata {
    buffer: AtomicBuffer,
}

impl LogMetadata {
    pub fn new(buffer: AtomicBuffer) -> Self {
        Self { buffer }
    }

    pub fn buffer(&self) -> &AtomicBuffer {
        &self.buffer
    }

    pub fn active_term_id(&self) -> i32 {
        self.buffer.get_i32_volatile(LOG_ACTIVE_TERM_ID_OFFSET)
    }

    pub fn set_active_term_id(&self, term_id: i32) {
        self.buffer.put_i32_ordered(LOG_ACTIVE_TERM_ID_OFFSET, term_id);
    }

    /// The rotation publish point.
    pub fn cas_active_term_id(&self, expected: i32, update: i32) -> bool {
        self.buffer
            .compare_and_set_i32(LOG_ACTIVE_TERM_ID_OFFSET, expected, update)
    }

    pub fn time_of_last_status_message(&self) -> i64 {
        self.buffer.get_i64_volatile(LOG_TIME_OF_LAST_SM_OFFSET)
    }

    pub fn set_time_of_last_status_message(&self, time_ms: i64) {
        self.buffer.put_i64_ordered(LOG_TIME_OF_LAST_SM_OFFSET, time_ms);
    }

    pub fn registration_id(&self) -> i64 {
        self.buffer.get_i64(LOG_REGISTRATION_ID_OFFSET)
    }

    pub fn initial_term_id(&self) -> i32 {
        self.buffer.get_i32(LOG_INITIAL_TERM_ID_OFFSET)
    }

    pub fn mtu_length(&self) -> i32 {
        self.buffer.get_i32(LOG_MTU_LENGTH_OFFSET)
    }

    pub fn term_length(&self) -> i32 {
        self.buffer.get_i32(LOG_TERM_LENGTH_OFFSET)
    }

    pub fn default_frame_header_length(&self) -> i32 {
        self.buffer.get_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET)
    }

    pub fn default_frame_header(&self) -> [u8; HEADER_LENGTH] {
        let mut header = [0u8; HEADER_LENGTH];
        self.buffer
            .get_bytes(LOG_DEFAULT_FRAME_HEADER_OFFSET, &mut header);
        header
    }

    pub(crate) fn initialize(
        &self,
        registration_id: i64,
        initial_term_id: i32,
        mtu_length: i32,
        term_length: i32,
        default_header: &[u8; HEADER_LENGTH],
    ) {
        self.buffer.put_i64(LOG_REGISTRATION_ID_OFFSET, registration_id);
        self.buffer.put_i32(LOG_INITIAL_TERM_ID_OFFSET, initial_term_id);
        self.buffer
            .put_i32(LOG_DEFAULT_FRAME_HEADER_LENGTH_OFFSET, HEADER_LENGTH as i32);
        self.buffer.put_i32(LOG_MTU_LENGTH_OFFSET, mtu_length);
        self.buffer.put_i32(LOG_TERM_LENGTH_OFFSET, term_length);
        self.buffer
            .put_bytes(LOG_DEFAULT_FRAME_HEADER_OFFSET, default_header);
        self.set_active_term_id(initial_term_id);
    }
}
