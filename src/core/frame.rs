// Data frame header layout, alignment helpers, and the commit (length) publish point.
use crate::core::atomic_buffer::AtomicBuffer;
use crate::core::error::{Error, ErrorKind};

pub const HEADER_LENGTH: usize = 32;
pub const FRAME_ALIGNMENT: usize = 32;

pub const FRAME_LENGTH_FIELD_OFFSET: usize = 0;
pub const VERSION_FIELD_OFFSET: usize = 4;
pub const FLAGS_FIELD_OFFSET: usize = 5;
pub const TYPE_FIELD_OFFSET: usize = 6;
pub const TERM_OFFSET_FIELD_OFFSET: usize = 8;
pub const SESSION_ID_FIELD_OFFSET: usize = 12;
pub const STREAM_ID_FIELD_OFFSET: usize = 16;
pub const TERM_ID_FIELD_OFFSET: usize = 20;
pub const RESERVED_VALUE_FIELD_OFFSET: usize = 24;

pub const CURRENT_VERSION: u8 = 0;
pub const BEGIN_FRAG_FLAG: u8 = 0x80;
pub const END_FRAG_FLAG: u8 = 0x40;
pub const UNFRAGMENTED: u8 = BEGIN_FRAG_FLAG | END_FRAG_FLAG;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FrameType {
    Pad = 1,
    Data = 2,
}

impl FrameType {
    pub fn from_u16(value: u16) -> Result<Self, Error> {
        match value {
            1 => Ok(FrameType::Pad),
            2 => Ok(FrameType::Data),
            _ => Err(Error::new(ErrorKind::Corrupt).with_message("invalid frame type")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: FrameType,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}

impl FrameHeader {
    pub fn data(
        frame_length: i32,
        term_offset: i32,
        session_id: i32,
        stream_id: i32,
        term_id: i32,
    ) -> Self {
        Self {
            frame_length,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: FrameType::Data,
            term_offset,
            session_id,
            stream_id,
            term_id,
            reserved_value: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        write_i32(&mut buf, FRAME_LENGTH_FIELD_OFFSET, self.frame_length);
        buf[VERSION_FIELD_OFFSET] = self.version;
        buf[FLAGS_FIELD_OFFSET] = self.flags;
        buf[TYPE_FIELD_OFFSET..TYPE_FIELD_OFFSET + 2]
            .copy_from_slice(&(self.frame_type as u16).to_le_bytes());
        write_i32(&mut buf, TERM_OFFSET_FIELD_OFFSET, self.term_offset);
        write_i32(&mut buf, SESSION_ID_FIELD_OFFSET, self.session_id);
        write_i32(&mut buf, STREAM_ID_FIELD_OFFSET, self.stream_id);
        write_i32(&mut buf, TERM_ID_FIELD_OFFSET, self.term_id);
        buf[RESERVED_VALUE_FIELD_OFFSET..RESERVED_VALUE_FIELD_OFFSET + 8]
            .copy_from_slice(&self.reserved_value.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_LENGTH {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame header too small"));
        }
        let frame_type = FrameType::from_u16(u16::from_le_bytes(read_2(buf, TYPE_FIELD_OFFSET)))?;
        Ok(Self {
            frame_length: read_i32(buf, FRAME_LENGTH_FIELD_OFFSET),
            version: buf[VERSION_FIELD_OFFSET],
            flags: buf[FLAGS_FIELD_OFFSET],
            frame_type,
            term_offset: read_i32(buf, TERM_OFFSET_FIELD_OFFSET),
            session_id: read_i32(buf, SESSION_ID_FIELD_OFFSET),
            stream_id: read_i32(buf, STREAM_ID_FIELD_OFFSET),
            term_id: read_i32(buf, TERM_ID_FIELD_OFFSET),
            reserved_value: i64::from_le_bytes(read_8(buf, RESERVED_VALUE_FIELD_OFFSET)),
        })
    }

    /// Reads a committed header out of a term, using the acquire load on the length field.
    pub fn read_committed(term: &AtomicBuffer, offset: usize) -> Result<Option<Self>, Error> {
        if frame_length_volatile(term, offset) <= 0 {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_LENGTH];
        term.get_bytes(offset, &mut buf);
        Self::decode(&buf).map(Some)
    }

    pub fn validate(&self, term_length: usize) -> Result<(), Error> {
        if self.version != CURRENT_VERSION {
            return Err(Error::new(ErrorKind::Corrupt).with_message("unsupported frame version"));
        }
        if self.frame_length < HEADER_LENGTH as i32 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("frame shorter than header"));
        }
        if self.term_offset < 0 {
            return Err(Error::new(ErrorKind::Corrupt).with_message("negative frame term offset"));
        }
        let aligned = align_frame_length(self.frame_length as usize);
        match (self.term_offset as usize).checked_add(aligned) {
            Some(end) if end <= term_length => Ok(()),
            _ => Err(Error::new(ErrorKind::Corrupt)
                .with_message("frame extends past end of term")
                .with_offset(self.term_offset as u64)),
        }
    }

    pub fn payload_length(&self) -> usize {
        (self.frame_length as usize).saturating_sub(HEADER_LENGTH)
    }

    pub fn is_padding(&self) -> bool {
        self.frame_type == FrameType::Pad
    }
}

/// Writes the per-publication fields from the log's default header template.
#[derive(Clone, Copy, Debug)]
pub struct HeaderWriter {
    version_flags_type: [u8; 4],
    session_id: i32,
    stream_id: i32,
}

impl HeaderWriter {
    pub fn from_template(template: &[u8]) -> Result<Self, Error> {
        let header = FrameHeader::decode(template)?;
        Ok(Self::new(header.session_id, header.stream_id))
    }

    pub fn new(session_id: i32, stream_id: i32) -> Self {
        let type_bytes = (FrameType::Data as u16).to_le_bytes();
        Self {
            version_flags_type: [CURRENT_VERSION, UNFRAGMENTED, type_bytes[0], type_bytes[1]],
            session_id,
            stream_id,
        }
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Writes every header field except a non-zero length; the frame stays invisible to
    /// consumers until `frame_length_ordered` publishes it.
    pub fn write(&self, term: &AtomicBuffer, offset: usize, term_id: i32) {
        term.put_i32_ordered(offset + FRAME_LENGTH_FIELD_OFFSET, 0);
        term.put_bytes(offset + VERSION_FIELD_OFFSET, &self.version_flags_type);
        term.put_i32(offset + TERM_OFFSET_FIELD_OFFSET, offset as i32);
        term.put_i32(offset + SESSION_ID_FIELD_OFFSET, self.session_id);
        term.put_i32(offset + STREAM_ID_FIELD_OFFSET, self.stream_id);
        term.put_i32(offset + TERM_ID_FIELD_OFFSET, term_id);
        term.put_i64(offset + RESERVED_VALUE_FIELD_OFFSET, 0);
    }
}

pub fn align_frame_length(length: usize) -> usize {
    (length + FRAME_ALIGNMENT - 1) & !(FRAME_ALIGNMENT - 1)
}

/// Aligned on-log footprint of a message carrying `payload_length` bytes.
pub fn aligned_frame_length(payload_length: usize) -> usize {
    align_frame_length(payload_length + HEADER_LENGTH)
}

pub fn frame_length_volatile(term: &AtomicBuffer, offset: usize) -> i32 {
    term.get_i32_volatile(offset + FRAME_LENGTH_FIELD_OFFSET)
}

/// The publish point: everything written to the frame before this store is visible to any
/// reader whose acquire load observes the non-zero length.
pub fn frame_length_ordered(term: &AtomicBuffer, offset: usize, length: i32) {
    term.put_i32_ordered(offset + FRAME_LENGTH_FIELD_OFFSET, length);
}

pub fn frame_type(term: &AtomicBuffer, offset: usize, frame_type: FrameType) {
    term.put_u16(offset + TYPE_FIELD_OFFSET, frame_type as u16);
}

pub fn frame_flags(term: &AtomicBuffer, offset: usize, flags: u8) {
    term.put_u8(offset + FLAGS_FIELD_OFFSET, flags);
}

pub fn is_padding_frame(term: &AtomicBuffer, offset: usize) -> bool {
    term.get_u16(offset + TYPE_FIELD_OFFSET) == FrameType::Pad as u16
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    i32::from_le_bytes(read_4(buf, offset))
}

fn read_2(buf: &[u8], offset: usize) -> [u8; 2] {
    let mut out = [0u8; 2];
    out.copy_from_slice(&buf[offset..offset + 2]);
    out
}

fn read_4(buf: &[u8], offset: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    out
}

fn read_8(buf: &[u8], offset: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    out
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}
