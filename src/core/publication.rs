//! Purpose: Multi-producer append surface over a mapped three-term log.
//! Exports: `Publication`, `OfferError`, `encode_result`, `decode_result`, sentinel codes.
//! Role: Applies the flow-control gate, picks the active partition, and rotates terms.
//! Invariants: A gated or rejected append leaves every tail counter untouched.
//! Invariants: A rotation resets the reused partition's tail before the active term id moves;
//! the active term id CAS is the publication point.
//! Invariants: At most one internal retry per call; persistent failure surfaces as `AdminAction`.
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::appender::{AppendOutcome, TermAppender};
use crate::core::claim::BufferClaim;
use crate::core::config::PublicationConfig;
use crate::core::descriptor::{self, LogMetadata, PARTITION_COUNT, TermStatus};
use crate::core::driver::{Conductor, EpochClock, PositionReader, SystemEpochClock};
use crate::core::error::{Error, ErrorKind};
use crate::core::frame::{self, HEADER_LENGTH, HeaderWriter};
use crate::core::log_buffers::LogBuffers;
use crate::core::position;

pub const NOT_CONNECTED: i64 = -1;
pub const BACK_PRESSURED: i64 = -2;
pub const ADMIN_ACTION: i64 = -3;
pub const PUBLICATION_CLOSED: i64 = -4;
pub const MAX_POSITION_EXCEEDED: i64 = -5;
pub const MAX_PAYLOAD_EXCEEDED: i64 = -6;

const MAX_ATTEMPTS: usize = 2;

/// Why an append did not happen. None of these leave a partial frame behind.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OfferError {
    /// The limit is gated and no consumer has ever advanced it.
    NotConnected,
    BackPressured,
    /// Another writer is mid-rotation; retry.
    AdminAction,
    Closed,
    MaxPositionExceeded,
    MaxPayloadExceeded { length: usize, max: usize },
}

impl OfferError {
    pub fn code(&self) -> i64 {
        match self {
            OfferError::NotConnected => NOT_CONNECTED,
            OfferError::BackPressured => BACK_PRESSURED,
            OfferError::AdminAction => ADMIN_ACTION,
            OfferError::Closed => PUBLICATION_CLOSED,
            OfferError::MaxPositionExceeded => MAX_POSITION_EXCEEDED,
            OfferError::MaxPayloadExceeded { .. } => MAX_PAYLOAD_EXCEEDED,
        }
    }

    /// Maps a sentinel back to its variant. The payload sizes of `MaxPayloadExceeded` are not
    /// carried by the code and come back as zero.
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            NOT_CONNECTED => Some(OfferError::NotConnected),
            BACK_PRESSURED => Some(OfferError::BackPressured),
            ADMIN_ACTION => Some(OfferError::AdminAction),
            PUBLICATION_CLOSED => Some(OfferError::Closed),
            MAX_POSITION_EXCEEDED => Some(OfferError::MaxPositionExceeded),
            MAX_PAYLOAD_EXCEEDED => Some(OfferError::MaxPayloadExceeded { length: 0, max: 0 }),
            _ => None,
        }
    }

    /// Whether the same call can succeed later without the caller changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OfferError::NotConnected | OfferError::BackPressured | OfferError::AdminAction
        )
    }
}

impl fmt::Display for OfferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OfferError::NotConnected => f.write_str("not connected"),
            OfferError::BackPressured => f.write_str("back pressured"),
            OfferError::AdminAction => f.write_str("admin action in progress"),
            OfferError::Closed => f.write_str("publication closed"),
            OfferError::MaxPositionExceeded => f.write_str("max stream position exceeded"),
            OfferError::MaxPayloadExceeded { length, max } => {
                write!(f, "payload of {length} bytes exceeds max payload {max}")
            }
        }
    }
}

impl std::error::Error for OfferError {}

/// Flattens an append result into a single `i64`: positions are non-negative, failures are
/// their negative sentinel codes.
pub fn encode_result(result: Result<i64, OfferError>) -> i64 {
    match result {
        Ok(position) => position,
        Err(err) => err.code(),
    }
}

/// Inverse of `encode_result`; `None` for a negative value that is not a known code.
pub fn decode_result(value: i64) -> Option<Result<i64, OfferError>> {
    if value >= 0 {
        return Some(Ok(value));
    }
    OfferError::from_code(value).map(Err)
}

struct Reserved {
    partition: usize,
    frame_offset: usize,
    frame_length: usize,
    position: i64,
}

pub struct Publication {
    conductor: Arc<dyn Conductor>,
    clock: Arc<dyn EpochClock>,
    publication_limit: Arc<dyn PositionReader>,
    log_buffers: Arc<LogBuffers>,
    log_metadata: LogMetadata,
    appenders: [TermAppender; PARTITION_COUNT],
    header_writer: HeaderWriter,
    channel: String,
    registration_id: i64,
    stream_id: i32,
    session_id: i32,
    initial_term_id: i32,
    term_length: usize,
    max_payload_length: usize,
    position_bits_to_shift: u32,
    max_possible_position: i64,
    connection_timeout_ms: i64,
    closed: AtomicBool,
}

impl Publication {
    /// Binds a publication to an initialised log. The header template, initial term id and MTU
    /// come from the log metadata; `stream_id` and `session_id` must match the template, since
    /// every frame is stamped from it.
    pub fn new(
        conductor: Arc<dyn Conductor>,
        channel: impl Into<String>,
        registration_id: i64,
        stream_id: i32,
        session_id: i32,
        publication_limit: Arc<dyn PositionReader>,
        log_buffers: Arc<LogBuffers>,
    ) -> Result<Self, Error> {
        let log_metadata = log_buffers.log_metadata();
        let header_writer = HeaderWriter::from_template(&log_metadata.default_frame_header())?;
        if header_writer.stream_id() != stream_id || header_writer.session_id() != session_id {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!(
                    "publication ids (stream {stream_id}, session {session_id}) do not match the \
                     log header (stream {}, session {})",
                    header_writer.stream_id(),
                    header_writer.session_id()
                ))
                .with_hint("Pass the stream and session ids the log was created with."));
        }
        let term_length = log_buffers.term_length();
        let appenders = [0, 1, 2].map(|index| {
            TermAppender::new(
                log_buffers.term_buffer(index),
                log_buffers.term_meta_buffer(index),
            )
        });
        let max_payload_length = (log_metadata.mtu_length() as usize).saturating_sub(HEADER_LENGTH);

        let publication = Self {
            conductor,
            clock: Arc::new(SystemEpochClock),
            publication_limit,
            log_metadata,
            appenders,
            header_writer,
            channel: channel.into(),
            registration_id,
            stream_id,
            session_id,
            initial_term_id: log_metadata.initial_term_id(),
            term_length,
            max_payload_length,
            position_bits_to_shift: position::position_bits_to_shift(term_length),
            max_possible_position: position::compute_max_possible_position(term_length),
            connection_timeout_ms: PublicationConfig::default().connection_timeout_ms as i64,
            closed: AtomicBool::new(false),
            log_buffers,
        };
        tracing::debug!(
            registration_id,
            stream_id,
            session_id,
            channel = %publication.channel,
            "publication bound to log"
        );
        Ok(publication)
    }

    pub fn with_config(mut self, config: &PublicationConfig) -> Self {
        self.connection_timeout_ms = config.connection_timeout_ms.min(i64::MAX as u64) as i64;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn EpochClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn initial_term_id(&self) -> i32 {
        self.initial_term_id
    }

    pub fn term_buffer_length(&self) -> usize {
        self.term_length
    }

    pub fn max_payload_length(&self) -> usize {
        self.max_payload_length
    }

    /// Largest message `offer` accepts. Messages are never fragmented, so this is the max
    /// payload of a single frame.
    pub fn max_message_length(&self) -> usize {
        self.max_payload_length
    }

    pub fn max_possible_position(&self) -> i64 {
        self.max_possible_position
    }

    pub fn position_limit(&self) -> i64 {
        self.publication_limit.get_volatile()
    }

    pub fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.log_buffers
    }

    /// True once a consumer has ever opened the flow-control window.
    pub fn has_been_connected(&self) -> bool {
        self.publication_limit.get_volatile() > 0
    }

    /// Whether the driver has heard from a consumer within the connection timeout.
    pub fn is_still_connected(&self) -> bool {
        let last = self.log_metadata.time_of_last_status_message();
        self.clock.time_ms() <= last.saturating_add(self.connection_timeout_ms)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops further appends and releases the registration. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.conductor.release_publication(self.registration_id);
        tracing::info!(
            registration_id = self.registration_id,
            stream_id = self.stream_id,
            session_id = self.session_id,
            "publication closed"
        );
    }

    /// Stream position of the active term's tail, clamped to the end of that term.
    pub fn position(&self) -> Result<i64, OfferError> {
        if self.is_closed() {
            return Err(OfferError::Closed);
        }
        let term_id = self.log_metadata.active_term_id();
        let raw_tail = self.active_appender(term_id).raw_tail_volatile();
        Ok(self.tail_position(raw_tail))
    }

    /// Copies `payload` into the log as one frame. Returns the stream position after it.
    pub fn offer(&self, payload: &[u8]) -> Result<i64, OfferError> {
        let header = &self.header_writer;
        self.append(payload.len(), |appender| {
            appender.append_unfragmented(header, payload)
        })
        .map(|reserved| reserved.position)
    }

    /// As `offer`; `reserved_value` sees the written frame before commit and its result lands in
    /// the header's reserved field.
    pub fn offer_with_reserved_value(
        &self,
        payload: &[u8],
        reserved_value: impl Fn(&[u8]) -> i64,
    ) -> Result<i64, OfferError> {
        let header = &self.header_writer;
        self.append(payload.len(), |appender| {
            appender.append_unfragmented_with_reserved_value(header, payload, &reserved_value)
        })
        .map(|reserved| reserved.position)
    }

    /// Reserves room for `length` payload bytes to be written in place. The frame stays
    /// invisible to consumers until the claim is committed.
    pub fn try_claim(&self, length: usize) -> Result<BufferClaim<'_>, OfferError> {
        let header = &self.header_writer;
        let reserved = self.append(length, |appender| appender.claim(header, length))?;
        let frame = self.appenders[reserved.partition]
            .term_buffer()
            .view(reserved.frame_offset, reserved.frame_length);
        Ok(BufferClaim::new(frame, reserved.position))
    }

    fn append(
        &self,
        length: usize,
        mut op: impl FnMut(&TermAppender) -> AppendOutcome,
    ) -> Result<Reserved, OfferError> {
        if self.is_closed() {
            return Err(OfferError::Closed);
        }
        if length > self.max_payload_length {
            return Err(OfferError::MaxPayloadExceeded {
                length,
                max: self.max_payload_length,
            });
        }
        let aligned_length = frame::aligned_frame_length(length) as i64;

        for _ in 0..MAX_ATTEMPTS {
            let limit = self.publication_limit.get_volatile();
            let term_id = self.log_metadata.active_term_id();
            let partition = position::partition_index(term_id, self.initial_term_id);
            let appender = &self.appenders[partition];
            let current = self.tail_position(appender.raw_tail_volatile());

            if current + aligned_length > self.max_possible_position {
                return Err(OfferError::MaxPositionExceeded);
            }
            if current + aligned_length > limit {
                return Err(if limit > 0 {
                    OfferError::BackPressured
                } else {
                    OfferError::NotConnected
                });
            }

            match op(appender) {
                AppendOutcome::Appended {
                    term_id,
                    frame_offset,
                    frame_length,
                    resulting_offset,
                } => {
                    return Ok(Reserved {
                        partition,
                        frame_offset,
                        frame_length,
                        position: position::compute_position(
                            term_id,
                            resulting_offset as i32,
                            self.position_bits_to_shift,
                            self.initial_term_id,
                        ),
                    });
                }
                AppendOutcome::Tripped { term_id } | AppendOutcome::Failed { term_id } => {
                    self.rotate_term(term_id);
                }
            }
        }
        Err(OfferError::AdminAction)
    }

    /// Moves the log from `term_id` to the next term. Any number of writers may call this for
    /// the same term; the partition is reset once and the active term id moves once.
    fn rotate_term(&self, term_id: i32) {
        let next_term_id = term_id.wrapping_add(1);
        let stale_term_id = next_term_id.wrapping_sub(PARTITION_COUNT as i32);
        let next = &self.appenders[position::partition_index(next_term_id, self.initial_term_id)];

        loop {
            let raw_tail = next.raw_tail_volatile();
            if descriptor::tail_term_id(raw_tail) != stale_term_id {
                break;
            }
            // A late writer still appending to the stale term moves the raw tail; re-read and
            // try again until the reset lands or someone else's does.
            if next.reset_tail(raw_tail, next_term_id) {
                let retiring = position::partition_index(
                    next_term_id.wrapping_add(1),
                    self.initial_term_id,
                );
                self.appenders[retiring].status_ordered(TermStatus::NeedsCleaning);
                tracing::debug!(
                    from_term_id = term_id,
                    to_term_id = next_term_id,
                    retiring_partition = retiring,
                    "rotated term"
                );
                break;
            }
        }

        self.log_metadata.cas_active_term_id(term_id, next_term_id);
    }

    fn active_appender(&self, term_id: i32) -> &TermAppender {
        &self.appenders[position::partition_index(term_id, self.initial_term_id)]
    }

    fn tail_position(&self, raw_tail: i64) -> i64 {
        position::compute_position(
            descriptor::tail_term_id(raw_tail),
            descriptor::tail_term_offset(raw_tail, self.term_length),
            self.position_bits_to_shift,
            self.initial_term_id,
        )
    }
}

impl Drop for Publication {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Publication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publication")
            .field("channel", &self.channel)
            .field("registration_id", &self.registration_id)
            .field("stream_id", &self.stream_id)
            .field("session_id", &self.session_id)
            .field("initial_term_id", &self.initial_term_id)
            .field("term_length", &self.term_length)
            .field("closed", &self.is_closed())
            .finish()
    }
}
