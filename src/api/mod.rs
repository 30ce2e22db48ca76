//! Purpose: Define the stable public Rust API boundary for termlog.
//! Exports: Log creation/mapping, the publication and its claim handle, reader-side scanning.
//! Role: Public, additive-only surface over the core modules.
//! Invariants: Everything an application needs to publish is reachable from here.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::claim::BufferClaim;
pub use crate::core::config::{LogConfig, PublicationConfig};
pub use crate::core::descriptor::{LogMetadata, PARTITION_COUNT, TermStatus};
pub use crate::core::driver::{
    AtomicCounter, Conductor, EpochClock, NoopConductor, PositionReader, SystemEpochClock,
};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::frame::{FrameHeader, FrameType, HEADER_LENGTH};
pub use crate::core::log_buffers::LogBuffers;
pub use crate::core::publication::{OfferError, Publication, decode_result, encode_result};
pub use crate::core::scanner::{FrameIter, ScanOutcome, scan_for_availability};
