//! Purpose: Creation-time parameters for a log and runtime knobs for a publication.
//! Exports: `LogConfig`, `PublicationConfig`, `DEFAULT_TERM_LENGTH`, `DEFAULT_MTU_LENGTH`.
//! Role: Serde-loadable settings validated once, before any memory is touched.
//! Invariants: A validated `LogConfig` always yields a layout `LogBuffers` can initialise.
use std::fs;
use std::path::Path;
use std::time::Duration;

use getrandom::fill as fill_random;
use serde::{Deserialize, Serialize};

use crate::core::descriptor::{check_mtu_length, check_term_length};
use crate::core::error::{Error, ErrorKind, io_error};

pub const DEFAULT_TERM_LENGTH: usize = 16 * 1024 * 1024;
pub const DEFAULT_MTU_LENGTH: usize = 4096;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub term_length: usize,
    pub mtu_length: usize,
    pub initial_term_id: Option<i32>,
    pub session_id: Option<i32>,
    pub stream_id: i32,
    pub registration_id: i64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            term_length: DEFAULT_TERM_LENGTH,
            mtu_length: DEFAULT_MTU_LENGTH,
            initial_term_id: None,
            session_id: None,
            stream_id: 1,
            registration_id: 0,
        }
    }
}

impl LogConfig {
    pub fn new(term_length: usize, mtu_length: usize) -> Self {
        Self {
            term_length,
            mtu_length,
            ..Self::default()
        }
    }

    pub fn with_initial_term_id(mut self, initial_term_id: i32) -> Self {
        self.initial_term_id = Some(initial_term_id);
        self
    }

    pub fn with_session_id(mut self, session_id: i32) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_stream_id(mut self, stream_id: i32) -> Self {
        self.stream_id = stream_id;
        self
    }

    pub fn with_registration_id(mut self, registration_id: i64) -> Self {
        self.registration_id = registration_id;
        self
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| io_error(path, err))?;
        let config: LogConfig = serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("invalid log config")
                .with_path(path)
                .with_source(err)
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        check_term_length(self.term_length)?;
        check_mtu_length(self.mtu_length, self.term_length)?;
        Ok(())
    }

    /// Fills unset ids the way the driver does: uniformly random.
    pub(crate) fn resolve_ids(&self) -> Result<(i32, i32), Error> {
        let initial_term_id = match self.initial_term_id {
            Some(id) => id,
            None => random_i32()?,
        };
        let session_id = match self.session_id {
            Some(id) => id,
            None => random_i32()?,
        };
        Ok((initial_term_id, session_id))
    }
}

fn random_i32() -> Result<i32, Error> {
    let mut bytes = [0u8; 4];
    fill_random(&mut bytes).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message(format!("failed to generate random id: {err}"))
    })?;
    Ok(i32::from_le_bytes(bytes))
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PublicationConfig {
    pub connection_timeout_ms: u64,
}

impl Default for PublicationConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

impl PublicationConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}
