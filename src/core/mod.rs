// Core modules implementing the shared-memory log, the append path, and error modeling.
pub mod appender;
pub mod atomic_buffer;
pub mod claim;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod frame;
pub mod log_buffers;
pub mod position;
pub mod publication;
pub mod scanner;
