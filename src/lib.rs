//! Purpose: Lock-free multi-producer publisher over a three-term shared-memory log.
//! Exports: `core` (layout, frames, appenders, publication, errors) and `api` (stable surface).
//! Role: Library backing the `termlog` CLI and any in-process publisher.
//! Invariants: The log format is little-endian and its counters are native atomics, so only
//! little-endian targets are supported.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
#[cfg(not(target_endian = "little"))]
compile_error!("termlog only supports little-endian targets");

pub mod api;
pub mod core;
