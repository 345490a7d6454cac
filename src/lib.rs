//! Persistent log and entry cache for a consensus-replicated KV service.
//!
//! The durable layer is an append-only, RESP-framed log file paired with a
//! rebuildable offset index; the in-memory layer is a ring cache of the most
//! recently appended entries. The consensus engine drives both through the
//! [`log::LogTrait`] operation table.

pub mod config;
pub mod entry;
pub mod log;
