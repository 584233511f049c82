//! CQL binary protocol primitives: frame header handling, request
//! serialization, response deserialization and the `CqlValue` cell model.
//!
//! This crate is the wire-level half of the murena driver. It knows how to
//! turn requests into CQL protocol v4 frames and parse the frames coming
//! back, but has no notion of sessions, pools or retries - that lives in
//! the `murena` crate.

pub mod frame;
pub mod value;

pub use frame::types::{Consistency, SerialConsistency};
pub use frame::Compression;
pub use value::CqlValue;
