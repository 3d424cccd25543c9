//! Core data models for the migration tool.
//!
//! Wire-format types stay private to the decoders that produce them; what
//! lives here are the immutable values passed between the crawler, the
//! transfer client, the pipeline and the destinations.

pub mod descriptor;
pub mod document;
pub mod entry;
pub mod job;
pub mod object;
