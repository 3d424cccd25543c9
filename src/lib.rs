//! Bulk migration of objects from a Hitachi Content Platform (HCP)
//! namespace into an S3-compatible store.
//!
//! The [`services::crawler`] walks a namespace and emits every object path;
//! the [`services::pipeline`] fetches each path through the
//! [`services::source_client`] and writes it to a
//! [`services::destination::Destination`].

pub mod config;
pub mod errors;
pub mod models;
pub mod paths;
pub mod services;
