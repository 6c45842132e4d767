//! Cocoon shared types - wire-level definitions used by both the host
//! runtime and the guest supervisor.
//!
//! This crate contains the request surface, resource descriptors, error
//! taxonomy, transport addressing and guest filesystem layout. It has no
//! runtime behavior of its own.

pub mod errors;
pub mod layout;
pub mod protocol;
pub mod remotefs;
pub mod transport;

pub use errors::{CocoonError, CocoonResult, WireError};
pub use transport::Transport;
