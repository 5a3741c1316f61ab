//! Envelope vocabulary shared by the foreground connector and the background adapter.

pub mod domain;
pub mod error;
pub mod protocol;
pub mod transport;
