//! Background half of the voice bridge.
//!
//! Hosts protocol clients behind the [`client`] traits and exposes them to the
//! foreground through envelopes on a [`shared::transport::Link`].

pub mod adapter;
pub mod client;
pub mod resample;
pub mod simulated;

pub use adapter::{launcher, BackgroundAdapter};
pub use client::{
    AudioPacket, Connected, OutboundAudio, ProtocolChannel, ProtocolClient, ProtocolConnector,
    ProtocolEvent, ProtocolUser,
};
pub use simulated::{SimulatedConnector, SimulatedServer, SimulatedServerBuilder};
