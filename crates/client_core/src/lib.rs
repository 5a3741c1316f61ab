//! Foreground half of the voice bridge.
//!
//! A [`Connector`] drives protocol clients living in a background context it
//! never shares memory with. Clients, channels and users are seen through
//! [`mirror`] objects kept current by pushes from the background side;
//! changes are requested through typed calls and voice travels in
//! [`voice`] streams multiplexed over the same link.

pub mod config;
pub mod connector;
pub mod error;
pub mod mirror;
pub mod pending;
pub mod voice;

pub use config::{load_settings, load_settings_from, Settings};
pub use connector::{ChannelCalls, ClientCalls, Connector, Launcher, UserCalls};
pub use error::{classify, ConnectorError, ErrorCategory};
pub use mirror::{ChannelMirror, ClientMirror, ClientSignal, UserMirror};
pub use voice::{
    InboundVoice, OutboundVoice, PlaybackFactory, QueuedPlayback, VoiceFrame, VoiceOrigin,
    VoiceSink,
};
