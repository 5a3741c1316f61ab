use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident, $inner:ty) => {
        #[derive(
            Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(ClientId, u32);
id_newtype!(ChannelId, u32);
id_newtype!(UserId, u32);
id_newtype!(VoiceId, u32);
id_newtype!(RequestId, u64);

/// Sample rate spoken by the voice protocol on both directions.
pub const PROTOCOL_SAMPLE_RATE: u32 = 48_000;

/// Samples in one 10 ms frame at the protocol rate.
pub const SAMPLES_PER_FRAME: u32 = 480;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceTarget {
    #[default]
    Normal,
    Shout,
    Whisper,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectArgs {
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerVersion {
    pub major: u16,
    pub minor: u8,
    pub patch: u8,
    pub release: String,
    pub os: String,
    pub os_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PingStats {
    pub packets: u32,
    pub average_ms: f32,
    pub variance: f32,
}

/// Connection quality snapshot refreshed on every data ping.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DataStats {
    pub udp: PingStats,
    pub tcp: PingStats,
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}
