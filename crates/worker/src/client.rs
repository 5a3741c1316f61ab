//! Surface of the real protocol client the adapter drives.
//!
//! Entities are reported by their protocol ids. Lookups return owned handles
//! so implementations are free to keep their state behind shared ownership.

use async_trait::async_trait;
use bytes::Bytes;
use shared::{
    domain::{ChannelId, ConnectArgs, DataStats, ServerVersion, UserId, VoiceTarget},
    protocol::{ChannelProp, UserProp},
};
use tokio::sync::mpsc;

/// One decoded packet of remote speech at the protocol sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioPacket {
    pub pcm: Vec<f32>,
    pub target: VoiceTarget,
}

/// Remote speech; the stream ends when the sender is dropped.
pub type InboundAudio = mpsc::Receiver<AudioPacket>;

#[derive(Debug)]
pub enum ProtocolEvent {
    Error(anyhow::Error),
    NewChannel(ChannelId),
    NewUser(UserId),
    Message {
        sender: Option<UserId>,
        text: String,
        users: Vec<UserId>,
        channels: Vec<ChannelId>,
        trees: Vec<ChannelId>,
    },
    DataPing,
    ChannelUpdate {
        channel: ChannelId,
        actor: Option<UserId>,
        changes: Vec<ChannelProp>,
    },
    ChannelRemove(ChannelId),
    UserUpdate {
        user: UserId,
        actor: Option<UserId>,
        changes: Vec<UserProp>,
    },
    UserRemove(UserId),
    UserVoice {
        user: UserId,
        stream: InboundAudio,
    },
}

pub struct Connected {
    pub client: Box<dyn ProtocolClient>,
    pub events: mpsc::UnboundedReceiver<ProtocolEvent>,
}

#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn connect(&self, host: &str, args: ConnectArgs) -> anyhow::Result<Connected>;
}

pub trait ProtocolClient: Send {
    fn root(&self) -> ChannelId;
    fn self_user(&self) -> UserId;
    fn welcome_message(&self) -> Option<String>;
    fn server_version(&self) -> Option<ServerVersion>;
    fn max_bandwidth(&self) -> Option<u32>;
    fn data_stats(&self) -> DataStats;
    fn user_ids(&self) -> Vec<UserId>;
    fn channel(&self, id: ChannelId) -> Option<Box<dyn ProtocolChannel>>;
    fn user(&self, id: UserId) -> Option<Box<dyn ProtocolUser>>;

    fn disconnect(&mut self);
    fn set_self_mute(&mut self, mute: bool);
    fn set_self_deaf(&mut self, deaf: bool);
    fn set_self_texture(&mut self, texture: Option<Bytes>);
    fn set_audio_quality(&mut self, bitrate: u32, frames_per_packet: u32);
    fn create_voice_stream(&mut self, target: VoiceTarget)
        -> anyhow::Result<Box<dyn OutboundAudio>>;
}

pub trait ProtocolChannel: Send {
    fn position(&self) -> i32;
    fn name(&self) -> String;
    fn description(&self) -> String;
    fn parent(&self) -> Option<ChannelId>;
    fn links(&self) -> Vec<ChannelId>;
    fn children(&self) -> Vec<ChannelId>;

    fn send_message(&mut self, text: &str);
}

pub trait ProtocolUser: Send {
    fn unique_id(&self) -> Option<u32>;
    fn username(&self) -> String;
    fn mute(&self) -> bool;
    fn deaf(&self) -> bool;
    fn suppress(&self) -> bool;
    fn self_mute(&self) -> bool;
    fn self_deaf(&self) -> bool;
    fn texture(&self) -> Option<Bytes>;
    fn texture_hash(&self) -> Option<Bytes>;
    fn comment(&self) -> Option<String>;
    fn channel(&self) -> Option<ChannelId>;

    fn set_mute(&mut self, mute: bool);
    fn set_deaf(&mut self, deaf: bool);
    fn set_channel(&mut self, channel: ChannelId);
    fn send_message(&mut self, text: &str);
    fn request_texture(&mut self);
    fn clear_texture(&mut self);
}

/// Microphone audio going to the server, written in whole packets at the
/// protocol sample rate.
pub trait OutboundAudio: Send {
    fn write(&mut self, packet: &[f32]) -> anyhow::Result<()>;
    fn end(&mut self);
}

/// Whitelisted channel properties in push order.
pub fn channel_props(channel: &dyn ProtocolChannel) -> Vec<ChannelProp> {
    vec![
        ChannelProp::Parent(channel.parent()),
        ChannelProp::Links(channel.links()),
        ChannelProp::Position(channel.position()),
        ChannelProp::Name(channel.name()),
        ChannelProp::Description(channel.description()),
    ]
}

/// Whitelisted user properties in push order, channel first.
pub fn user_props(user: &dyn ProtocolUser) -> Vec<UserProp> {
    vec![
        UserProp::Channel(user.channel()),
        UserProp::UniqueId(user.unique_id()),
        UserProp::Username(user.username()),
        UserProp::Mute(user.mute()),
        UserProp::Deaf(user.deaf()),
        UserProp::Suppress(user.suppress()),
        UserProp::SelfMute(user.self_mute()),
        UserProp::SelfDeaf(user.self_deaf()),
        UserProp::Texture(user.texture()),
        UserProp::TextureHash(user.texture_hash()),
        UserProp::Comment(user.comment()),
    ]
}
