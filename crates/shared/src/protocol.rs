use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{
        ChannelId, ClientId, ConnectArgs, DataStats, RequestId, ServerVersion, UserId, VoiceId,
        VoiceTarget,
    },
    error::{ProtocolError, RemoteError},
};

/// One unit exchanged over the link, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Request(Request),
    Response(Response),
    Event(EventPush),
    Property(PropertyPush),
    Voice(VoiceChunk),
}

impl Envelope {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response(_) => "response",
            Self::Event(_) => "event",
            Self::Property(_) => "property",
            Self::Voice(_) => "voice",
        }
    }
}

/// Composite key addressing one proxied entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityKey {
    Client {
        client_id: ClientId,
    },
    Channel {
        client_id: ClientId,
        channel_id: ChannelId,
    },
    User {
        client_id: ClientId,
        user_id: UserId,
    },
}

impl EntityKey {
    pub fn client_id(&self) -> ClientId {
        match *self {
            Self::Client { client_id }
            | Self::Channel { client_id, .. }
            | Self::User { client_id, .. } => client_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub req_id: RequestId,
    pub call: Call,
}

/// Every operation the foreground may ask of the background side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Call {
    Connector(ConnectorCall),
    Client {
        client_id: ClientId,
        call: ClientCall,
    },
    Channel {
        client_id: ClientId,
        channel_id: ChannelId,
        call: ChannelCall,
    },
    User {
        client_id: ClientId,
        user_id: UserId,
        call: UserCall,
    },
}

impl Call {
    /// Entity addressed by this call, `None` for connector-level calls.
    pub fn key(&self) -> Option<EntityKey> {
        match *self {
            Self::Connector(_) => None,
            Self::Client { client_id, .. } => Some(EntityKey::Client { client_id }),
            Self::Channel {
                client_id,
                channel_id,
                ..
            } => Some(EntityKey::Channel {
                client_id,
                channel_id,
            }),
            Self::User {
                client_id, user_id, ..
            } => Some(EntityKey::User { client_id, user_id }),
        }
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Connector(call) => call.method_name(),
            Self::Client { call, .. } => call.method_name(),
            Self::Channel { call, .. } => call.method_name(),
            Self::User { call, .. } => call.method_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum ConnectorCall {
    #[serde(rename = "_init")]
    Init { sample_rate: u32 },
    #[serde(rename = "_connect")]
    Connect { host: String, args: ConnectArgs },
}

impl ConnectorCall {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Init { .. } => "_init",
            Self::Connect { .. } => "_connect",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum ClientCall {
    Disconnect,
    SetSelfMute(bool),
    SetSelfDeaf(bool),
    SetSelfTexture(Option<Bytes>),
    SetAudioQuality {
        bitrate: u32,
        frames_per_packet: u32,
    },
    CreateVoiceStream {
        voice_id: VoiceId,
        samples_per_packet: u32,
        target: VoiceTarget,
    },
}

impl ClientCall {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::SetSelfMute(_) => "setSelfMute",
            Self::SetSelfDeaf(_) => "setSelfDeaf",
            Self::SetSelfTexture(_) => "setSelfTexture",
            Self::SetAudioQuality { .. } => "setAudioQuality",
            Self::CreateVoiceStream { .. } => "createVoiceStream",
        }
    }

    /// Builds a one-way call from its method name and positional arguments.
    ///
    /// `createVoiceStream` is not reachable by name: it needs a voice id that
    /// only the connector can allocate.
    pub fn parse(method: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        match method {
            "disconnect" => Ok(Self::Disconnect),
            "setSelfMute" => Ok(Self::SetSelfMute(arg(method, args, 0)?)),
            "setSelfDeaf" => Ok(Self::SetSelfDeaf(arg(method, args, 0)?)),
            "setSelfTexture" => {
                let texture: Option<Vec<u8>> = arg(method, args, 0)?;
                Ok(Self::SetSelfTexture(texture.map(Bytes::from)))
            }
            "setAudioQuality" => Ok(Self::SetAudioQuality {
                bitrate: arg(method, args, 0)?,
                frames_per_packet: arg(method, args, 1)?,
            }),
            _ => Err(unsupported("client", method)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum ChannelCall {
    SendMessage(String),
}

impl ChannelCall {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::SendMessage(_) => "sendMessage",
        }
    }

    pub fn parse(method: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        match method {
            "sendMessage" => Ok(Self::SendMessage(arg(method, args, 0)?)),
            _ => Err(unsupported("channel", method)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "camelCase")]
pub enum UserCall {
    SetMute(bool),
    SetDeaf(bool),
    SetChannel(ChannelId),
    SendMessage(String),
    RequestTexture,
    ClearTexture,
}

impl UserCall {
    pub fn method_name(&self) -> &'static str {
        match self {
            Self::SetMute(_) => "setMute",
            Self::SetDeaf(_) => "setDeaf",
            Self::SetChannel(_) => "setChannel",
            Self::SendMessage(_) => "sendMessage",
            Self::RequestTexture => "requestTexture",
            Self::ClearTexture => "clearTexture",
        }
    }

    pub fn parse(method: &str, args: &[Value]) -> Result<Self, ProtocolError> {
        match method {
            "setMute" => Ok(Self::SetMute(arg(method, args, 0)?)),
            "setDeaf" => Ok(Self::SetDeaf(arg(method, args, 0)?)),
            "setChannel" => Ok(Self::SetChannel(ChannelId(arg(method, args, 0)?))),
            "sendMessage" => Ok(Self::SendMessage(arg(method, args, 0)?)),
            "requestTexture" => Ok(Self::RequestTexture),
            "clearTexture" => Ok(Self::ClearTexture),
            _ => Err(unsupported("user", method)),
        }
    }
}

fn arg<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> Result<T, ProtocolError> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|err| ProtocolError::InvalidArguments {
        method: method.to_string(),
        reason: format!("argument {index}: {err}"),
    })
}

fn unsupported(entity: &'static str, method: &str) -> ProtocolError {
    ProtocolError::UnsupportedMethod {
        entity,
        method: method.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub req_id: RequestId,
    pub outcome: Outcome,
}

impl Response {
    pub fn ok(req_id: RequestId, value: ResponseValue) -> Self {
        Self {
            req_id,
            outcome: Outcome::Result(value),
        }
    }

    pub fn err(req_id: RequestId, error: RemoteError) -> Self {
        Self {
            req_id,
            outcome: Outcome::Error(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Result(ResponseValue),
    Error(RemoteError),
}

impl Outcome {
    pub fn into_result(self) -> Result<ResponseValue, RemoteError> {
        match self {
            Self::Result(value) => Ok(value),
            Self::Error(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResponseValue {
    Unit,
    Client(ClientId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPush {
    Client {
        client_id: ClientId,
        event: ClientEvent,
    },
    Channel {
        client_id: ClientId,
        channel_id: ChannelId,
        event: ChannelEvent,
    },
    User {
        client_id: ClientId,
        user_id: UserId,
        event: UserEvent,
    },
}

impl EventPush {
    pub fn key(&self) -> EntityKey {
        match *self {
            Self::Client { client_id, .. } => EntityKey::Client { client_id },
            Self::Channel {
                client_id,
                channel_id,
                ..
            } => EntityKey::Channel {
                client_id,
                channel_id,
            },
            Self::User {
                client_id, user_id, ..
            } => EntityKey::User { client_id, user_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "camelCase")]
pub enum ClientEvent {
    Error(RemoteError),
    NewChannel(ChannelId),
    NewUser(UserId),
    Message(TextMessage),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextMessage {
    pub sender: Option<UserId>,
    pub text: String,
    pub users: Vec<UserId>,
    pub channels: Vec<ChannelId>,
    pub trees: Vec<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "camelCase")]
pub enum ChannelEvent {
    Update {
        actor: Option<UserId>,
        changes: Vec<ChannelProp>,
    },
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "value", rename_all = "camelCase")]
pub enum UserEvent {
    Update {
        actor: Option<UserId>,
        changes: Vec<UserProp>,
    },
    /// A user started talking; chunks follow on `voice_id`, each tagged with
    /// its own target.
    Voice { voice_id: VoiceId },
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyPush {
    Client {
        client_id: ClientId,
        prop: ClientProp,
    },
    Channel {
        client_id: ClientId,
        channel_id: ChannelId,
        prop: ChannelProp,
    },
    User {
        client_id: ClientId,
        user_id: UserId,
        prop: UserProp,
    },
}

impl PropertyPush {
    pub fn key(&self) -> EntityKey {
        match *self {
            Self::Client { client_id, .. } => EntityKey::Client { client_id },
            Self::Channel {
                client_id,
                channel_id,
                ..
            } => EntityKey::Channel {
                client_id,
                channel_id,
            },
            Self::User {
                client_id, user_id, ..
            } => EntityKey::User { client_id, user_id },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "prop", content = "value", rename_all = "camelCase")]
pub enum ClientProp {
    Root(ChannelId),
    #[serde(rename = "self")]
    SelfUser(UserId),
    WelcomeMessage(Option<String>),
    ServerVersion(Option<ServerVersion>),
    MaxBandwidth(Option<u32>),
    DataStats(DataStats),
}

impl ClientProp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Root(_) => "root",
            Self::SelfUser(_) => "self",
            Self::WelcomeMessage(_) => "welcomeMessage",
            Self::ServerVersion(_) => "serverVersion",
            Self::MaxBandwidth(_) => "maxBandwidth",
            Self::DataStats(_) => "dataStats",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "prop", content = "value", rename_all = "camelCase")]
pub enum ChannelProp {
    Position(i32),
    Name(String),
    Description(String),
    Parent(Option<ChannelId>),
    Links(Vec<ChannelId>),
}

impl ChannelProp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Position(_) => "position",
            Self::Name(_) => "name",
            Self::Description(_) => "description",
            Self::Parent(_) => "parent",
            Self::Links(_) => "links",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "prop", content = "value", rename_all = "camelCase")]
pub enum UserProp {
    UniqueId(Option<u32>),
    Username(String),
    Mute(bool),
    Deaf(bool),
    Suppress(bool),
    SelfMute(bool),
    SelfDeaf(bool),
    Texture(Option<Bytes>),
    TextureHash(Option<Bytes>),
    Comment(Option<String>),
    Channel(Option<ChannelId>),
}

impl UserProp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::UniqueId(_) => "uniqueId",
            Self::Username(_) => "username",
            Self::Mute(_) => "mute",
            Self::Deaf(_) => "deaf",
            Self::Suppress(_) => "suppress",
            Self::SelfMute(_) => "selfMute",
            Self::SelfDeaf(_) => "selfDeaf",
            Self::Texture(_) => "texture",
            Self::TextureHash(_) => "textureHash",
            Self::Comment(_) => "comment",
            Self::Channel(_) => "channel",
        }
    }
}

/// A slice of a voice stream. No buffer marks the end of the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceChunk {
    pub voice_id: VoiceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<VoiceTarget>,
}

impl VoiceChunk {
    pub fn data(voice_id: VoiceId, buffer: Bytes, target: Option<VoiceTarget>) -> Self {
        Self {
            voice_id,
            buffer: Some(buffer),
            target,
        }
    }

    pub fn end(voice_id: VoiceId) -> Self {
        Self {
            voice_id,
            buffer: None,
            target: None,
        }
    }

    pub fn is_end(&self) -> bool {
        self.buffer.is_none()
    }
}

/// Little-endian `f32` PCM packing used by voice chunk buffers.
pub mod pcm {
    use bytes::{BufMut, Bytes, BytesMut};

    pub fn encode(samples: &[f32]) -> Bytes {
        let mut buf = BytesMut::with_capacity(samples.len() * 4);
        for sample in samples {
            buf.put_f32_le(*sample);
        }
        buf.freeze()
    }

    /// Trailing bytes that do not form a whole sample are ignored.
    pub fn decode(buf: &[u8]) -> Vec<f32> {
        buf.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
