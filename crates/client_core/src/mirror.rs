//! Foreground mirrors of the background client, channel and user objects.
//!
//! Mirrors only hold the last pushed values. Relations are stored as ids and
//! resolved through the owning [`ClientMirror`], so a removed entity can never
//! be reached through a stale reference.

use std::collections::BTreeMap;

use bytes::Bytes;
use shared::{
    domain::{ChannelId, ClientId, DataStats, ServerVersion, UserId, SAMPLES_PER_FRAME},
    protocol::{ChannelEvent, ChannelProp, ClientEvent, ClientProp, UserEvent, UserProp},
};
use tokio::sync::mpsc;

/// Bitrate requested before the first `setAudioQuality` call.
pub const DEFAULT_BITRATE: u32 = 40_000;

/// Explicit listener list for one entity. Closed listeners are pruned on emit.
#[derive(Debug)]
pub struct Subscribers<E> {
    senders: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
        }
    }
}

impl<E: Clone> Subscribers<E> {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.push(tx);
        rx
    }

    pub fn emit(&mut self, event: &E) {
        self.senders.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

/// What client subscribers observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientSignal {
    Event(ClientEvent),
    PropertyChanged(ClientProp),
}

#[derive(Debug)]
pub struct ChannelMirror {
    pub id: ChannelId,
    pub client_id: ClientId,
    pub position: i32,
    pub name: String,
    pub description: String,
    pub parent: Option<ChannelId>,
    pub links: Vec<ChannelId>,
    subscribers: Subscribers<ChannelEvent>,
}

impl ChannelMirror {
    fn new(client_id: ClientId, id: ChannelId) -> Self {
        Self {
            id,
            client_id,
            position: 0,
            name: String::new(),
            description: String::new(),
            parent: None,
            links: Vec::new(),
            subscribers: Subscribers::default(),
        }
    }

    pub fn apply(&mut self, prop: ChannelProp) {
        match prop {
            ChannelProp::Position(v) => self.position = v,
            ChannelProp::Name(v) => self.name = v,
            ChannelProp::Description(v) => self.description = v,
            ChannelProp::Parent(v) => self.parent = v,
            ChannelProp::Links(v) => self.links = v,
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.subscribers.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[derive(Debug)]
pub struct UserMirror {
    pub id: UserId,
    pub client_id: ClientId,
    pub unique_id: Option<u32>,
    pub username: String,
    pub mute: bool,
    pub deaf: bool,
    pub suppress: bool,
    pub self_mute: bool,
    pub self_deaf: bool,
    pub texture: Option<Bytes>,
    pub texture_hash: Option<Bytes>,
    pub comment: Option<String>,
    pub channel: Option<ChannelId>,
    subscribers: Subscribers<UserEvent>,
}

impl UserMirror {
    fn new(client_id: ClientId, id: UserId) -> Self {
        Self {
            id,
            client_id,
            unique_id: None,
            username: String::new(),
            mute: false,
            deaf: false,
            suppress: false,
            self_mute: false,
            self_deaf: false,
            texture: None,
            texture_hash: None,
            comment: None,
            channel: None,
            subscribers: Subscribers::default(),
        }
    }

    pub fn apply(&mut self, prop: UserProp) {
        match prop {
            UserProp::UniqueId(v) => self.unique_id = v,
            UserProp::Username(v) => self.username = v,
            UserProp::Mute(v) => self.mute = v,
            UserProp::Deaf(v) => self.deaf = v,
            UserProp::Suppress(v) => self.suppress = v,
            UserProp::SelfMute(v) => self.self_mute = v,
            UserProp::SelfDeaf(v) => self.self_deaf = v,
            UserProp::Texture(v) => self.texture = v,
            UserProp::TextureHash(v) => self.texture_hash = v,
            UserProp::Comment(v) => self.comment = v,
            UserProp::Channel(v) => self.channel = v,
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<UserEvent> {
        self.subscribers.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioQuality {
    pub bitrate: u32,
    pub frames_per_packet: u32,
}

impl Default for AudioQuality {
    fn default() -> Self {
        Self {
            bitrate: DEFAULT_BITRATE,
            frames_per_packet: 1,
        }
    }
}

#[derive(Debug)]
pub struct ClientMirror {
    pub id: ClientId,
    pub root_id: Option<ChannelId>,
    pub self_id: Option<UserId>,
    pub welcome_message: Option<String>,
    pub server_version: Option<ServerVersion>,
    pub max_bandwidth: Option<u32>,
    pub data_stats: DataStats,
    pub audio_quality: AudioQuality,
    channels: BTreeMap<ChannelId, ChannelMirror>,
    users: BTreeMap<UserId, UserMirror>,
    subscribers: Subscribers<ClientSignal>,
}

impl ClientMirror {
    pub fn new(id: ClientId) -> Self {
        Self {
            id,
            root_id: None,
            self_id: None,
            welcome_message: None,
            server_version: None,
            max_bandwidth: None,
            data_stats: DataStats::default(),
            audio_quality: AudioQuality::default(),
            channels: BTreeMap::new(),
            users: BTreeMap::new(),
            subscribers: Subscribers::default(),
        }
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ClientSignal> {
        self.subscribers.subscribe()
    }

    /// Returns the channel mirror for `id`, creating it on first reference.
    pub fn channel_entry(&mut self, id: ChannelId) -> &mut ChannelMirror {
        let client_id = self.id;
        self.channels
            .entry(id)
            .or_insert_with(|| ChannelMirror::new(client_id, id))
    }

    pub fn user_entry(&mut self, id: UserId) -> &mut UserMirror {
        let client_id = self.id;
        self.users
            .entry(id)
            .or_insert_with(|| UserMirror::new(client_id, id))
    }

    pub fn channel(&self, id: ChannelId) -> Option<&ChannelMirror> {
        self.channels.get(&id)
    }

    pub fn channel_mut(&mut self, id: ChannelId) -> Option<&mut ChannelMirror> {
        self.channels.get_mut(&id)
    }

    pub fn user(&self, id: UserId) -> Option<&UserMirror> {
        self.users.get(&id)
    }

    pub fn user_mut(&mut self, id: UserId) -> Option<&mut UserMirror> {
        self.users.get_mut(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelMirror> {
        self.channels.values()
    }

    pub fn users(&self) -> impl Iterator<Item = &UserMirror> {
        self.users.values()
    }

    pub fn root(&self) -> Option<&ChannelMirror> {
        self.root_id.and_then(|id| self.channel(id))
    }

    pub fn self_user(&self) -> Option<&UserMirror> {
        self.self_id.and_then(|id| self.user(id))
    }

    pub fn parent_of(&self, channel: ChannelId) -> Option<&ChannelMirror> {
        self.channel(channel)?.parent.and_then(|id| self.channel(id))
    }

    pub fn children_of(&self, channel: ChannelId) -> Vec<&ChannelMirror> {
        self.channels
            .values()
            .filter(|child| child.parent == Some(channel))
            .collect()
    }

    pub fn links_of(&self, channel: ChannelId) -> Vec<&ChannelMirror> {
        let Some(mirror) = self.channel(channel) else {
            return Vec::new();
        };
        mirror
            .links
            .iter()
            .filter_map(|id| self.channel(*id))
            .collect()
    }

    pub fn channel_of_user(&self, user: UserId) -> Option<&ChannelMirror> {
        self.user(user)?.channel.and_then(|id| self.channel(id))
    }

    pub fn users_in(&self, channel: ChannelId) -> Vec<&UserMirror> {
        self.users
            .values()
            .filter(|user| user.channel == Some(channel))
            .collect()
    }

    pub fn apply_property(&mut self, prop: ClientProp) {
        match &prop {
            ClientProp::Root(id) => {
                self.root_id = Some(*id);
                self.channel_entry(*id);
            }
            ClientProp::SelfUser(id) => {
                self.self_id = Some(*id);
                self.user_entry(*id);
            }
            ClientProp::WelcomeMessage(v) => self.welcome_message = v.clone(),
            ClientProp::ServerVersion(v) => self.server_version = v.clone(),
            ClientProp::MaxBandwidth(v) => self.max_bandwidth = *v,
            ClientProp::DataStats(v) => self.data_stats = *v,
        }
        self.subscribers.emit(&ClientSignal::PropertyChanged(prop));
    }

    pub fn apply_channel_property(&mut self, channel: ChannelId, prop: ChannelProp) {
        self.materialize_channel_refs(&prop);
        self.channel_entry(channel).apply(prop);
    }

    pub fn apply_user_property(&mut self, user: UserId, prop: UserProp) {
        if let UserProp::Channel(Some(channel)) = &prop {
            self.channel_entry(*channel);
        }
        self.user_entry(user).apply(prop);
    }

    pub fn handle_client_event(&mut self, event: ClientEvent) {
        match &event {
            ClientEvent::NewChannel(id) => {
                self.channel_entry(*id);
            }
            ClientEvent::NewUser(id) => {
                self.user_entry(*id);
            }
            ClientEvent::Message(message) => {
                if let Some(sender) = message.sender {
                    self.user_entry(sender);
                }
                for user in &message.users {
                    self.user_entry(*user);
                }
                for channel in message.channels.iter().chain(&message.trees) {
                    self.channel_entry(*channel);
                }
            }
            ClientEvent::Error(_) => {}
        }
        self.subscribers.emit(&ClientSignal::Event(event));
    }

    /// Applies a channel event and re-emits it. `remove` drops the mirror
    /// after its subscribers have been told.
    pub fn handle_channel_event(&mut self, channel: ChannelId, event: ChannelEvent) {
        match &event {
            ChannelEvent::Update { changes, .. } => {
                for change in changes {
                    self.materialize_channel_refs(change);
                }
                let mirror = self.channel_entry(channel);
                for change in changes {
                    mirror.apply(change.clone());
                }
                mirror.subscribers.emit(&event);
            }
            ChannelEvent::Remove => {
                if let Some(mut mirror) = self.channels.remove(&channel) {
                    mirror.subscribers.emit(&event);
                }
            }
        }
    }

    pub fn handle_user_event(&mut self, user: UserId, event: UserEvent) {
        match &event {
            UserEvent::Update { actor, changes } => {
                if let Some(actor) = actor {
                    self.user_entry(*actor);
                }
                for change in changes {
                    if let UserProp::Channel(Some(channel)) = change {
                        self.channel_entry(*channel);
                    }
                }
                let mirror = self.user_entry(user);
                for change in changes {
                    mirror.apply(change.clone());
                }
                mirror.subscribers.emit(&event);
            }
            UserEvent::Voice { .. } => self.user_entry(user).subscribers.emit(&event),
            UserEvent::Remove => {
                if let Some(mut mirror) = self.users.remove(&user) {
                    mirror.subscribers.emit(&event);
                }
            }
        }
    }

    fn materialize_channel_refs(&mut self, prop: &ChannelProp) {
        match prop {
            ChannelProp::Parent(Some(parent)) => {
                self.channel_entry(*parent);
            }
            ChannelProp::Links(links) => {
                for link in links {
                    self.channel_entry(*link);
                }
            }
            _ => {}
        }
    }

    /// Highest codec bitrate that fits the server's bandwidth limit.
    pub fn max_bitrate(&self, samples_per_packet: u32, positional: bool) -> Option<u32> {
        let overhead = enforceable_bandwidth(0, samples_per_packet, positional);
        self.max_bandwidth
            .map(|limit| limit.saturating_sub(overhead))
    }

    /// Bitrate the codec will actually use: the requested one, capped by
    /// [`ClientMirror::max_bitrate`] when the server announced a limit.
    pub fn actual_bitrate(&self, samples_per_packet: u32, positional: bool) -> u32 {
        let requested = self.audio_quality.bitrate;
        match self.max_bitrate(samples_per_packet, positional) {
            Some(max) => requested.min(max),
            None => requested,
        }
    }
}

/// Bandwidth in bit/s a stream at `bitrate` occupies on the wire, including
/// IP, UDP, crypt, header and sequence overhead for every packet.
pub fn enforceable_bandwidth(bitrate: u32, samples_per_packet: u32, positional: bool) -> u32 {
    let frames = (samples_per_packet / SAMPLES_PER_FRAME).max(1);
    let positional_bytes = if positional { 12 } else { 0 };
    let overhead_bytes = 20 + 8 + 4 + 1 + 2 + positional_bytes + frames;
    overhead_bytes * 800 / frames + bitrate
}

#[cfg(test)]
#[path = "tests/mirror_tests.rs"]
mod tests;
