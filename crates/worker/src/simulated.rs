//! In-memory voice server standing in for a real protocol client.
//!
//! Backs the desktop demo and the test suites. The [`SimulatedServer`] handle
//! drives server-side changes (new channels, moves, speech) and records every
//! call the adapter forwards, so both sides of the bridge can be observed.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use shared::{
    domain::{ChannelId, ConnectArgs, DataStats, ServerVersion, UserId, VoiceTarget},
    error::RejectReason,
    protocol::{ChannelProp, UserProp},
};
use tokio::sync::mpsc;
use tracing::debug;

use crate::client::{
    AudioPacket, Connected, OutboundAudio, ProtocolChannel, ProtocolClient, ProtocolConnector,
    ProtocolEvent, ProtocolUser,
};

#[derive(Debug, Clone, Default)]
struct SimChannel {
    position: i32,
    name: String,
    description: String,
    parent: Option<ChannelId>,
    links: Vec<ChannelId>,
}

#[derive(Debug, Clone, Default)]
struct SimUser {
    unique_id: Option<u32>,
    username: String,
    mute: bool,
    deaf: bool,
    suppress: bool,
    self_mute: bool,
    self_deaf: bool,
    texture: Option<Bytes>,
    texture_hash: Option<Bytes>,
    comment: Option<String>,
    channel: Option<ChannelId>,
}

/// Audio received from one outbound voice stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedStream {
    pub target: VoiceTarget,
    pub packets: Vec<Vec<f32>>,
    pub ended: bool,
}

#[derive(Default)]
struct ServerState {
    root: ChannelId,
    self_user: UserId,
    welcome_message: Option<String>,
    server_version: Option<ServerVersion>,
    max_bandwidth: Option<u32>,
    data_stats: DataStats,
    channels: BTreeMap<ChannelId, SimChannel>,
    users: BTreeMap<UserId, SimUser>,
    reject: Option<RejectReason>,
    connected_as: Option<(String, ConnectArgs)>,
    events: Option<mpsc::UnboundedSender<ProtocolEvent>>,
    calls: Vec<String>,
    outbound: Vec<RecordedStream>,
}

impl ServerState {
    fn emit(&self, event: ProtocolEvent) {
        match &self.events {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("simulated client dropped; event discarded");
                }
            }
            None => debug!("no client connected; event discarded"),
        }
    }

    fn record(&mut self, call: String) {
        debug!(call = %call, "simulated server received call");
        self.calls.push(call);
    }

    fn children_of(&self, id: ChannelId) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, channel)| channel.parent == Some(id))
            .map(|(child, _)| *child)
            .collect()
    }
}

type Shared = Arc<Mutex<ServerState>>;

fn lock(state: &Shared) -> MutexGuard<'_, ServerState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Builder for the server's initial tree and roster.
pub struct SimulatedServerBuilder {
    state: ServerState,
}

impl Default for SimulatedServerBuilder {
    fn default() -> Self {
        let mut state = ServerState {
            welcome_message: Some("Welcome to the simulated server".into()),
            server_version: Some(ServerVersion {
                major: 1,
                minor: 4,
                patch: 0,
                release: "simulated".into(),
                os: "rust".into(),
                os_version: env!("CARGO_PKG_VERSION").into(),
            }),
            max_bandwidth: Some(558_000),
            ..ServerState::default()
        };
        state.channels.insert(
            ChannelId(0),
            SimChannel {
                name: "Root".into(),
                ..SimChannel::default()
            },
        );
        Self { state }
    }
}

impl SimulatedServerBuilder {
    pub fn root_name(mut self, name: impl Into<String>) -> Self {
        if let Some(root) = self.state.channels.get_mut(&self.state.root) {
            root.name = name.into();
        }
        self
    }

    pub fn channel(mut self, id: u32, parent: u32, name: impl Into<String>) -> Self {
        let position = self.state.channels.len() as i32;
        self.state.channels.insert(
            ChannelId(id),
            SimChannel {
                position,
                name: name.into(),
                parent: Some(ChannelId(parent)),
                ..SimChannel::default()
            },
        );
        self
    }

    pub fn link(mut self, a: u32, b: u32) -> Self {
        if let Some(channel) = self.state.channels.get_mut(&ChannelId(a)) {
            channel.links.push(ChannelId(b));
        }
        if let Some(channel) = self.state.channels.get_mut(&ChannelId(b)) {
            channel.links.push(ChannelId(a));
        }
        self
    }

    pub fn user(
        mut self,
        id: u32,
        username: impl Into<String>,
        unique_id: Option<u32>,
        channel: u32,
    ) -> Self {
        self.state.users.insert(
            UserId(id),
            SimUser {
                unique_id,
                username: username.into(),
                channel: Some(ChannelId(channel)),
                ..SimUser::default()
            },
        );
        self
    }

    pub fn self_user(mut self, id: u32) -> Self {
        self.state.self_user = UserId(id);
        self
    }

    pub fn reject_with(mut self, reason: RejectReason) -> Self {
        self.state.reject = Some(reason);
        self
    }

    pub fn build(self) -> (SimulatedConnector, SimulatedServer) {
        let state = Arc::new(Mutex::new(self.state));
        (
            SimulatedConnector {
                state: state.clone(),
            },
            SimulatedServer { state },
        )
    }
}

pub struct SimulatedConnector {
    state: Shared,
}

impl SimulatedConnector {
    pub fn builder() -> SimulatedServerBuilder {
        SimulatedServerBuilder::default()
    }
}

#[async_trait]
impl ProtocolConnector for SimulatedConnector {
    async fn connect(&self, host: &str, args: ConnectArgs) -> anyhow::Result<Connected> {
        let mut state = lock(&self.state);
        if let Some(reason) = state.reject.clone() {
            return Err(anyhow::Error::new(reason).context(format!("connecting to {host}")));
        }
        if args.username.trim().is_empty() {
            return Err(anyhow::Error::new(RejectReason::InvalidUsername(args.username))
                .context(format!("connecting to {host}")));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.events = Some(tx);
        state.connected_as = Some((host.to_string(), args));
        Ok(Connected {
            client: Box::new(SimClient {
                state: self.state.clone(),
            }),
            events: rx,
        })
    }
}

/// Test and demo handle onto the server side.
#[derive(Clone)]
pub struct SimulatedServer {
    state: Shared,
}

impl SimulatedServer {
    pub fn connected_as(&self) -> Option<(String, ConnectArgs)> {
        lock(&self.state).connected_as.clone()
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.state).calls.clone()
    }

    pub fn outbound_streams(&self) -> Vec<RecordedStream> {
        lock(&self.state).outbound.clone()
    }

    pub fn add_channel(&self, id: u32, parent: u32, name: &str) {
        let mut state = lock(&self.state);
        let position = state.channels.len() as i32;
        state.channels.insert(
            ChannelId(id),
            SimChannel {
                position,
                name: name.into(),
                parent: Some(ChannelId(parent)),
                ..SimChannel::default()
            },
        );
        state.emit(ProtocolEvent::NewChannel(ChannelId(id)));
    }

    pub fn rename_channel(&self, id: u32, name: &str) {
        let mut state = lock(&self.state);
        let Some(channel) = state.channels.get_mut(&ChannelId(id)) else {
            return;
        };
        channel.name = name.into();
        state.emit(ProtocolEvent::ChannelUpdate {
            channel: ChannelId(id),
            actor: None,
            changes: vec![ChannelProp::Name(name.into())],
        });
    }

    pub fn move_channel(&self, id: u32, parent: u32) {
        let mut state = lock(&self.state);
        let Some(channel) = state.channels.get_mut(&ChannelId(id)) else {
            return;
        };
        channel.parent = Some(ChannelId(parent));
        state.emit(ProtocolEvent::ChannelUpdate {
            channel: ChannelId(id),
            actor: None,
            changes: vec![ChannelProp::Parent(Some(ChannelId(parent)))],
        });
    }

    pub fn remove_channel(&self, id: u32) {
        let mut state = lock(&self.state);
        if state.channels.remove(&ChannelId(id)).is_some() {
            state.emit(ProtocolEvent::ChannelRemove(ChannelId(id)));
        }
    }

    pub fn add_user(&self, id: u32, username: &str, unique_id: Option<u32>, channel: u32) {
        let mut state = lock(&self.state);
        state.users.insert(
            UserId(id),
            SimUser {
                unique_id,
                username: username.into(),
                channel: Some(ChannelId(channel)),
                ..SimUser::default()
            },
        );
        state.emit(ProtocolEvent::NewUser(UserId(id)));
    }

    pub fn move_user(&self, id: u32, channel: u32, actor: Option<u32>) {
        let mut state = lock(&self.state);
        move_user(&mut state, UserId(id), ChannelId(channel), actor.map(UserId));
    }

    pub fn remove_user(&self, id: u32) {
        let mut state = lock(&self.state);
        if state.users.remove(&UserId(id)).is_some() {
            state.emit(ProtocolEvent::UserRemove(UserId(id)));
        }
    }

    /// Starts remote speech from `user`; drop the sender to end it.
    pub fn start_voice(&self, user: u32) -> mpsc::Sender<AudioPacket> {
        let (tx, rx) = mpsc::channel(64);
        lock(&self.state).emit(ProtocolEvent::UserVoice {
            user: UserId(user),
            stream: rx,
        });
        tx
    }

    pub fn text_message(&self, sender: Option<u32>, text: &str, channels: &[u32]) {
        lock(&self.state).emit(ProtocolEvent::Message {
            sender: sender.map(UserId),
            text: text.into(),
            users: Vec::new(),
            channels: channels.iter().copied().map(ChannelId).collect(),
            trees: Vec::new(),
        });
    }

    pub fn data_ping(&self, stats: DataStats) {
        let mut state = lock(&self.state);
        state.data_stats = stats;
        state.emit(ProtocolEvent::DataPing);
    }

    pub fn fail(&self, message: &str) {
        lock(&self.state).emit(ProtocolEvent::Error(anyhow!(message.to_string())));
    }
}

fn move_user(state: &mut ServerState, user: UserId, channel: ChannelId, actor: Option<UserId>) {
    let Some(entry) = state.users.get_mut(&user) else {
        return;
    };
    entry.channel = Some(channel);
    state.emit(ProtocolEvent::UserUpdate {
        user,
        actor,
        changes: vec![UserProp::Channel(Some(channel))],
    });
}

fn update_user(state: &mut ServerState, user: UserId, change: UserProp) {
    let Some(entry) = state.users.get_mut(&user) else {
        return;
    };
    match &change {
        UserProp::Mute(v) => entry.mute = *v,
        UserProp::Deaf(v) => entry.deaf = *v,
        UserProp::SelfMute(v) => entry.self_mute = *v,
        UserProp::SelfDeaf(v) => entry.self_deaf = *v,
        UserProp::Texture(v) => entry.texture = v.clone(),
        _ => {}
    }
    let actor = Some(state.self_user);
    state.emit(ProtocolEvent::UserUpdate {
        user,
        actor,
        changes: vec![change],
    });
}

struct SimClient {
    state: Shared,
}

impl ProtocolClient for SimClient {
    fn root(&self) -> ChannelId {
        lock(&self.state).root
    }

    fn self_user(&self) -> UserId {
        lock(&self.state).self_user
    }

    fn welcome_message(&self) -> Option<String> {
        lock(&self.state).welcome_message.clone()
    }

    fn server_version(&self) -> Option<ServerVersion> {
        lock(&self.state).server_version.clone()
    }

    fn max_bandwidth(&self) -> Option<u32> {
        lock(&self.state).max_bandwidth
    }

    fn data_stats(&self) -> DataStats {
        lock(&self.state).data_stats
    }

    fn user_ids(&self) -> Vec<UserId> {
        lock(&self.state).users.keys().copied().collect()
    }

    fn channel(&self, id: ChannelId) -> Option<Box<dyn ProtocolChannel>> {
        if !lock(&self.state).channels.contains_key(&id) {
            return None;
        }
        Some(Box::new(SimChannelHandle {
            state: self.state.clone(),
            id,
        }))
    }

    fn user(&self, id: UserId) -> Option<Box<dyn ProtocolUser>> {
        if !lock(&self.state).users.contains_key(&id) {
            return None;
        }
        Some(Box::new(SimUserHandle {
            state: self.state.clone(),
            id,
        }))
    }

    fn disconnect(&mut self) {
        let mut state = lock(&self.state);
        state.record("disconnect()".into());
        state.events = None;
    }

    fn set_self_mute(&mut self, mute: bool) {
        let mut state = lock(&self.state);
        state.record(format!("setSelfMute({mute})"));
        let me = state.self_user;
        update_user(&mut state, me, UserProp::SelfMute(mute));
    }

    fn set_self_deaf(&mut self, deaf: bool) {
        let mut state = lock(&self.state);
        state.record(format!("setSelfDeaf({deaf})"));
        let me = state.self_user;
        update_user(&mut state, me, UserProp::SelfDeaf(deaf));
    }

    fn set_self_texture(&mut self, texture: Option<Bytes>) {
        let mut state = lock(&self.state);
        state.record(format!(
            "setSelfTexture({})",
            texture.as_ref().map_or(0, Bytes::len)
        ));
        let me = state.self_user;
        update_user(&mut state, me, UserProp::Texture(texture));
    }

    fn set_audio_quality(&mut self, bitrate: u32, frames_per_packet: u32) {
        lock(&self.state).record(format!("setAudioQuality({bitrate}, {frames_per_packet})"));
    }

    fn create_voice_stream(
        &mut self,
        target: VoiceTarget,
    ) -> anyhow::Result<Box<dyn OutboundAudio>> {
        let mut state = lock(&self.state);
        state.record(format!("createVoiceStream({target:?})"));
        state.outbound.push(RecordedStream {
            target,
            ..RecordedStream::default()
        });
        let index = state.outbound.len() - 1;
        Ok(Box::new(SimOutbound {
            state: self.state.clone(),
            index,
        }))
    }
}

struct SimChannelHandle {
    state: Shared,
    id: ChannelId,
}

impl SimChannelHandle {
    fn read<T>(&self, f: impl FnOnce(&SimChannel) -> T) -> T
    where
        T: Default,
    {
        lock(&self.state).channels.get(&self.id).map(f).unwrap_or_default()
    }
}

impl ProtocolChannel for SimChannelHandle {
    fn position(&self) -> i32 {
        self.read(|c| c.position)
    }

    fn name(&self) -> String {
        self.read(|c| c.name.clone())
    }

    fn description(&self) -> String {
        self.read(|c| c.description.clone())
    }

    fn parent(&self) -> Option<ChannelId> {
        self.read(|c| c.parent)
    }

    fn links(&self) -> Vec<ChannelId> {
        self.read(|c| c.links.clone())
    }

    fn children(&self) -> Vec<ChannelId> {
        lock(&self.state).children_of(self.id)
    }

    fn send_message(&mut self, text: &str) {
        lock(&self.state).record(format!("channel {} sendMessage({text})", self.id));
    }
}

struct SimUserHandle {
    state: Shared,
    id: UserId,
}

impl SimUserHandle {
    fn read<T>(&self, f: impl FnOnce(&SimUser) -> T) -> T
    where
        T: Default,
    {
        lock(&self.state).users.get(&self.id).map(f).unwrap_or_default()
    }
}

impl ProtocolUser for SimUserHandle {
    fn unique_id(&self) -> Option<u32> {
        self.read(|u| u.unique_id)
    }

    fn username(&self) -> String {
        self.read(|u| u.username.clone())
    }

    fn mute(&self) -> bool {
        self.read(|u| u.mute)
    }

    fn deaf(&self) -> bool {
        self.read(|u| u.deaf)
    }

    fn suppress(&self) -> bool {
        self.read(|u| u.suppress)
    }

    fn self_mute(&self) -> bool {
        self.read(|u| u.self_mute)
    }

    fn self_deaf(&self) -> bool {
        self.read(|u| u.self_deaf)
    }

    fn texture(&self) -> Option<Bytes> {
        self.read(|u| u.texture.clone())
    }

    fn texture_hash(&self) -> Option<Bytes> {
        self.read(|u| u.texture_hash.clone())
    }

    fn comment(&self) -> Option<String> {
        self.read(|u| u.comment.clone())
    }

    fn channel(&self) -> Option<ChannelId> {
        self.read(|u| u.channel)
    }

    fn set_mute(&mut self, mute: bool) {
        let mut state = lock(&self.state);
        state.record(format!("user {} setMute({mute})", self.id));
        update_user(&mut state, self.id, UserProp::Mute(mute));
    }

    fn set_deaf(&mut self, deaf: bool) {
        let mut state = lock(&self.state);
        state.record(format!("user {} setDeaf({deaf})", self.id));
        update_user(&mut state, self.id, UserProp::Deaf(deaf));
    }

    fn set_channel(&mut self, channel: ChannelId) {
        let mut state = lock(&self.state);
        state.record(format!("user {} setChannel({channel})", self.id));
        let actor = Some(state.self_user);
        move_user(&mut state, self.id, channel, actor);
    }

    fn send_message(&mut self, text: &str) {
        lock(&self.state).record(format!("user {} sendMessage({text})", self.id));
    }

    fn request_texture(&mut self) {
        lock(&self.state).record(format!("user {} requestTexture()", self.id));
    }

    fn clear_texture(&mut self) {
        lock(&self.state).record(format!("user {} clearTexture()", self.id));
    }
}

struct SimOutbound {
    state: Shared,
    index: usize,
}

impl OutboundAudio for SimOutbound {
    fn write(&mut self, packet: &[f32]) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        let stream = state
            .outbound
            .get_mut(self.index)
            .ok_or_else(|| anyhow!("voice stream {} vanished", self.index))?;
        if stream.ended {
            return Err(anyhow!("voice stream {} already ended", self.index));
        }
        stream.packets.push(packet.to_vec());
        Ok(())
    }

    fn end(&mut self) {
        if let Some(stream) = lock(&self.state).outbound.get_mut(self.index) {
            stream.ended = true;
        }
    }
}
