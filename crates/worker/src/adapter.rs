//! Background side of the bridge.
//!
//! The adapter owns every real protocol client, answers request envelopes,
//! turns client events into event/property pushes and carries voice in both
//! directions. It runs as a single task; voice forwarding for each remote
//! speaker gets its own task feeding the same link.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use shared::{
    domain::{ChannelId, ClientId, RequestId, UserId, VoiceId, PROTOCOL_SAMPLE_RATE},
    error::{ErrorCode, RejectReason, RemoteError},
    protocol::{
        pcm, Call, ChannelCall, ChannelEvent, ClientCall, ClientEvent, ClientProp,
        ConnectorCall, Envelope, EventPush, PropertyPush, Request, Response, ResponseValue,
        TextMessage, UserCall, UserEvent, VoiceChunk,
    },
    transport::{Link, LinkError, LinkSender},
};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamMap};
use tracing::{debug, info, warn};

use crate::{
    client::{
        self, Connected, InboundAudio, OutboundAudio, ProtocolClient, ProtocolConnector,
        ProtocolEvent,
    },
    resample::{Interpolation, PacketFramer, Resampler},
};

type PendingConnect = BoxFuture<'static, (RequestId, anyhow::Result<Connected>)>;

/// Returns a launcher suitable for the foreground connector: each call
/// spawns a fresh background adapter on the given link end.
pub fn launcher(connector: Arc<dyn ProtocolConnector>) -> impl FnMut(Link) + Send + 'static {
    move |link| {
        BackgroundAdapter::spawn(connector.clone(), link);
    }
}

struct ClientSlot {
    client: Box<dyn ProtocolClient>,
    channels: HashSet<ChannelId>,
    users: HashSet<UserId>,
    /// Inbound voice forwarding tasks, aborted when the client is forgotten.
    voices: HashMap<VoiceId, JoinHandle<()>>,
}

struct OutboundStream {
    client_id: ClientId,
    resampler: Resampler,
    framer: PacketFramer,
    audio: Box<dyn OutboundAudio>,
}

impl OutboundStream {
    fn write(&mut self, samples: &[f32]) -> anyhow::Result<()> {
        let resampled = self.resampler.process(samples);
        for packet in self.framer.push(&resampled) {
            self.audio.write(&packet)?;
        }
        Ok(())
    }

    fn finish(mut self, voice_id: VoiceId) {
        if let Some(packet) = self.framer.finish() {
            if let Err(err) = self.audio.write(&packet) {
                warn!(voice_id = %voice_id, error = %format!("{err:#}"), "dropping final voice packet");
            }
        }
        self.audio.end();
    }
}

pub struct BackgroundAdapter {
    connector: Arc<dyn ProtocolConnector>,
    out: LinkSender,
    sample_rate: u32,
    next_client_id: u32,
    next_voice_id: u32,
    clients: HashMap<ClientId, ClientSlot>,
    events: StreamMap<ClientId, UnboundedReceiverStream<ProtocolEvent>>,
    connecting: FuturesUnordered<PendingConnect>,
    outbound: HashMap<VoiceId, OutboundStream>,
}

impl BackgroundAdapter {
    pub fn new(connector: Arc<dyn ProtocolConnector>, out: LinkSender) -> Self {
        Self {
            connector,
            out,
            sample_rate: PROTOCOL_SAMPLE_RATE,
            next_client_id: 1,
            next_voice_id: 1,
            clients: HashMap::new(),
            events: StreamMap::new(),
            connecting: FuturesUnordered::new(),
            outbound: HashMap::new(),
        }
    }

    pub fn spawn(connector: Arc<dyn ProtocolConnector>, link: Link) -> JoinHandle<()> {
        let (out, inbound) = link.split();
        tokio::spawn(Self::new(connector, out).run(inbound))
    }

    /// Serves the link until the foreground drops its end.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Envelope>) {
        info!("background adapter started");
        loop {
            let step = tokio::select! {
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => break,
                },
                Some((client_id, event)) = self.events.next(), if !self.events.is_empty() => {
                    self.handle_protocol_event(client_id, event).await
                }
                Some((req_id, result)) = self.connecting.next(), if !self.connecting.is_empty() => {
                    self.finish_connect(req_id, result).await
                }
            };
            if let Err(err) = step {
                warn!(%err, "cannot reach the foreground; stopping");
                break;
            }
        }
        self.teardown();
        info!("background adapter stopped");
    }

    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), LinkError> {
        match envelope {
            Envelope::Request(request) => self.handle_request(request).await,
            Envelope::Voice(chunk) => {
                self.handle_voice_chunk(chunk);
                Ok(())
            }
            other => {
                warn!(kind = other.kind_name(), "ignoring envelope meant for the foreground");
                Ok(())
            }
        }
    }

    async fn handle_request(&mut self, request: Request) -> Result<(), LinkError> {
        let Request { req_id, call } = request;
        debug!(req_id = %req_id, method = call.method_name(), "request from foreground");

        let outcome = match call {
            Call::Connector(ConnectorCall::Init { sample_rate }) => {
                if sample_rate == 0 {
                    Err(RemoteError::new(
                        ErrorCode::Unsupported,
                        "sample rate must be positive",
                    ))
                } else {
                    self.sample_rate = sample_rate;
                    Ok(ResponseValue::Unit)
                }
            }
            Call::Connector(ConnectorCall::Connect { host, args }) => {
                info!(req_id = %req_id, host = %host, username = %args.username, "connecting");
                let connector = self.connector.clone();
                self.connecting.push(Box::pin(async move {
                    let result = connector.connect(&host, args).await;
                    (req_id, result)
                }));
                return Ok(());
            }
            Call::Client { client_id, call } => self
                .forward_client_call(client_id, call)
                .map(|()| ResponseValue::Unit),
            Call::Channel {
                client_id,
                channel_id,
                call,
            } => self
                .slot(client_id)
                .and_then(|slot| forward_channel_call(slot, channel_id, call))
                .map(|()| ResponseValue::Unit),
            Call::User {
                client_id,
                user_id,
                call,
            } => self
                .slot(client_id)
                .and_then(|slot| forward_user_call(slot, user_id, call))
                .map(|()| ResponseValue::Unit),
        };

        respond(&self.out, req_id, outcome).await
    }

    fn slot(&mut self, client_id: ClientId) -> Result<&mut ClientSlot, RemoteError> {
        self.clients
            .get_mut(&client_id)
            .ok_or_else(|| RemoteError::not_found(format!("unknown client {client_id}")))
    }

    fn forward_client_call(&mut self, client_id: ClientId, call: ClientCall) -> Result<(), RemoteError> {
        let sample_rate = self.sample_rate;
        let slot = self.slot(client_id)?;
        match call {
            ClientCall::Disconnect => {
                slot.client.disconnect();
                self.forget_client(client_id);
            }
            ClientCall::SetSelfMute(mute) => slot.client.set_self_mute(mute),
            ClientCall::SetSelfDeaf(deaf) => slot.client.set_self_deaf(deaf),
            ClientCall::SetSelfTexture(texture) => slot.client.set_self_texture(texture),
            ClientCall::SetAudioQuality {
                bitrate,
                frames_per_packet,
            } => slot.client.set_audio_quality(bitrate, frames_per_packet),
            ClientCall::CreateVoiceStream {
                voice_id,
                samples_per_packet,
                target,
            } => {
                let resampler =
                    Resampler::new(sample_rate, PROTOCOL_SAMPLE_RATE, Interpolation::Linear)
                        .map_err(|err| RemoteError::new(ErrorCode::Internal, err.to_string()))?;
                let audio = slot
                    .client
                    .create_voice_stream(target)
                    .map_err(|err| remote_error(ErrorCode::Internal, &err))?;
                let stream = OutboundStream {
                    client_id,
                    resampler,
                    framer: PacketFramer::new(samples_per_packet as usize),
                    audio,
                };
                if let Some(previous) = self.outbound.insert(voice_id, stream) {
                    warn!(voice_id = %voice_id, "voice id reused; closing the older stream");
                    previous.finish(voice_id);
                }
            }
        }
        Ok(())
    }

    fn forget_client(&mut self, client_id: ClientId) {
        let Some(slot) = self.clients.remove(&client_id) else {
            return;
        };
        self.events.remove(&client_id);
        self.outbound.retain(|_, stream| stream.client_id != client_id);

        let mut cut = Vec::new();
        for (voice_id, task) in slot.voices {
            if !task.is_finished() {
                task.abort();
                cut.push(voice_id);
            }
        }
        if !cut.is_empty() {
            debug!(client_id = %client_id, streams = cut.len(), "ending inbound voice of a forgotten client");
            let out = self.out.clone();
            tokio::spawn(async move {
                for voice_id in cut {
                    if out.send(Envelope::Voice(VoiceChunk::end(voice_id))).await.is_err() {
                        break;
                    }
                }
            });
        }
        info!(client_id = %client_id, "client disconnected");
    }

    async fn finish_connect(
        &mut self,
        req_id: RequestId,
        result: anyhow::Result<Connected>,
    ) -> Result<(), LinkError> {
        match result {
            Ok(connected) => {
                let client_id = ClientId(self.next_client_id);
                self.next_client_id += 1;
                self.setup_client(client_id, connected).await?;
                info!(req_id = %req_id, client_id = %client_id, "client connected");
                respond(&self.out, req_id, Ok(ResponseValue::Client(client_id))).await
            }
            Err(err) => {
                warn!(req_id = %req_id, error = %format!("{err:#}"), "connect failed");
                respond(&self.out, req_id, Err(remote_error(ErrorCode::Rejected, &err))).await
            }
        }
    }

    async fn setup_client(
        &mut self,
        client_id: ClientId,
        connected: Connected,
    ) -> Result<(), LinkError> {
        let Connected { client, events } = connected;
        let mut slot = ClientSlot {
            client,
            channels: HashSet::new(),
            users: HashSet::new(),
            voices: HashMap::new(),
        };

        let root = slot.client.root();
        register_channel_tree(&self.out, client_id, &mut slot, root).await?;
        for user_id in slot.client.user_ids() {
            register_user(&self.out, client_id, &mut slot, user_id).await?;
        }

        let props = [
            ClientProp::Root(root),
            ClientProp::SelfUser(slot.client.self_user()),
            ClientProp::WelcomeMessage(slot.client.welcome_message()),
            ClientProp::ServerVersion(slot.client.server_version()),
            ClientProp::MaxBandwidth(slot.client.max_bandwidth()),
        ];
        for prop in props {
            push_client_prop(&self.out, client_id, prop).await?;
        }

        self.events
            .insert(client_id, UnboundedReceiverStream::new(events));
        self.clients.insert(client_id, slot);
        Ok(())
    }

    async fn handle_protocol_event(
        &mut self,
        client_id: ClientId,
        event: ProtocolEvent,
    ) -> Result<(), LinkError> {
        let Some(slot) = self.clients.get_mut(&client_id) else {
            debug!(client_id = %client_id, "event from a forgotten client");
            return Ok(());
        };
        let out = &self.out;

        match event {
            ProtocolEvent::Error(err) => {
                warn!(client_id = %client_id, error = %format!("{err:#}"), "protocol client error");
                let error = remote_error(ErrorCode::Internal, &err);
                push_client_event(out, client_id, ClientEvent::Error(error)).await
            }
            ProtocolEvent::NewChannel(channel_id) => {
                register_channel_tree(out, client_id, slot, channel_id).await?;
                push_client_event(out, client_id, ClientEvent::NewChannel(channel_id)).await
            }
            ProtocolEvent::NewUser(user_id) => {
                register_user(out, client_id, slot, user_id).await?;
                push_client_event(out, client_id, ClientEvent::NewUser(user_id)).await
            }
            ProtocolEvent::Message {
                sender,
                text,
                users,
                channels,
                trees,
            } => {
                let message = TextMessage {
                    sender,
                    text,
                    users,
                    channels,
                    trees,
                };
                push_client_event(out, client_id, ClientEvent::Message(message)).await
            }
            ProtocolEvent::DataPing => {
                let stats = slot.client.data_stats();
                push_client_prop(out, client_id, ClientProp::DataStats(stats)).await
            }
            ProtocolEvent::ChannelUpdate {
                channel,
                actor,
                changes,
            } => {
                if !slot.channels.contains(&channel) {
                    debug!(client_id = %client_id, channel_id = %channel, "update for unregistered channel");
                    return Ok(());
                }
                push_channel_event(out, client_id, channel, ChannelEvent::Update { actor, changes })
                    .await
            }
            ProtocolEvent::ChannelRemove(channel) => {
                if !slot.channels.remove(&channel) {
                    return Ok(());
                }
                push_channel_event(out, client_id, channel, ChannelEvent::Remove).await
            }
            ProtocolEvent::UserUpdate {
                user,
                actor,
                changes,
            } => {
                if !slot.users.contains(&user) {
                    debug!(client_id = %client_id, user_id = %user, "update for unregistered user");
                    return Ok(());
                }
                push_user_event(out, client_id, user, UserEvent::Update { actor, changes }).await
            }
            ProtocolEvent::UserRemove(user) => {
                if !slot.users.remove(&user) {
                    return Ok(());
                }
                push_user_event(out, client_id, user, UserEvent::Remove).await
            }
            ProtocolEvent::UserVoice { user, stream } => {
                if !slot.users.contains(&user) {
                    debug!(client_id = %client_id, user_id = %user, "voice from unregistered user");
                    return Ok(());
                }
                let voice_id = VoiceId(self.next_voice_id);
                self.next_voice_id += 1;
                push_user_event(out, client_id, user, UserEvent::Voice { voice_id }).await?;
                slot.voices.retain(|_, task| !task.is_finished());
                let task = tokio::spawn(forward_inbound_voice(
                    out.clone(),
                    voice_id,
                    stream,
                    self.sample_rate,
                ));
                slot.voices.insert(voice_id, task);
                Ok(())
            }
        }
    }

    fn handle_voice_chunk(&mut self, chunk: VoiceChunk) {
        let VoiceChunk {
            voice_id, buffer, ..
        } = chunk;
        let Some(buffer) = buffer else {
            match self.outbound.remove(&voice_id) {
                Some(stream) => stream.finish(voice_id),
                None => warn!(voice_id = %voice_id, "end of unknown outbound voice stream"),
            }
            return;
        };

        let Some(stream) = self.outbound.get_mut(&voice_id) else {
            warn!(voice_id = %voice_id, "voice chunk for unknown outbound stream");
            return;
        };
        if let Err(err) = stream.write(&pcm::decode(&buffer)) {
            warn!(voice_id = %voice_id, error = %format!("{err:#}"), "outbound voice failed; closing stream");
            if let Some(mut stream) = self.outbound.remove(&voice_id) {
                stream.audio.end();
            }
        }
    }

    fn teardown(&mut self) {
        for (voice_id, stream) in self.outbound.drain() {
            stream.finish(voice_id);
        }
        for (client_id, mut slot) in self.clients.drain() {
            debug!(client_id = %client_id, "disconnecting on teardown");
            for task in slot.voices.values() {
                task.abort();
            }
            slot.client.disconnect();
        }
    }
}

fn forward_channel_call(
    slot: &mut ClientSlot,
    channel_id: ChannelId,
    call: ChannelCall,
) -> Result<(), RemoteError> {
    let mut channel = slot
        .client
        .channel(channel_id)
        .ok_or_else(|| RemoteError::not_found(format!("unknown channel {channel_id}")))?;
    match call {
        ChannelCall::SendMessage(text) => channel.send_message(&text),
    }
    Ok(())
}

fn forward_user_call(slot: &mut ClientSlot, user_id: UserId, call: UserCall) -> Result<(), RemoteError> {
    if let UserCall::SetChannel(target) = &call {
        if slot.client.channel(*target).is_none() {
            return Err(RemoteError::not_found(format!("unknown channel {target}")));
        }
    }
    let mut user = slot
        .client
        .user(user_id)
        .ok_or_else(|| RemoteError::not_found(format!("unknown user {user_id}")))?;
    match call {
        UserCall::SetMute(mute) => user.set_mute(mute),
        UserCall::SetDeaf(deaf) => user.set_deaf(deaf),
        UserCall::SetChannel(channel) => user.set_channel(channel),
        UserCall::SendMessage(text) => user.send_message(&text),
        UserCall::RequestTexture => user.request_texture(),
        UserCall::ClearTexture => user.clear_texture(),
    }
    Ok(())
}

/// Pushes the whitelisted properties of `top` and every channel below it,
/// parents before children.
async fn register_channel_tree(
    out: &LinkSender,
    client_id: ClientId,
    slot: &mut ClientSlot,
    top: ChannelId,
) -> Result<(), LinkError> {
    let mut visited = HashSet::new();
    let mut stack = vec![top];
    while let Some(channel_id) = stack.pop() {
        if !visited.insert(channel_id) {
            continue;
        }
        let snapshot = slot
            .client
            .channel(channel_id)
            .map(|channel| (client::channel_props(channel.as_ref()), channel.children()));
        let Some((props, children)) = snapshot else {
            warn!(client_id = %client_id, channel_id = %channel_id, "channel vanished before registration");
            continue;
        };

        slot.channels.insert(channel_id);
        for prop in props {
            out.send(Envelope::Property(PropertyPush::Channel {
                client_id,
                channel_id,
                prop,
            }))
            .await?;
        }
        stack.extend(children.into_iter().rev());
    }
    Ok(())
}

async fn register_user(
    out: &LinkSender,
    client_id: ClientId,
    slot: &mut ClientSlot,
    user_id: UserId,
) -> Result<(), LinkError> {
    let props = slot
        .client
        .user(user_id)
        .map(|user| client::user_props(user.as_ref()));
    let Some(props) = props else {
        warn!(client_id = %client_id, user_id = %user_id, "user vanished before registration");
        return Ok(());
    };

    slot.users.insert(user_id);
    for prop in props {
        out.send(Envelope::Property(PropertyPush::User {
            client_id,
            user_id,
            prop,
        }))
        .await?;
    }
    Ok(())
}

async fn forward_inbound_voice(
    out: LinkSender,
    voice_id: VoiceId,
    mut stream: InboundAudio,
    sample_rate: u32,
) {
    let mut resampler =
        match Resampler::new(PROTOCOL_SAMPLE_RATE, sample_rate, Interpolation::ZeroOrderHold) {
            Ok(resampler) => resampler,
            Err(err) => {
                warn!(voice_id = %voice_id, %err, "cannot set up playback resampling; dropping stream");
                let _ = out.send(Envelope::Voice(VoiceChunk::end(voice_id))).await;
                return;
            }
        };

    let mut chunks = 0usize;
    while let Some(packet) = stream.recv().await {
        let samples = resampler.process(&packet.pcm);
        if samples.is_empty() {
            continue;
        }
        let chunk = VoiceChunk::data(voice_id, pcm::encode(&samples), Some(packet.target));
        if out.send(Envelope::Voice(chunk)).await.is_err() {
            debug!(voice_id = %voice_id, "link closed mid-stream");
            return;
        }
        chunks += 1;
    }

    debug!(voice_id = %voice_id, chunks, "inbound voice stream ended");
    let _ = out.send(Envelope::Voice(VoiceChunk::end(voice_id))).await;
}

async fn respond(
    out: &LinkSender,
    req_id: RequestId,
    outcome: Result<ResponseValue, RemoteError>,
) -> Result<(), LinkError> {
    let response = match outcome {
        Ok(value) => Response::ok(req_id, value),
        Err(err) => {
            debug!(req_id = %req_id, error = %err, "rejecting request");
            Response::err(req_id, err)
        }
    };
    out.send(Envelope::Response(response)).await
}

async fn push_client_prop(out: &LinkSender, client_id: ClientId, prop: ClientProp) -> Result<(), LinkError> {
    out.send(Envelope::Property(PropertyPush::Client { client_id, prop }))
        .await
}

async fn push_client_event(
    out: &LinkSender,
    client_id: ClientId,
    event: ClientEvent,
) -> Result<(), LinkError> {
    out.send(Envelope::Event(EventPush::Client { client_id, event }))
        .await
}

async fn push_channel_event(
    out: &LinkSender,
    client_id: ClientId,
    channel_id: ChannelId,
    event: ChannelEvent,
) -> Result<(), LinkError> {
    out.send(Envelope::Event(EventPush::Channel {
        client_id,
        channel_id,
        event,
    }))
    .await
}

async fn push_user_event(
    out: &LinkSender,
    client_id: ClientId,
    user_id: UserId,
    event: UserEvent,
) -> Result<(), LinkError> {
    out.send(Envelope::Event(EventPush::User {
        client_id,
        user_id,
        event,
    }))
    .await
}

/// Flattens an error into its wire form, keeping the [`RejectReason`] tag
/// when one sits anywhere in the chain.
fn remote_error(code: ErrorCode, err: &anyhow::Error) -> RemoteError {
    let causes = err.chain().skip(1).map(ToString::to_string).collect();
    let remote = RemoteError::new(code, err.to_string()).with_causes(causes);
    match err.downcast_ref::<RejectReason>() {
        Some(reason) => remote.with_kind(reason.kind()),
        None => remote,
    }
}

#[cfg(test)]
#[path = "tests/adapter_tests.rs"]
mod tests;
