//! Foreground end of the bridge.
//!
//! The [`Connector`] owns the link to the background context, correlates
//! requests with responses and keeps the client mirrors current. It is a
//! single-owner object: every method takes `&mut self`, and inbound envelopes
//! are only processed from [`Connector::pump`], [`Connector::drain`] or while
//! awaiting [`Connector::query`].

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use serde_json::Value;
use shared::{
    domain::{ChannelId, ClientId, ConnectArgs, RequestId, UserId, VoiceId, VoiceTarget},
    protocol::{
        Call, ChannelCall, ChannelEvent, ClientCall, ConnectorCall, EntityKey, Envelope, EventPush,
        Outcome, PropertyPush, Request, ResponseValue, UserCall, UserEvent,
    },
    transport::{link_pair, Link, LinkError},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::{
    config::Settings,
    error::ConnectorError,
    mirror::{ClientMirror, ClientSignal},
    pending::PendingRequests,
    voice::{InboundVoice, OutboundVoice, PlaybackFactory, QueuedPlayback, VoiceOrigin, VoiceRegistry},
};

/// Starts a background context serving the given link end.
pub type Launcher = Box<dyn FnMut(Link) + Send>;

pub struct Connector {
    settings: Settings,
    launcher: Launcher,
    link: Option<Link>,
    next_req_id: u64,
    next_voice_id: u32,
    pending: PendingRequests,
    clients: HashMap<ClientId, ClientMirror>,
    retired: HashSet<ClientId>,
    voice: VoiceRegistry,
}

impl Connector {
    pub fn new(
        settings: Settings,
        launcher: impl FnMut(Link) + Send + 'static,
        playback: Box<dyn PlaybackFactory>,
    ) -> Self {
        Self {
            settings,
            launcher: Box::new(launcher),
            link: None,
            next_req_id: 1,
            next_voice_id: 1,
            pending: PendingRequests::new(),
            clients: HashMap::new(),
            retired: HashSet::new(),
            voice: VoiceRegistry::new(playback),
        }
    }

    /// Connector whose inbound voice lands on bounded queues, one per stream.
    pub fn with_queued_playback(
        settings: Settings,
        launcher: impl FnMut(Link) + Send + 'static,
    ) -> (Self, mpsc::UnboundedReceiver<InboundVoice>) {
        let (playback, streams) = QueuedPlayback::new(settings.playback_queue_frames);
        (Self::new(settings, launcher, Box::new(playback)), streams)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn is_started(&self) -> bool {
        self.link.is_some()
    }

    /// Launches the background context if it is not running yet. The first
    /// envelope it sees announces the foreground sample rate.
    pub fn start(&mut self) -> Result<(), ConnectorError> {
        if self.link.is_some() {
            return Ok(());
        }
        let (foreground, background) = link_pair(self.settings.link_capacity);
        (self.launcher)(background);
        // Client ids restart with every background context.
        self.retired.clear();
        info!(
            capacity = self.settings.link_capacity,
            sample_rate = self.settings.sample_rate,
            "background context started"
        );

        let req_id = self.alloc_req_id();
        let init = Call::Connector(ConnectorCall::Init {
            sample_rate: self.settings.sample_rate,
        });
        foreground.try_send(Envelope::Request(Request { req_id, call: init }))?;
        self.link = Some(foreground);
        Ok(())
    }

    fn alloc_req_id(&mut self) -> RequestId {
        let req_id = RequestId(self.next_req_id);
        self.next_req_id += 1;
        req_id
    }

    fn send_request(&mut self, call: Call) -> Result<RequestId, ConnectorError> {
        self.start()?;
        let req_id = self.alloc_req_id();
        debug!(req_id = %req_id, method = call.method_name(), "sending request");
        let sent = self
            .link
            .as_ref()
            .ok_or(ConnectorError::ChannelClosed)?
            .try_send(Envelope::Request(Request { req_id, call }));
        match sent {
            Ok(()) => Ok(req_id),
            Err(LinkError::Full) => {
                warn!(req_id = %req_id, "link queue full; request not sent");
                Err(ConnectorError::QueueFull)
            }
            Err(LinkError::Closed) => {
                error!(req_id = %req_id, "background context is gone");
                self.on_link_lost();
                Err(ConnectorError::ChannelClosed)
            }
        }
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<RequestId, ConnectorError> {
        self.settings.sample_rate = sample_rate;
        self.call(Call::Connector(ConnectorCall::Init { sample_rate }))
    }

    /// Sends `call` without waiting for its result. Failures reported by the
    /// background side are only logged.
    pub fn call(&mut self, call: Call) -> Result<RequestId, ConnectorError> {
        if let Call::Client {
            client_id,
            call:
                ClientCall::SetAudioQuality {
                    bitrate,
                    frames_per_packet,
                },
        } = &call
        {
            if let Some(mirror) = self.clients.get_mut(client_id) {
                mirror.audio_quality.bitrate = *bitrate;
                mirror.audio_quality.frames_per_packet = *frames_per_packet;
            }
        }
        self.send_request(call)
    }

    /// Sends `call` and processes inbound envelopes until its response arrives.
    pub async fn query(&mut self, call: Call) -> Result<ResponseValue, ConnectorError> {
        let req_id = self.send_request(call)?;
        let mut completion = self.pending.register(req_id);
        loop {
            match completion.try_recv() {
                Ok(outcome) => return outcome.map_err(ConnectorError::from),
                Err(oneshot::error::TryRecvError::Empty) => {
                    if let Err(err) = self.pump().await {
                        self.pending.cancel(req_id);
                        return Err(err);
                    }
                }
                Err(oneshot::error::TryRecvError::Closed) => {
                    return Err(ConnectorError::ChannelClosed)
                }
            }
        }
    }

    pub async fn connect(
        &mut self,
        host: &str,
        args: ConnectArgs,
    ) -> Result<ClientId, ConnectorError> {
        info!(host, username = %args.username, "connecting");
        let call = Call::Connector(ConnectorCall::Connect {
            host: host.to_string(),
            args,
        });
        match self.query(call).await {
            Ok(ResponseValue::Client(client_id)) => {
                self.clients
                    .entry(client_id)
                    .or_insert_with(|| ClientMirror::new(client_id));
                info!(host, client_id = %client_id, "connected");
                Ok(client_id)
            }
            Ok(other) => Err(ConnectorError::UnexpectedResponse {
                expected: "client",
                got: other,
            }),
            Err(err) => {
                warn!(host, error = %err, "connect failed");
                Err(err)
            }
        }
    }

    /// Waits for the next inbound envelope and dispatches it. Never starts the
    /// background context: without a link this fails with `ChannelClosed`.
    pub async fn pump(&mut self) -> Result<(), ConnectorError> {
        let link = self.link.as_mut().ok_or(ConnectorError::ChannelClosed)?;
        let envelope = link.recv().await;
        match envelope {
            Some(envelope) => {
                self.dispatch(envelope);
                Ok(())
            }
            None => {
                error!("background context closed the link");
                self.on_link_lost();
                Err(ConnectorError::ChannelClosed)
            }
        }
    }

    /// Dispatches everything already queued without waiting.
    pub fn drain(&mut self) -> Result<usize, ConnectorError> {
        let mut handled = 0;
        loop {
            let next = match self.link.as_mut() {
                Some(link) => link.try_recv(),
                None => return Ok(handled),
            };
            match next {
                Ok(Some(envelope)) => {
                    self.dispatch(envelope);
                    handled += 1;
                }
                Ok(None) => return Ok(handled),
                Err(_) => {
                    error!("background context closed the link");
                    self.on_link_lost();
                    return Err(ConnectorError::ChannelClosed);
                }
            }
        }
    }

    pub fn dispatch(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Response(response) => {
                let Some(response) = self.pending.resolve(response) else {
                    return;
                };
                match response.outcome {
                    Outcome::Result(value) => {
                        debug!(req_id = %response.req_id, ?value, "call completed")
                    }
                    Outcome::Error(err) => {
                        warn!(req_id = %response.req_id, error = %err, "call failed")
                    }
                }
            }
            Envelope::Property(push) => self.apply_property(push),
            Envelope::Event(push) => self.apply_event(push),
            Envelope::Voice(chunk) => self.voice.handle(chunk),
            Envelope::Request(request) => {
                warn!(req_id = %request.req_id, "ignoring request from the background context")
            }
        }
    }

    fn mirror_for_push(&mut self, client_id: ClientId) -> Option<&mut ClientMirror> {
        if self.retired.contains(&client_id) {
            debug!(client_id = %client_id, "dropping push for a disconnected client");
            return None;
        }
        Some(
            self.clients
                .entry(client_id)
                .or_insert_with(|| ClientMirror::new(client_id)),
        )
    }

    fn apply_property(&mut self, push: PropertyPush) {
        match push {
            PropertyPush::Client { client_id, prop } => {
                if let Some(mirror) = self.mirror_for_push(client_id) {
                    mirror.apply_property(prop);
                }
            }
            PropertyPush::Channel {
                client_id,
                channel_id,
                prop,
            } => {
                if let Some(mirror) = self.mirror_for_push(client_id) {
                    mirror.apply_channel_property(channel_id, prop);
                }
            }
            PropertyPush::User {
                client_id,
                user_id,
                prop,
            } => {
                if let Some(mirror) = self.mirror_for_push(client_id) {
                    mirror.apply_user_property(user_id, prop);
                }
            }
        }
    }

    fn apply_event(&mut self, push: EventPush) {
        match push {
            EventPush::Client { client_id, event } => {
                if let Some(mirror) = self.mirror_for_push(client_id) {
                    mirror.handle_client_event(event);
                }
            }
            EventPush::Channel {
                client_id,
                channel_id,
                event,
            } => {
                if let Some(mirror) = self.mirror_for_push(client_id) {
                    mirror.handle_channel_event(channel_id, event);
                }
            }
            EventPush::User {
                client_id,
                user_id,
                event,
            } => {
                let voice_id = match &event {
                    UserEvent::Voice { voice_id } => Some(*voice_id),
                    _ => None,
                };
                let Some(mirror) = self.mirror_for_push(client_id) else {
                    if let Some(voice_id) = voice_id {
                        self.voice.discard(voice_id);
                    }
                    return;
                };
                mirror.handle_user_event(user_id, event);
                if let Some(voice_id) = voice_id {
                    self.voice
                        .announce(voice_id, VoiceOrigin { client_id, user_id });
                }
            }
        }
    }

    pub fn client(&self, client_id: ClientId) -> Option<&ClientMirror> {
        self.clients.get(&client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &ClientMirror> {
        self.clients.values()
    }

    pub fn is_retired(&self, client_id: ClientId) -> bool {
        self.retired.contains(&client_id)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    fn known_client(&mut self, client_id: ClientId) -> Result<&mut ClientMirror, ConnectorError> {
        self.clients
            .get_mut(&client_id)
            .ok_or(ConnectorError::UnknownClient(client_id))
    }

    pub fn client_calls(&mut self, client_id: ClientId) -> Result<ClientCalls<'_>, ConnectorError> {
        self.known_client(client_id)?;
        Ok(ClientCalls {
            connector: self,
            client_id,
        })
    }

    pub fn channel_calls(
        &mut self,
        client_id: ClientId,
        channel_id: ChannelId,
    ) -> Result<ChannelCalls<'_>, ConnectorError> {
        self.known_client(client_id)?;
        Ok(ChannelCalls {
            connector: self,
            client_id,
            channel_id,
        })
    }

    pub fn user_calls(
        &mut self,
        client_id: ClientId,
        user_id: UserId,
    ) -> Result<UserCalls<'_>, ConnectorError> {
        self.known_client(client_id)?;
        Ok(UserCalls {
            connector: self,
            client_id,
            user_id,
        })
    }

    /// Name-based entry point. Unsupported methods and malformed arguments
    /// are rejected here, before anything is sent.
    pub fn invoke(
        &mut self,
        key: EntityKey,
        method: &str,
        args: &[Value],
    ) -> Result<RequestId, ConnectorError> {
        let call = match key {
            EntityKey::Client { client_id } => Call::Client {
                client_id,
                call: ClientCall::parse(method, args)?,
            },
            EntityKey::Channel {
                client_id,
                channel_id,
            } => Call::Channel {
                client_id,
                channel_id,
                call: ChannelCall::parse(method, args)?,
            },
            EntityKey::User { client_id, user_id } => Call::User {
                client_id,
                user_id,
                call: UserCall::parse(method, args)?,
            },
        };
        self.known_client(key.client_id())?;

        if let Call::Client {
            client_id,
            call: ClientCall::Disconnect,
        } = call
        {
            return self.disconnect(client_id);
        }
        self.call(call)
    }

    /// Opens an outbound voice stream on `client_id`. Audio written to the
    /// returned handle is expected at the configured sample rate.
    pub fn create_voice_stream(
        &mut self,
        client_id: ClientId,
        target: VoiceTarget,
    ) -> Result<OutboundVoice, ConnectorError> {
        self.known_client(client_id)?;
        let voice_id = VoiceId(self.next_voice_id);
        self.next_voice_id += 1;
        self.call(Call::Client {
            client_id,
            call: ClientCall::CreateVoiceStream {
                voice_id,
                samples_per_packet: self.settings.samples_per_packet,
                target,
            },
        })?;
        debug!(client_id = %client_id, voice_id = %voice_id, ?target, "outbound voice stream opened");
        let out = self
            .link
            .as_ref()
            .ok_or(ConnectorError::ChannelClosed)?
            .sender();
        Ok(OutboundVoice::new(voice_id, client_id, out))
    }

    /// Disconnects `client_id` and forgets its mirror. Pushes still in flight
    /// for it are dropped.
    pub fn disconnect(&mut self, client_id: ClientId) -> Result<RequestId, ConnectorError> {
        self.known_client(client_id)?;
        let req_id = self.call(Call::Client {
            client_id,
            call: ClientCall::Disconnect,
        })?;
        self.clients.remove(&client_id);
        self.retired.insert(client_id);
        self.voice.discard_client(client_id);
        info!(client_id = %client_id, "client disconnected");
        Ok(req_id)
    }

    pub fn subscribe_client(
        &mut self,
        client_id: ClientId,
    ) -> Result<mpsc::UnboundedReceiver<ClientSignal>, ConnectorError> {
        Ok(self.known_client(client_id)?.subscribe())
    }

    pub fn subscribe_channel(
        &mut self,
        client_id: ClientId,
        channel_id: ChannelId,
    ) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, ConnectorError> {
        Ok(self
            .known_client(client_id)?
            .channel_entry(channel_id)
            .subscribe())
    }

    pub fn subscribe_user(
        &mut self,
        client_id: ClientId,
        user_id: UserId,
    ) -> Result<mpsc::UnboundedReceiver<UserEvent>, ConnectorError> {
        Ok(self.known_client(client_id)?.user_entry(user_id).subscribe())
    }

    /// Tears down the background context. Mirrors are retired, open playback
    /// streams finished and waiters released.
    pub fn shutdown(&mut self) {
        if self.link.take().is_some() {
            info!("shutting down background context");
        }
        self.on_link_lost();
    }

    fn on_link_lost(&mut self) {
        self.link = None;
        self.voice.close_all();
        self.pending = PendingRequests::new();
        self.retired.extend(self.clients.drain().map(|(client_id, _)| client_id));
    }
}

pub struct ClientCalls<'a> {
    connector: &'a mut Connector,
    client_id: ClientId,
}

impl ClientCalls<'_> {
    fn send(&mut self, call: ClientCall) -> Result<RequestId, ConnectorError> {
        self.connector.call(Call::Client {
            client_id: self.client_id,
            call,
        })
    }

    pub fn set_self_mute(&mut self, mute: bool) -> Result<RequestId, ConnectorError> {
        self.send(ClientCall::SetSelfMute(mute))
    }

    pub fn set_self_deaf(&mut self, deaf: bool) -> Result<RequestId, ConnectorError> {
        self.send(ClientCall::SetSelfDeaf(deaf))
    }

    pub fn set_self_texture(&mut self, texture: Option<Bytes>) -> Result<RequestId, ConnectorError> {
        self.send(ClientCall::SetSelfTexture(texture))
    }

    pub fn set_audio_quality(
        &mut self,
        bitrate: u32,
        frames_per_packet: u32,
    ) -> Result<RequestId, ConnectorError> {
        self.send(ClientCall::SetAudioQuality {
            bitrate,
            frames_per_packet,
        })
    }
}

pub struct ChannelCalls<'a> {
    connector: &'a mut Connector,
    client_id: ClientId,
    channel_id: ChannelId,
}

impl ChannelCalls<'_> {
    pub fn send_message(&mut self, text: impl Into<String>) -> Result<RequestId, ConnectorError> {
        self.connector.call(Call::Channel {
            client_id: self.client_id,
            channel_id: self.channel_id,
            call: ChannelCall::SendMessage(text.into()),
        })
    }
}

pub struct UserCalls<'a> {
    connector: &'a mut Connector,
    client_id: ClientId,
    user_id: UserId,
}

impl UserCalls<'_> {
    fn send(&mut self, call: UserCall) -> Result<RequestId, ConnectorError> {
        self.connector.call(Call::User {
            client_id: self.client_id,
            user_id: self.user_id,
            call,
        })
    }

    pub fn set_mute(&mut self, mute: bool) -> Result<RequestId, ConnectorError> {
        self.send(UserCall::SetMute(mute))
    }

    pub fn set_deaf(&mut self, deaf: bool) -> Result<RequestId, ConnectorError> {
        self.send(UserCall::SetDeaf(deaf))
    }

    pub fn set_channel(&mut self, channel: ChannelId) -> Result<RequestId, ConnectorError> {
        self.send(UserCall::SetChannel(channel))
    }

    pub fn send_message(&mut self, text: impl Into<String>) -> Result<RequestId, ConnectorError> {
        self.send(UserCall::SendMessage(text.into()))
    }

    pub fn request_texture(&mut self) -> Result<RequestId, ConnectorError> {
        self.send(UserCall::RequestTexture)
    }

    pub fn clear_texture(&mut self) -> Result<RequestId, ConnectorError> {
        self.send(UserCall::ClearTexture)
    }
}

#[cfg(test)]
#[path = "tests/connector_tests.rs"]
mod tests;
