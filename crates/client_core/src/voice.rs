//! Foreground ends of the voice tunnel.
//!
//! Inbound streams arrive as voice chunks and are written to sinks opened
//! lazily through a [`PlaybackFactory`]. Outbound streams are driven through
//! an [`OutboundVoice`] handle that turns writes into chunks on the link.

use std::collections::{hash_map::Entry, HashMap, HashSet};

use shared::{
    domain::{ClientId, UserId, VoiceId, VoiceTarget},
    protocol::{pcm, Envelope, VoiceChunk},
    transport::LinkSender,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::error::ConnectorError;

/// Decoded samples of one inbound chunk, at the foreground sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceFrame {
    pub samples: Vec<f32>,
    pub target: Option<VoiceTarget>,
}

/// The speaker behind an inbound stream, known once its `voice` event was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceOrigin {
    pub client_id: ClientId,
    pub user_id: UserId,
}

pub trait VoiceSink: Send {
    fn write(&mut self, frame: VoiceFrame);
    fn finish(&mut self);
}

pub trait PlaybackFactory: Send {
    fn open(&mut self, voice_id: VoiceId, origin: Option<VoiceOrigin>) -> Box<dyn VoiceSink>;
}

pub struct VoiceRegistry {
    factory: Box<dyn PlaybackFactory>,
    origins: HashMap<VoiceId, VoiceOrigin>,
    sinks: HashMap<VoiceId, Box<dyn VoiceSink>>,
    // Streams of disconnected clients. Voice ids are not reused within one
    // background context, so entries live until `close_all`.
    discarded: HashSet<VoiceId>,
}

impl VoiceRegistry {
    pub fn new(factory: Box<dyn PlaybackFactory>) -> Self {
        Self {
            factory,
            origins: HashMap::new(),
            sinks: HashMap::new(),
            discarded: HashSet::new(),
        }
    }

    pub fn announce(&mut self, voice_id: VoiceId, origin: VoiceOrigin) {
        self.origins.insert(voice_id, origin);
    }

    pub fn handle(&mut self, chunk: VoiceChunk) {
        let VoiceChunk {
            voice_id,
            buffer,
            target,
        } = chunk;

        if self.discarded.contains(&voice_id) {
            return;
        }

        let Some(buffer) = buffer else {
            let announced = self.origins.remove(&voice_id).is_some();
            match self.sinks.remove(&voice_id) {
                Some(mut sink) => sink.finish(),
                None if announced => debug!(voice_id = %voice_id, "voice stream ended before any audio"),
                None => warn!(voice_id = %voice_id, "end of unknown voice stream"),
            }
            return;
        };

        let sink = match self.sinks.entry(voice_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let origin = self.origins.get(&voice_id).copied();
                debug!(voice_id = %voice_id, ?origin, "opening playback sink");
                entry.insert(self.factory.open(voice_id, origin))
            }
        };
        sink.write(VoiceFrame {
            samples: pcm::decode(&buffer),
            target,
        });
    }

    pub fn open_streams(&self) -> usize {
        self.sinks.len()
    }

    /// Stops playing `voice_id`: an open sink is finished now and later
    /// chunks, including the end sentinel, are ignored.
    pub fn discard(&mut self, voice_id: VoiceId) {
        self.origins.remove(&voice_id);
        if let Some(mut sink) = self.sinks.remove(&voice_id) {
            sink.finish();
        }
        debug!(voice_id = %voice_id, "discarding voice stream");
        self.discarded.insert(voice_id);
    }

    /// Discards every stream announced for `client_id`.
    pub fn discard_client(&mut self, client_id: ClientId) {
        let voice_ids: Vec<VoiceId> = self
            .origins
            .iter()
            .filter(|(_, origin)| origin.client_id == client_id)
            .map(|(voice_id, _)| *voice_id)
            .collect();
        for voice_id in voice_ids {
            self.discard(voice_id);
        }
    }

    /// Finalizes every open sink; used when the background context goes away.
    pub fn close_all(&mut self) {
        self.origins.clear();
        self.discarded.clear();
        for (voice_id, mut sink) in self.sinks.drain() {
            debug!(voice_id = %voice_id, "closing playback sink");
            sink.finish();
        }
    }
}

/// An inbound stream handed to the audio side. Ends when `frames` yields `None`.
#[derive(Debug)]
pub struct InboundVoice {
    pub voice_id: VoiceId,
    pub origin: Option<VoiceOrigin>,
    pub frames: mpsc::Receiver<VoiceFrame>,
}

/// Playback factory that queues each stream's frames on a bounded channel.
pub struct QueuedPlayback {
    capacity: usize,
    streams: mpsc::UnboundedSender<InboundVoice>,
}

impl QueuedPlayback {
    pub fn new(capacity: usize) -> (Self, mpsc::UnboundedReceiver<InboundVoice>) {
        let (streams, rx) = mpsc::unbounded_channel();
        (
            Self {
                capacity: capacity.max(1),
                streams,
            },
            rx,
        )
    }
}

impl PlaybackFactory for QueuedPlayback {
    fn open(&mut self, voice_id: VoiceId, origin: Option<VoiceOrigin>) -> Box<dyn VoiceSink> {
        let (tx, frames) = mpsc::channel(self.capacity);
        let stream = InboundVoice {
            voice_id,
            origin,
            frames,
        };
        if self.streams.send(stream).is_err() {
            debug!(voice_id = %voice_id, "no playback listener; stream will be discarded");
        }
        Box::new(QueuedSink {
            voice_id,
            tx: Some(tx),
            dropped: 0,
        })
    }
}

struct QueuedSink {
    voice_id: VoiceId,
    tx: Option<mpsc::Sender<VoiceFrame>>,
    dropped: u64,
}

impl VoiceSink for QueuedSink {
    fn write(&mut self, frame: VoiceFrame) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped += 1;
                warn!(voice_id = %self.voice_id, dropped = self.dropped, "playback queue full; dropping frame");
            }
            Err(TrySendError::Closed(_)) => {
                debug!(voice_id = %self.voice_id, "playback stream abandoned");
                self.tx = None;
            }
        }
    }

    fn finish(&mut self) {
        self.tx = None;
        if self.dropped > 0 {
            debug!(voice_id = %self.voice_id, dropped = self.dropped, "playback stream finished with drops");
        }
    }
}

/// Microphone stream into the background context.
///
/// Each write becomes one voice chunk. The end-of-stream marker is sent once,
/// by [`OutboundVoice::finish`] or on drop.
#[derive(Debug)]
pub struct OutboundVoice {
    voice_id: VoiceId,
    client_id: ClientId,
    out: LinkSender,
    finished: bool,
}

impl OutboundVoice {
    pub(crate) fn new(voice_id: VoiceId, client_id: ClientId, out: LinkSender) -> Self {
        Self {
            voice_id,
            client_id,
            out,
            finished: false,
        }
    }

    pub fn voice_id(&self) -> VoiceId {
        self.voice_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn write(&mut self, samples: &[f32]) -> Result<(), ConnectorError> {
        if self.finished {
            return Err(ConnectorError::VoiceFinished(self.voice_id));
        }
        if samples.is_empty() {
            return Ok(());
        }
        let chunk = VoiceChunk::data(self.voice_id, pcm::encode(samples), None);
        self.out.try_send(Envelope::Voice(chunk))?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<(), ConnectorError> {
        self.send_end()
    }

    fn send_end(&mut self) -> Result<(), ConnectorError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.out
            .try_send(Envelope::Voice(VoiceChunk::end(self.voice_id)))?;
        Ok(())
    }
}

impl Drop for OutboundVoice {
    fn drop(&mut self) {
        if let Err(err) = self.send_end() {
            debug!(voice_id = %self.voice_id, %err, "could not close outbound voice stream");
        }
    }
}

#[cfg(test)]
#[path = "tests/voice_tests.rs"]
mod tests;
