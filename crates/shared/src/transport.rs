//! Duplex, order-preserving envelope link between the two execution contexts.

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::protocol::Envelope;

pub const DEFAULT_LINK_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link queue is full")]
    Full,
    #[error("link peer is gone")]
    Closed,
}

/// One end of a link. Envelopes sent here arrive, in order, at the other end.
#[derive(Debug)]
pub struct Link {
    tx: mpsc::Sender<Envelope>,
    rx: mpsc::Receiver<Envelope>,
}

/// Builds both ends of a link whose queues hold at most `capacity`
/// envelopes per direction.
pub fn link_pair(capacity: usize) -> (Link, Link) {
    let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
    (
        Link { tx: a_tx, rx: a_rx },
        Link { tx: b_tx, rx: b_rx },
    )
}

impl Link {
    /// Non-blocking send, for contexts that must never wait on the peer.
    pub fn try_send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.tx.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => LinkError::Full,
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.tx.send(envelope).await.map_err(|_| LinkError::Closed)
    }

    /// `None` once the peer has dropped its end and the queue is drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Takes the next queued envelope without waiting.
    pub fn try_recv(&mut self) -> Result<Option<Envelope>, LinkError> {
        match self.rx.try_recv() {
            Ok(envelope) => Ok(Some(envelope)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(LinkError::Closed),
        }
    }

    pub fn sender(&self) -> LinkSender {
        LinkSender {
            tx: self.tx.clone(),
        }
    }

    pub fn split(self) -> (LinkSender, mpsc::Receiver<Envelope>) {
        (LinkSender { tx: self.tx }, self.rx)
    }
}

/// Cloneable sending half, handed to tasks that produce envelopes on their own.
#[derive(Debug, Clone)]
pub struct LinkSender {
    tx: mpsc::Sender<Envelope>,
}

impl LinkSender {
    pub fn try_send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.tx.try_send(envelope).map_err(|err| match err {
            TrySendError::Full(_) => LinkError::Full,
            TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), LinkError> {
        self.tx.send(envelope).await.map_err(|_| LinkError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::VoiceId, protocol::VoiceChunk};

    fn end(id: u32) -> Envelope {
        Envelope::Voice(VoiceChunk::end(VoiceId(id)))
    }

    #[tokio::test]
    async fn delivers_in_order_per_direction() {
        let (a, mut b) = link_pair(8);
        for id in 1..=3 {
            a.try_send(end(id)).expect("send");
        }
        for id in 1..=3 {
            assert_eq!(b.recv().await, Some(end(id)));
        }
    }

    #[tokio::test]
    async fn reports_full_and_closed() {
        let (a, b) = link_pair(1);
        a.try_send(end(1)).expect("first send");
        assert_eq!(a.try_send(end(2)), Err(LinkError::Full));

        drop(b);
        assert_eq!(a.try_send(end(3)), Err(LinkError::Closed));
    }

    #[tokio::test]
    async fn recv_ends_when_peer_drops() {
        let (a, mut b) = link_pair(4);
        a.try_send(end(7)).expect("send");
        drop(a);
        assert_eq!(b.recv().await, Some(end(7)));
        assert_eq!(b.recv().await, None);
    }
}
