//! Listener registry and the per-listener event streams.
//!
//! Each [`Listener`] owns three bounded queues. Dispatch never blocks: a
//! full queue drops the event and the listener is told once per batch with
//! a `RequestMessageCountExceeded` status.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::status::{Operation, Status, StatusCategory};
use crate::types::{Event, Message, PresenceEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Receiving side handed to application code.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    status: mpsc::Receiver<Status>,
    messages: mpsc::Receiver<Message>,
    presence: mpsc::Receiver<PresenceEvent>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Next event from any of the three streams. Status events win ties.
    /// Returns `None` once the client has released this listener.
    pub async fn next(&mut self) -> Option<Event> {
        tokio::select! {
            biased;
            Some(status) = self.status.recv() => Some(Event::Status(status)),
            Some(message) = self.messages.recv() => Some(Event::Message(message)),
            Some(presence) = self.presence.recv() => Some(Event::Presence(presence)),
            else => None,
        }
    }

    pub fn status(&mut self) -> &mut mpsc::Receiver<Status> {
        &mut self.status
    }

    pub fn messages(&mut self) -> &mut mpsc::Receiver<Message> {
        &mut self.messages
    }

    pub fn presence(&mut self) -> &mut mpsc::Receiver<PresenceEvent> {
        &mut self.presence
    }
}

struct Sinks {
    id: ListenerId,
    status: mpsc::Sender<Status>,
    messages: mpsc::Sender<Message>,
    presence: mpsc::Sender<PresenceEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    sinks: Vec<Sinks>,
}

#[derive(Clone, Default)]
pub(crate) struct ListenerRegistry {
    inner: Arc<RwLock<Inner>>,
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

fn deliver<T>(tx: &mpsc::Sender<T>, value: T) -> Delivery {
    match tx.try_send(value) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(_)) => Delivery::Full,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, capacity: usize) -> Listener {
        let capacity = capacity.max(1);
        let (status_tx, status) = mpsc::channel(capacity);
        let (messages_tx, messages) = mpsc::channel(capacity);
        let (presence_tx, presence) = mpsc::channel(capacity);

        let mut inner = self.inner.write();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.sinks.push(Sinks {
            id,
            status: status_tx,
            messages: messages_tx,
            presence: presence_tx,
        });
        tracing::debug!(listener = id.0, capacity, "listener added");

        Listener {
            id,
            status,
            messages,
            presence,
        }
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.write();
        let before = inner.sinks.len();
        inner.sinks.retain(|s| s.id != id);
        inner.sinks.len() != before
    }

    /// Drop every sender; listeners drain what is queued and then end.
    pub fn clear(&self) {
        self.inner.write().sinks.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.read().sinks.len()
    }

    pub fn emit_status(&self, status: &Status) {
        let mut closed = Vec::new();
        for sink in &self.inner.read().sinks {
            match deliver(&sink.status, status.clone()) {
                Delivery::Sent => {}
                Delivery::Full => {
                    tracing::warn!(listener = sink.id.0, category = ?status.category, "status queue full, dropping status");
                }
                Delivery::Closed => closed.push(sink.id),
            }
        }
        self.prune(&closed);
    }

    /// Deliver one response's events in order. Listeners whose queues
    /// overflowed get one `RequestMessageCountExceeded` status afterwards.
    pub fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        let mut closed = Vec::new();
        {
            let inner = self.inner.read();
            for sink in &inner.sinks {
                let mut dropped = 0usize;
                for event in &events {
                    let outcome = match event {
                        Event::Message(m) => deliver(&sink.messages, m.clone()),
                        Event::Presence(p) => deliver(&sink.presence, p.clone()),
                        Event::Status(s) => deliver(&sink.status, s.clone()),
                    };
                    match outcome {
                        Delivery::Sent => {}
                        Delivery::Full => dropped += 1,
                        Delivery::Closed => {
                            closed.push(sink.id);
                            break;
                        }
                    }
                }
                if dropped > 0 {
                    tracing::warn!(listener = sink.id.0, dropped, "listener queue full, dropping events");
                    let status = Status::new(
                        Operation::Subscribe,
                        StatusCategory::RequestMessageCountExceeded,
                    );
                    if let Delivery::Closed = deliver(&sink.status, status) {
                        closed.push(sink.id);
                    }
                }
            }
        }
        self.prune(&closed);
    }

    fn prune(&self, closed: &[ListenerId]) {
        if closed.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        inner.sinks.retain(|s| !closed.contains(&s.id));
        tracing::debug!(removed = closed.len(), "pruned closed listeners");
    }
}
