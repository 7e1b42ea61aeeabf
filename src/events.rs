//! Server-pushed event dispatch.
//!
//! Push frames carry no request id of their own. The read loop hands them to
//! the [`EventDispatcher`], which resolves the scope of each event and
//! forwards it to every matching subscription.
//!
//! Each subscription owns an unbounded queue drained by its own task, so:
//! - handlers never run on the read loop, and a slow handler cannot delay
//!   response correlation;
//! - events for one subscription are handled one at a time, in arrival order.
//!
//! # Example
//!
//! ```ignore
//! use muxwire::events::EventScope;
//!
//! let sub = client.subscribe(EventScope::Room(17), |event| async move {
//!     println!("room event {:?}", event.kind);
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::protocol::{types, Frame};

/// Boxed future returned by event handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a push frame announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Node status change.
    NodeStatus,
    /// Server warning.
    Warning,
    /// Joined a room.
    RoomJoin,
    /// Left a room.
    RoomLeave,
    /// Event emitted in a room.
    RoomEmit,
    /// Room removed.
    RoomDelete,
}

impl EventKind {
    /// Kind for a push frame type.
    pub fn from_frame_type(frame_type: u8) -> Option<Self> {
        match frame_type {
            types::ON_NODE_STATUS => Some(EventKind::NodeStatus),
            types::ON_WARN => Some(EventKind::Warning),
            types::ON_ROOM_JOIN => Some(EventKind::RoomJoin),
            types::ON_ROOM_LEAVE => Some(EventKind::RoomLeave),
            types::ON_ROOM_EMIT => Some(EventKind::RoomEmit),
            types::ON_ROOM_DELETE => Some(EventKind::RoomDelete),
            _ => None,
        }
    }

    /// Whether events of this kind belong to a room.
    pub fn is_room(self) -> bool {
        matches!(
            self,
            EventKind::RoomJoin | EventKind::RoomLeave | EventKind::RoomEmit | EventKind::RoomDelete
        )
    }
}

/// Delivery scope of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventScope {
    /// Node status changes.
    Node,
    /// Server warnings.
    Warning,
    /// Everything happening in one room.
    Room(u64),
}

/// A dispatched push.
#[derive(Debug, Clone)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Where it happened.
    pub scope: EventScope,
    /// Raw MessagePack payload.
    pub payload: Bytes,
}

impl Event {
    /// Decode the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.payload)
    }

    /// Room id for room events.
    pub fn room_id(&self) -> Option<u64> {
        match self.scope {
            EventScope::Room(id) => Some(id),
            _ => None,
        }
    }
}

/// Body of a room emit push.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomEmit {
    /// Room id.
    pub id: u64,
    /// Event name given by the emitter.
    pub event: String,
    /// Emitted arguments.
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Deserialize)]
struct RoomRef {
    id: u64,
}

#[derive(Deserialize)]
struct Warning {
    warn_code: i64,
    warn_msg: String,
}

/// Handler invoked for each event of a subscription.
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event.
    fn call(&self, event: Event) -> BoxFuture<'static, ()>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, event: Event) -> BoxFuture<'static, ()> {
        Box::pin((self)(event))
    }
}

/// Identifies a subscription for [`EventDispatcher::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    scope: EventScope,
    tx: mpsc::UnboundedSender<Event>,
}

/// Routes push frames to subscribers.
pub struct EventDispatcher {
    subscriptions: Mutex<HashMap<SubscriptionId, Subscription>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    /// Create a dispatcher with no subscriptions.
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe `handler` to events in `scope`.
    ///
    /// Spawns the subscription's delivery task, so it must be called from
    /// within a tokio runtime.
    ///
    /// The queue in front of the handler is unbounded: events for a handler
    /// that never finishes pile up in memory until it is unsubscribed.
    pub fn subscribe<H: EventHandler>(&self, scope: EventScope, handler: H) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler.call(event).await;
            }
        });

        self.subscriptions
            .lock()
            .insert(id, Subscription { scope, tx });
        tracing::debug!(subscription = id.0, ?scope, "subscribed");
        id
    }

    /// Remove a subscription. Events already queued for it are still handled.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.lock().remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = id.0, "unsubscribed");
        }
        removed
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Route a push frame.
    ///
    /// Returns the number of subscriptions the event was queued for.
    pub fn dispatch(&self, frame: &Frame) -> usize {
        let Some(kind) = EventKind::from_frame_type(frame.frame_type()) else {
            tracing::warn!(
                frame_type = frame.frame_type(),
                "dropping push with unknown type"
            );
            return 0;
        };

        let scope = match kind {
            EventKind::NodeStatus => EventScope::Node,
            EventKind::Warning => {
                log_warning(&frame.payload);
                EventScope::Warning
            }
            _ => match MsgPackCodec::decode::<RoomRef>(&frame.payload) {
                Ok(room) => EventScope::Room(room.id),
                Err(e) => {
                    tracing::warn!(?kind, "dropping room event without room id: {}", e);
                    return 0;
                }
            },
        };

        let event = Event {
            kind,
            scope,
            payload: frame.payload.clone(),
        };

        let mut delivered = 0;
        let mut subscriptions = self.subscriptions.lock();
        subscriptions.retain(|id, sub| {
            if sub.scope != scope {
                return true;
            }
            if sub.tx.send(event.clone()).is_err() {
                // Delivery task is gone (handler panicked).
                tracing::debug!(subscription = id.0, "removing dead subscription");
                return false;
            }
            delivered += 1;
            true
        });
        drop(subscriptions);

        if delivered == 0 {
            tracing::debug!(?kind, ?scope, "no subscriber for event");
        }
        delivered
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn log_warning(payload: &[u8]) {
    match MsgPackCodec::decode::<Warning>(payload) {
        Ok(w) => tracing::warn!(code = w.warn_code, "server warning: {}", w.warn_msg),
        Err(_) => tracing::warn!(len = payload.len(), "server warning (undecodable)"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Serialize)]
    struct Emit<'a> {
        id: u64,
        event: &'a str,
        args: Vec<i64>,
    }

    fn emit_frame(room: u64, event: &str, n: i64) -> Frame {
        let payload = MsgPackCodec::encode(&Emit {
            id: room,
            event,
            args: vec![n],
        })
        .unwrap();
        Frame::with_payload(0, types::ON_ROOM_EMIT, Bytes::from(payload))
    }

    #[tokio::test]
    async fn test_room_events_in_order() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.subscribe(EventScope::Room(17), move |event: Event| {
            let tx = tx.clone();
            async move {
                let emit: RoomEmit = event.decode().unwrap();
                tx.send(emit.args[0].as_i64().unwrap()).unwrap();
            }
        });

        for n in 0..50 {
            assert_eq!(dispatcher.dispatch(&emit_frame(17, "tick", n)), 1);
        }
        // other rooms are not delivered
        assert_eq!(dispatcher.dispatch(&emit_frame(18, "tick", 99)), 0);

        for n in 0..50 {
            assert_eq!(rx.recv().await.unwrap(), n);
        }
    }

    #[tokio::test]
    async fn test_slow_handler_does_not_block_dispatch() {
        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatcher.subscribe(EventScope::Room(1), |_event: Event| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        dispatcher.subscribe(EventScope::Room(2), move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event.room_id()).unwrap();
            }
        });

        dispatcher.dispatch(&emit_frame(1, "slow", 0));
        dispatcher.dispatch(&emit_frame(1, "slow", 1));
        dispatcher.dispatch(&emit_frame(2, "fast", 0));

        let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap();
        assert_eq!(got, Some(Some(2)));
    }

    #[tokio::test]
    async fn test_node_status_and_unsubscribe() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        let id = dispatcher.subscribe(EventScope::Node, move |event: Event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(event.decode::<String>().unwrap());
            }
        });

        let payload = MsgPackCodec::encode(&"SHUTTING_DOWN").unwrap();
        let frame = Frame::with_payload(0, types::ON_NODE_STATUS, Bytes::from(payload));
        assert_eq!(dispatcher.dispatch(&frame), 1);

        assert!(dispatcher.unsubscribe(id));
        assert!(!dispatcher.unsubscribe(id));
        assert_eq!(dispatcher.dispatch(&frame), 0);
        assert_eq!(dispatcher.subscription_count(), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec!["SHUTTING_DOWN".to_string()]);
    }

    #[tokio::test]
    async fn test_room_event_without_id_is_dropped() {
        let dispatcher = EventDispatcher::new();
        dispatcher.subscribe(EventScope::Room(0), |_event: Event| async {});

        let payload = MsgPackCodec::encode(&"no id here").unwrap();
        let frame = Frame::with_payload(0, types::ON_ROOM_JOIN, Bytes::from(payload));
        assert_eq!(dispatcher.dispatch(&frame), 0);
    }

    #[tokio::test]
    async fn test_warning_scope() {
        #[derive(Serialize)]
        struct Warn<'a> {
            warn_code: i64,
            warn_msg: &'a str,
        }

        let dispatcher = EventDispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.subscribe(EventScope::Warning, move |event: Event| {
            let tx = tx.clone();
            async move {
                tx.send(event.kind).unwrap();
            }
        });

        let payload = MsgPackCodec::encode(&Warn {
            warn_code: 1,
            warn_msg: "query took long",
        })
        .unwrap();
        let frame = Frame::with_payload(0, types::ON_WARN, Bytes::from(payload));
        assert_eq!(dispatcher.dispatch(&frame), 1);
        assert_eq!(rx.recv().await, Some(EventKind::Warning));
    }

    #[test]
    fn test_kind_from_frame_type() {
        assert_eq!(
            EventKind::from_frame_type(types::ON_ROOM_DELETE),
            Some(EventKind::RoomDelete)
        );
        assert!(EventKind::RoomJoin.is_room());
        assert!(!EventKind::NodeStatus.is_room());
        assert_eq!(EventKind::from_frame_type(types::RES_DATA), None);
    }
}
