//! One-shot messages between contexts that do not share memory.
//!
//! Every message is serialized on send and decoded again for each receiving
//! context, so nothing but the wire form crosses a context boundary.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::Identity;

use super::handle::StopHandle;

/// Execution contexts of the extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Page,
    Background,
    Settings,
}

impl ContextKind {
    /// The page can only talk to the background; everyone else reaches everyone.
    pub fn can_reach(self, other: ContextKind) -> bool {
        match (self, other) {
            (a, b) if a == b => false,
            (ContextKind::Page, ContextKind::Settings) => false,
            _ => true,
        }
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextKind::Page => "page",
            ContextKind::Background => "background",
            ContextKind::Settings => "settings",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    DidObtainSources,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::DidObtainSources => "feed-throttle:didObtainSources",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", content = "payload")]
pub enum Message {
    #[serde(rename = "feed-throttle:didObtainSources")]
    DidObtainSources { sources: Vec<Identity> },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::DidObtainSources { .. } => MessageType::DidObtainSources,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageResponse {
    pub message_type: MessageType,
    /// Context that answered.
    pub context: ContextKind,
    pub payload: Option<serde_json::Value>,
}

pub type ListenerResult = Result<Option<serde_json::Value>>;
type Listener = Arc<dyn Fn(Message) -> BoxFuture<'static, ListenerResult> + Send + Sync>;

/// Handlers for the message types a context claims.
#[derive(Clone, Default)]
pub struct MessageListeners {
    handlers: HashMap<MessageType, Listener>,
}

impl MessageListeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F, Fut>(mut self, message_type: MessageType, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        let listener: Listener = Arc::new(move |message| handler(message).boxed());
        self.handlers.insert(message_type, listener);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOptions {
    /// Re-emit messages no listener here claimed, so contexts that cannot
    /// reach each other directly can still talk through this one.
    pub broadcast_unhandled: bool,
}

struct Registration {
    id: u64,
    listeners: MessageListeners,
    broadcast_unhandled: bool,
}

struct EndpointEntry {
    id: u64,
    kind: ContextKind,
    registrations: Vec<Registration>,
}

impl EndpointEntry {
    fn handlers(&self, message_type: MessageType) -> Vec<Listener> {
        self.registrations
            .iter()
            .filter_map(|r| r.listeners.handlers.get(&message_type).cloned())
            .collect()
    }

    fn relays(&self) -> bool {
        self.registrations.iter().any(|r| r.broadcast_unhandled)
    }
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    endpoints: Vec<EndpointEntry>,
}

impl HubInner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Connects the live contexts of one running extension.
#[derive(Default)]
pub struct MessageHub {
    inner: Mutex<HubInner>,
}

/// One delivery planned while the hub is locked, run after it is released.
enum Delivery {
    Handle(ContextKind, Listener),
    Relay(ContextKind, Vec<(ContextKind, Listener)>),
    Unclaimed(ContextKind),
}

impl MessageHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a live context. It stays reachable until the endpoint is dropped.
    pub fn endpoint(self: &Arc<Self>, kind: ContextKind) -> Endpoint {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.endpoints.push(EndpointEntry {
            id,
            kind,
            registrations: Vec::new(),
        });
        Endpoint {
            hub: Arc::clone(self),
            id,
            kind,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn plan(&self, origin: u64, origin_kind: ContextKind, message_type: MessageType) -> Vec<Delivery> {
        let inner = self.lock();
        inner
            .endpoints
            .iter()
            .filter(|e| e.id != origin && origin_kind.can_reach(e.kind))
            .flat_map(|target| {
                let handlers = target.handlers(message_type);
                if !handlers.is_empty() {
                    return handlers
                        .into_iter()
                        .map(|h| Delivery::Handle(target.kind, h))
                        .collect::<Vec<_>>();
                }
                if target.relays() {
                    let onward = inner
                        .endpoints
                        .iter()
                        .filter(|e| e.id != origin && e.id != target.id)
                        .filter(|e| target.kind.can_reach(e.kind))
                        .flat_map(|e| {
                            e.handlers(message_type)
                                .into_iter()
                                .map(move |h| (e.kind, h))
                        })
                        .collect();
                    return vec![Delivery::Relay(target.kind, onward)];
                }
                vec![Delivery::Unclaimed(target.kind)]
            })
            .collect()
    }
}

/// A context's connection to the hub.
pub struct Endpoint {
    hub: Arc<MessageHub>,
    id: u64,
    kind: ContextKind,
}

impl Endpoint {
    /// Send `message` to every live context this one can reach.
    ///
    /// All listeners run even if some fail; the first failure is then
    /// returned to the caller.
    pub async fn send(&self, message: Message) -> Result<Vec<MessageResponse>> {
        let message_type = message.message_type();
        let wire = serde_json::to_string(&message)?;
        let deliveries = self.hub.plan(self.id, self.kind, message_type);
        tracing::debug!(
            "{} sends {} to {} contexts",
            self.kind,
            message_type.as_str(),
            deliveries.len()
        );

        let runs = deliveries.into_iter().map(|delivery| {
            let wire = wire.clone();
            async move {
                match delivery {
                    Delivery::Handle(kind, listener) => {
                        invoke(kind, &listener, &wire)
                            .await
                            .map(|payload| MessageResponse {
                                message_type,
                                context: kind,
                                payload,
                            })
                    }
                    Delivery::Relay(kind, onward) => {
                        tracing::debug!("{} relays unclaimed {}", kind, message_type.as_str());
                        let relayed = onward
                            .iter()
                            .map(|(target, listener)| invoke(*target, listener, &wire));
                        for result in join_all(relayed).await {
                            if let Err(e) = result {
                                tracing::warn!("Relayed {} failed: {}", message_type.as_str(), e);
                            }
                        }
                        Ok(MessageResponse {
                            message_type,
                            context: kind,
                            payload: None,
                        })
                    }
                    Delivery::Unclaimed(kind) => Ok(MessageResponse {
                        message_type,
                        context: kind,
                        payload: None,
                    }),
                }
            }
        });

        join_all(runs).await.into_iter().collect()
    }

    /// Start handling messages sent to this context.
    pub fn receive(&self, listeners: MessageListeners, options: ReceiveOptions) -> StopHandle {
        let mut inner = self.hub.lock();
        let registration_id = inner.next_id();
        if let Some(entry) = inner.endpoints.iter_mut().find(|e| e.id == self.id) {
            entry.registrations.push(Registration {
                id: registration_id,
                listeners,
                broadcast_unhandled: options.broadcast_unhandled,
            });
        }
        drop(inner);

        let hub: Weak<MessageHub> = Arc::downgrade(&self.hub);
        let endpoint_id = self.id;
        StopHandle::new(move || {
            if let Some(hub) = hub.upgrade() {
                let mut inner = hub.lock();
                if let Some(entry) = inner.endpoints.iter_mut().find(|e| e.id == endpoint_id) {
                    entry.registrations.retain(|r| r.id != registration_id);
                }
            }
        })
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let mut inner = self.hub.lock();
        inner.endpoints.retain(|e| e.id != self.id);
    }
}

/// Decode the wire form for one context and run its listener, turning a
/// panic into an error so the other deliveries still complete.
async fn invoke(kind: ContextKind, listener: &Listener, wire: &str) -> ListenerResult {
    let message: Message = serde_json::from_str(wire)?;
    match AssertUnwindSafe(listener(message)).catch_unwind().await {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(e)) => {
            tracing::warn!("Listener in {} failed: {}", kind, e);
            Err(e)
        }
        Err(_) => {
            tracing::error!("Listener in {} panicked", kind);
            Err(AppError::Messaging(format!("listener in {} panicked", kind)))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::models::resolve_from_name;
    use tokio_test::{assert_err, assert_ok};

    fn obtained(names: &[&str]) -> Message {
        Message::DidObtainSources {
            sources: names.iter().filter_map(|n| resolve_from_name(n)).collect(),
        }
    }

    fn counting(counter: &Arc<AtomicUsize>) -> MessageListeners {
        let counter = Arc::clone(counter);
        MessageListeners::new().on(MessageType::DidObtainSources, move |message| {
            let counter = Arc::clone(&counter);
            async move {
                let Message::DidObtainSources { sources } = message;
                counter.fetch_add(sources.len(), Ordering::SeqCst);
                Ok(Some(serde_json::json!({ "received": sources.len() })))
            }
        })
    }

    fn fail() -> ListenerResult {
        Err(AppError::Messaging("boom".into()))
    }

    fn explode() -> ListenerResult {
        panic!("listener bug")
    }

    #[test]
    fn wire_format_uses_message_type_tag() {
        let json = serde_json::to_value(obtained(&["r/rust"])).unwrap();
        assert_eq!(json["messageType"], "feed-throttle:didObtainSources");
        assert_eq!(json["payload"]["sources"][0]["id"], "r/rust");
    }

    #[tokio::test]
    async fn page_reaches_background_but_not_settings() {
        let hub = MessageHub::new();
        let page = hub.endpoint(ContextKind::Page);
        let background = hub.endpoint(ContextKind::Background);
        let settings = hub.endpoint(ContextKind::Settings);

        let seen_background = Arc::new(AtomicUsize::new(0));
        let seen_settings = Arc::new(AtomicUsize::new(0));
        let _bg = background.receive(counting(&seen_background), ReceiveOptions::default());
        let _st = settings.receive(counting(&seen_settings), ReceiveOptions::default());

        let responses = assert_ok!(page.send(obtained(&["r/a", "r/b"])).await);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].context, ContextKind::Background);
        assert_eq!(responses[0].payload, Some(serde_json::json!({ "received": 2 })));
        assert_eq!(seen_background.load(Ordering::SeqCst), 2);
        assert_eq!(seen_settings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unclaimed_messages_are_relayed() {
        let hub = MessageHub::new();
        let page = hub.endpoint(ContextKind::Page);
        let background = hub.endpoint(ContextKind::Background);
        let settings = hub.endpoint(ContextKind::Settings);

        let seen = Arc::new(AtomicUsize::new(0));
        let _relay = background.receive(
            MessageListeners::new(),
            ReceiveOptions {
                broadcast_unhandled: true,
            },
        );
        let _st = settings.receive(counting(&seen), ReceiveOptions::default());

        let responses = assert_ok!(page.send(obtained(&["r/a"])).await);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].context, ContextKind::Background);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_others() {
        let hub = MessageHub::new();
        let settings = hub.endpoint(ContextKind::Settings);
        let background = hub.endpoint(ContextKind::Background);
        let page = hub.endpoint(ContextKind::Page);

        let failing = background.receive(
            MessageListeners::new().on(MessageType::DidObtainSources, |_| async { fail() }),
            ReceiveOptions::default(),
        );
        let seen = Arc::new(AtomicUsize::new(0));
        let _pg = page.receive(counting(&seen), ReceiveOptions::default());

        let err = assert_err!(settings.send(obtained(&["r/a"])).await);
        assert!(matches!(err, AppError::Messaging(_)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // The failing listener can still be removed.
        failing.stop();
        let responses = assert_ok!(settings.send(obtained(&["r/a"])).await);
        assert_eq!(responses.len(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_listener_is_contained() {
        let hub = MessageHub::new();
        let page = hub.endpoint(ContextKind::Page);
        let background = hub.endpoint(ContextKind::Background);

        let _bg = background.receive(
            MessageListeners::new().on(MessageType::DidObtainSources, |_| async { explode() }),
            ReceiveOptions::default(),
        );

        let err = assert_err!(page.send(obtained(&["r/a"])).await);
        assert!(matches!(err, AppError::Messaging(_)));
    }

    #[tokio::test]
    async fn dropped_endpoints_are_no_longer_reached() {
        let hub = MessageHub::new();
        let page = hub.endpoint(ContextKind::Page);
        let background = hub.endpoint(ContextKind::Background);
        let seen = Arc::new(AtomicUsize::new(0));
        let _bg = background.receive(counting(&seen), ReceiveOptions::default());

        drop(background);
        let responses = assert_ok!(page.send(obtained(&["r/a"])).await);
        assert!(responses.is_empty());
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }
}
