use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use nanobot_core::bus::{BusError, InboundMessage, MessageBus};

/// Injected callback receiving every normalized inbound message an adapter
/// produces. The gateway wires this to publish onto the bus.
pub type InboundHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

/// Contract every chat transport adapter satisfies.
///
/// Methods take `&self` so adapters can be shared behind `Arc`; internal
/// mutability uses the usual tokio primitives. `set_inbound_handler` must be
/// called before `start`, or inbound messages are dropped.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name (e.g. "telegram", "discord").
    fn name(&self) -> &str;

    /// Whether the channel is configured to run.
    fn enabled(&self) -> bool;

    /// Install the handler invoked for each inbound message.
    fn set_inbound_handler(&self, handler: InboundHandler);

    /// Begin observing the transport.
    async fn start(&self) -> Result<()>;

    /// Stop the channel and release transport resources.
    async fn stop(&self) -> Result<()>;

    /// Deliver a message to a chat on this transport.
    async fn send(&self, chat_id: &str, text: &str) -> Result<()>;
}

/// The standard handler: publish to the bus, dropping (with a log line) on
/// overflow so a slow agent never blocks a transport read loop.
pub fn bus_inbound_handler(bus: Arc<MessageBus>) -> InboundHandler {
    Arc::new(move |msg| match bus.publish_inbound(msg) {
        Ok(()) => {}
        Err(BusError::Full) => warn!("Inbound queue full, dropping message"),
        Err(e) => warn!("Dropping inbound message: {e}"),
    })
}

/// Holds an adapter's injected handler behind a lock.
pub(crate) struct HandlerSlot {
    handler: std::sync::Mutex<Option<InboundHandler>>,
}

impl HandlerSlot {
    pub(crate) fn new() -> Self {
        Self {
            handler: std::sync::Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, handler: InboundHandler) {
        *self.handler.lock().expect("handler slot poisoned") = Some(handler);
    }

    pub(crate) fn dispatch(&self, msg: InboundMessage) {
        let handler = self.handler.lock().expect("handler slot poisoned").clone();
        match handler {
            Some(handler) => handler(msg),
            None => warn!("No inbound handler set; dropping message"),
        }
    }
}

/// Matches a sender against an allow-list. An empty list admits everyone;
/// entries match any of the provided identity forms.
pub(crate) fn is_sender_allowed(identities: &[&str], allow_from: &[String]) -> bool {
    if allow_from.is_empty() {
        return true;
    }
    identities
        .iter()
        .any(|id| !id.is_empty() && allow_from.iter().any(|a| a == id))
}

/// Registry of constructed channel adapters, keyed by name.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, channel: Arc<dyn Channel>) {
        let name = channel.name().to_string();
        info!("Registered channel: {name}");
        self.channels.write().await.insert(name, channel);
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().await.values().cloned().collect()
    }

    pub async fn enabled(&self) -> Vec<Arc<dyn Channel>> {
        self.channels
            .read()
            .await
            .values()
            .filter(|c| c.enabled())
            .cloned()
            .collect()
    }

    pub async fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .await
            .values()
            .filter(|c| c.enabled())
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain the outbound queue and hand each record to the matching channel.
/// Transient send failures are logged and swallowed; the pump never stops
/// until cancellation.
pub async fn run_outbound_pump(
    bus: Arc<MessageBus>,
    registry: Arc<ChannelRegistry>,
    cancel: CancellationToken,
) {
    loop {
        let msg = match bus.consume_outbound(&cancel).await {
            Ok(m) => m,
            Err(BusError::Cancelled) | Err(BusError::Closed) => return,
            Err(e) => {
                warn!("Outbound consume error: {e}");
                continue;
            }
        };

        if msg.channel.is_empty() {
            continue;
        }

        match registry.get(&msg.channel).await {
            Some(channel) => {
                if let Err(e) = channel.send(&msg.chat_id, &msg.content).await {
                    warn!("Error sending to channel {}: {e}", msg.channel);
                }
            }
            None => {
                if msg.channel != "cli" && msg.channel != "system" {
                    warn!("No channel registered for: {}", msg.channel);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nanobot_core::bus::OutboundMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockChannel {
        name: String,
        enabled: bool,
        handler: HandlerSlot,
        starts: AtomicUsize,
        stops: AtomicUsize,
        sends: AtomicUsize,
    }

    impl MockChannel {
        fn new(name: &str, enabled: bool) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                enabled,
                handler: HandlerSlot::new(),
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                sends: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            &self.name
        }
        fn enabled(&self) -> bool {
            self.enabled
        }
        fn set_inbound_handler(&self, handler: InboundHandler) {
            self.handler.set(handler);
        }
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn send(&self, _chat_id: &str, _text: &str) -> Result<()> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn allow_list_empty_admits_all() {
        assert!(is_sender_allowed(&["alice"], &[]));
    }

    #[test]
    fn allow_list_matches_any_identity() {
        let allow = vec!["12345".to_string(), "bob".to_string()];
        assert!(is_sender_allowed(&["alice", "12345"], &allow));
        assert!(is_sender_allowed(&["bob"], &allow));
        assert!(!is_sender_allowed(&["mallory", "999"], &allow));
        assert!(!is_sender_allowed(&[""], &allow));
    }

    #[test]
    fn handler_slot_dispatches_to_installed_handler() {
        let slot = HandlerSlot::new();

        // No handler yet: the message is dropped without panicking.
        slot.dispatch(InboundMessage::new("x", "u", "1", "lost"));

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        slot.set(Arc::new(move |msg| {
            sink.lock().unwrap().push(msg.content);
        }));

        slot.dispatch(InboundMessage::new("x", "u", "1", "kept"));
        assert_eq!(*seen.lock().unwrap(), vec!["kept"]);
    }

    #[test]
    fn mock_channel_routes_through_injected_handler() {
        let channel = MockChannel::new("mock", true);
        let bus = Arc::new(MessageBus::new(4));
        channel.set_inbound_handler(bus_inbound_handler(bus.clone()));

        channel
            .handler
            .dispatch(InboundMessage::new("mock", "u", "1", "hi"));
        assert_eq!(bus.try_consume_inbound().unwrap().content, "hi");
    }

    #[tokio::test]
    async fn registry_filters_enabled() {
        let registry = ChannelRegistry::new();
        registry.register(MockChannel::new("telegram", true)).await;
        registry.register(MockChannel::new("discord", false)).await;

        assert_eq!(registry.enabled_names().await, vec!["telegram"]);
        assert!(registry.get("discord").await.is_some());
        assert_eq!(registry.all().await.len(), 2);
    }

    #[tokio::test]
    async fn pump_routes_by_channel_name() {
        let bus = Arc::new(MessageBus::new(8));
        let registry = Arc::new(ChannelRegistry::new());
        let telegram = MockChannel::new("telegram", true);
        registry.register(telegram.clone()).await;

        let cancel = CancellationToken::new();
        let pump = tokio::spawn(run_outbound_pump(
            bus.clone(),
            registry.clone(),
            cancel.clone(),
        ));

        bus.publish_outbound(OutboundMessage::new("telegram", "1", "hello"))
            .unwrap();
        bus.publish_outbound(OutboundMessage::new("unknown", "1", "lost"))
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(telegram.sends.load(Ordering::SeqCst), 1);

        cancel.cancel();
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn bus_handler_drops_on_full_queue() {
        let bus = Arc::new(MessageBus::new(1));
        let handler = bus_inbound_handler(bus.clone());
        handler(InboundMessage::new("x", "u", "1", "a"));
        // Queue is full now; this drop must not panic or block.
        handler(InboundMessage::new("x", "u", "1", "b"));
        assert!(bus.try_consume_inbound().is_some());
        assert!(bus.try_consume_inbound().is_none());
    }
}
