//! Connection supervision
//!
//! Owns the AMQP side of a cache instance: connecting, declaring the
//! fanout topology, consuming invalidations, and recovering from
//! transport loss.
//!
//! ## State machine
//!
//! ```text
//! Connected --error/close--> Reconnecting --reattach ok--> Connected
//!     |                           |
//!     +---------- close ----------+--> Closing --> Closed
//! ```
//!
//! Entering `Reconnecting` empties the local cache and inflight table:
//! with the invalidation channel down, cached data can no longer be
//! trusted. Publishes while `Reconnecting` are dropped; the local
//! mutation still applies, and peers reset themselves on their own
//! disconnect. Reattach succeeds with a fresh connection, fresh channels,
//! and the consumer re-registered under the same cache id, then empties
//! the cache once more so the recovered instance starts from a clean
//! slate.
//!
//! The retry delay is linear and capped: zero for the first attempt, then
//! growing by `retry_interval_increase_ms` per failure up to
//! `retry_interval_up_to_ms`.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, trace, warn};

use crate::cache::CacheInner;
use crate::errors::{CacheError, CacheResult};
use crate::protocol::{InvalidationMessage, CACHE_ID_HEADER};

/// Lifecycle of a cache instance's bus attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SupervisorState {
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

/// Handles of one connected episode; recreated wholesale on reconnect
pub(crate) struct BusHandles {
    pub connection: Connection,
    pub publisher: Channel,
    pub consumer_channel: Channel,
}

/// Once-per-episode transport failure latch
///
/// A dying connection fires its error callback and ends the consumer
/// stream in close succession; only the first event may start a reconnect.
#[derive(Clone)]
struct TransportLatch {
    consumed: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<lapin::Error>,
}

impl TransportLatch {
    fn new(tx: mpsc::UnboundedSender<lapin::Error>) -> Self {
        Self {
            consumed: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    fn trip(&self, error: lapin::Error) {
        if !self.consumed.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(error);
        }
    }
}

/// Synthesized error for a consumer stream that ended without one, e.g.
/// a broker-side consumer cancellation
fn consumer_cancelled_error() -> lapin::Error {
    lapin::Error::InvalidConnectionState(lapin::ConnectionState::Error)
}

/// Linear capped backoff progression
fn next_retry_interval(current: Duration, increase: Duration, up_to: Duration) -> Duration {
    (current + increase).min(up_to)
}

/// Originating cache id, read from the message headers
fn publisher_cache_id(properties: &BasicProperties) -> Option<String> {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(&ShortString::from(CACHE_ID_HEADER)))
        .and_then(|value| match value {
            AMQPValue::LongString(id) => Some(id.to_string()),
            _ => None,
        })
}

impl<T: Clone + Send + Sync + 'static> CacheInner<T> {
    /// Open a connection episode: connect, declare topology, start consuming
    ///
    /// Used both at construction and on every reconnect attempt. On success
    /// the fresh handles replace whatever the previous episode left behind.
    #[instrument(skip(self), fields(cache_id = %self.cache_id, exchange = %self.exchange))]
    pub(crate) async fn attach(self: &Arc<Self>) -> CacheResult<()> {
        let connect = Connection::connect(
            &self.amqp.url,
            ConnectionProperties::default().with_connection_name(self.cache_id.clone().into()),
        );
        let connection = match timeout(
            Duration::from_secs(self.amqp.connection_timeout_seconds.into()),
            connect,
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(CacheError::ConnectTimeout {
                    timeout_seconds: self.amqp.connection_timeout_seconds,
                })
            }
        };

        let publisher = connection.create_channel().await?;
        let consumer_channel = connection.create_channel().await?;

        consumer_channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        consumer_channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        consumer_channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer = consumer_channel
            .basic_consume(
                &self.queue,
                &self.cache_id,
                BasicConsumeOptions {
                    no_ack: true,
                    exclusive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        // Wire the failure paths only once the whole topology is up: an
        // attempt that dies halfway leaves no handler behind to report a
        // stale transport error after a later attempt succeeds.
        let latch = TransportLatch::new(self.transport_tx.clone());
        {
            let latch = latch.clone();
            connection.on_error(move |error| latch.trip(error));
        }
        self.spawn_delivery_loop(consumer, latch);

        *self.bus.lock().await = Some(BusHandles {
            connection,
            publisher,
            consumer_channel,
        });

        info!(
            queue = %self.queue,
            url = %self.amqp.redacted_url(),
            "Attached to invalidation exchange"
        );
        Ok(())
    }

    fn spawn_delivery_loop(self: &Arc<Self>, mut consumer: Consumer, latch: TransportLatch) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(item) = consumer.next().await {
                let Some(inner) = weak.upgrade() else { return };
                match item {
                    Ok(delivery) => {
                        let content = String::from_utf8_lossy(&delivery.data).into_owned();
                        let publisher_id = publisher_cache_id(&delivery.properties);
                        inner.apply_remote_message(&content, publisher_id.as_deref());
                    }
                    Err(error) => {
                        warn!(error = %error, "Consumer stream failed");
                        latch.trip(error);
                        return;
                    }
                }
            }
            // Stream ended without an error item: the broker cancelled the
            // consumer or the channel died under us.
            latch.trip(consumer_cancelled_error());
        });
    }

    /// Apply an inbound invalidation to local state
    ///
    /// Self-originated messages never mutate state and never reach local
    /// observers; everything else emits `invalidation-message-received`
    /// after any state change, including unparseable content.
    pub(crate) fn apply_remote_message(&self, content: &str, publisher_id: Option<&str>) {
        if publisher_id == Some(self.cache_id.as_str()) {
            trace!(content = content, "Self-originated message suppressed");
            return;
        }
        match InvalidationMessage::parse(content) {
            InvalidationMessage::Reset => {
                debug!(publisher = publisher_id.unwrap_or(""), "Peer reset received");
                self.inflight.clear();
                self.store.lock().unwrap().reset();
            }
            InvalidationMessage::Delete(key) => {
                debug!(
                    key = %key,
                    publisher = publisher_id.unwrap_or(""),
                    "Peer delete received"
                );
                self.inflight.remove(&key);
                self.store.lock().unwrap().del(&key);
            }
            InvalidationMessage::Unknown(_) => {
                debug!(content = content, "Unrecognized invalidation message ignored");
            }
        }
        self.events
            .emit_invalidation_message_received(content, publisher_id.unwrap_or(""));
    }

    /// Broadcast an invalidation to every peer queue
    ///
    /// Publishes are suppressed while not `Connected`: the local cache is
    /// already empty during an outage, and peers reset on their own
    /// disconnect. Transport failures here are absorbed; the connection
    /// error callback drives recovery.
    pub(crate) async fn publish_invalidation(&self, message: &InvalidationMessage) {
        if self.state() != SupervisorState::Connected {
            debug!(message = %message.encode(), "Publish suppressed while disconnected");
            return;
        }
        let publisher = self
            .bus
            .lock()
            .await
            .as_ref()
            .map(|handles| handles.publisher.clone());
        let Some(publisher) = publisher else { return };

        let mut headers = FieldTable::default();
        headers.insert(
            CACHE_ID_HEADER.into(),
            AMQPValue::LongString(self.cache_id.clone().into()),
        );
        let payload = message.encode();
        if let Err(error) = publisher
            .basic_publish(
                &self.exchange,
                "",
                BasicPublishOptions::default(),
                payload.as_bytes(),
                BasicProperties::default().with_headers(headers),
            )
            .await
        {
            warn!(
                error = %error,
                message = %payload,
                "Invalidation publish failed; reconnect will resynchronize peers"
            );
        }
    }

    /// Start the background task that reacts to transport failures
    pub(crate) fn spawn_supervisor(
        self: &Arc<Self>,
        mut transport_rx: mpsc::UnboundedReceiver<lapin::Error>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(error) = transport_rx.recv().await {
                let Some(inner) = weak.upgrade() else { return };
                if inner.is_closing() {
                    continue;
                }
                inner.reconnect_loop(error).await;
            }
        });
    }

    /// Reconnect with linear capped backoff until reattached or closed
    #[instrument(skip(self, error), fields(cache_id = %self.cache_id))]
    async fn reconnect_loop(self: &Arc<Self>, error: lapin::Error) {
        let inner = Arc::clone(self);
        self.run_reconnect(error, move || {
            let inner = Arc::clone(&inner);
            async move { inner.attach().await }
        })
        .await;
    }

    /// The reconnect cycle, with the reattach step injected
    ///
    /// `attach` is the production [`CacheInner::attach`]; taking it as a
    /// parameter lets tests drive the cycle against a scripted sequence of
    /// failures.
    async fn run_reconnect<F, Fut>(self: &Arc<Self>, error: lapin::Error, mut attach: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CacheResult<()>>,
    {
        self.set_state(SupervisorState::Reconnecting);
        // Drop the dead episode's handles so close() cannot trip over them
        *self.bus.lock().await = None;
        self.clear_local_state();
        warn!(error = %error, "Connection lost, entering reconnect loop");

        let increase = Duration::from_millis(self.reconnection.retry_interval_increase_ms);
        let up_to = Duration::from_millis(self.reconnection.retry_interval_up_to_ms);
        let mut attempt: u64 = 0;
        let mut retry_interval = Duration::ZERO;

        loop {
            if self.is_closing() {
                return;
            }
            attempt += 1;
            self.events.emit_reconnecting(&error, attempt, retry_interval);
            match attach().await {
                Ok(()) => {
                    if self.is_closing() {
                        // close() won the race; tear the fresh handles down
                        if let Some(handles) = self.bus.lock().await.take() {
                            let _ = handles.connection.close(200, "closing").await;
                        }
                        return;
                    }
                    // Clean slate on recovery: values loaded during the
                    // outage are dropped even when allow_stale_data let
                    // them be served meanwhile.
                    self.clear_local_state();
                    self.set_state(SupervisorState::Connected);
                    info!(attempt, "Reconnected to invalidation exchange");
                    self.events.emit_reconnected(&error, attempt, retry_interval);
                    return;
                }
                Err(attach_error) => {
                    retry_interval = next_retry_interval(retry_interval, increase, up_to);
                    debug!(
                        error = %attach_error,
                        attempt,
                        retry_interval_ms = retry_interval.as_millis() as u64,
                        "Reattach failed"
                    );
                    tokio::time::sleep(retry_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AmqpConnectOptions, LruOptions, RabbitLruCacheOptions, ReconnectionOptions,
    };
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn test_inner(reconnection: ReconnectionOptions) -> Arc<CacheInner<String>> {
        let options = RabbitLruCacheOptions::builder()
            .name("test".to_string())
            .lru(LruOptions::builder().max(100).build())
            .amqp(AmqpConnectOptions::default())
            .reconnection(reconnection)
            .build();
        let (transport_tx, _transport_rx) = mpsc::unbounded_channel();
        CacheInner::build(options, transport_tx)
    }

    /// Recorded as (event, attempt, retry interval in ms, item count at emit)
    type RecordedEvents = Arc<Mutex<Vec<(&'static str, u64, u64, usize)>>>;

    fn record_reconnection_events(inner: &Arc<CacheInner<String>>) -> RecordedEvents {
        let events: RecordedEvents = Arc::default();
        {
            let events = Arc::clone(&events);
            let observed = Arc::clone(inner);
            inner.events.add_reconnecting(Arc::new(move |_, attempt, interval| {
                events.lock().unwrap().push((
                    "reconnecting",
                    attempt,
                    interval.as_millis() as u64,
                    observed.store.lock().unwrap().item_count(),
                ));
            }));
        }
        {
            let events = Arc::clone(&events);
            let observed = Arc::clone(inner);
            inner.events.add_reconnected(Arc::new(move |_, attempt, interval| {
                events.lock().unwrap().push((
                    "reconnected",
                    attempt,
                    interval.as_millis() as u64,
                    observed.store.lock().unwrap().item_count(),
                ));
            }));
        }
        events
    }

    #[test]
    fn test_retry_interval_grows_linearly_to_cap() {
        let increase = Duration::from_millis(1_000);
        let up_to = Duration::from_millis(3_000);

        let mut interval = Duration::ZERO;
        let mut progression = Vec::new();
        for _ in 0..5 {
            interval = next_retry_interval(interval, increase, up_to);
            progression.push(interval.as_millis() as u64);
        }
        assert_eq!(progression, vec![1_000, 2_000, 3_000, 3_000, 3_000]);
    }

    #[test]
    fn test_publisher_cache_id_from_headers() {
        let mut headers = FieldTable::default();
        headers.insert(
            CACHE_ID_HEADER.into(),
            AMQPValue::LongString("cache-a".into()),
        );
        let properties = BasicProperties::default().with_headers(headers);
        assert_eq!(publisher_cache_id(&properties), Some("cache-a".to_string()));
    }

    #[test]
    fn test_publisher_cache_id_missing_header() {
        let properties = BasicProperties::default();
        assert_eq!(publisher_cache_id(&properties), None);

        let properties = BasicProperties::default().with_headers(FieldTable::default());
        assert_eq!(publisher_cache_id(&properties), None);
    }

    #[tokio::test]
    async fn test_latch_fires_once_per_episode() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let latch = TransportLatch::new(tx);

        latch.trip(lapin::Error::ChannelsLimitReached);
        latch.trip(consumer_cancelled_error());

        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reconnect_event_sequence_for_three_failures_then_success() {
        let inner = test_inner(
            ReconnectionOptions::builder()
                .retry_interval_increase_ms(10)
                .build(),
        );
        inner.store.lock().unwrap().set("x", "v".to_string());
        let events = record_reconnection_events(&inner);

        let attempts = Arc::new(AtomicUsize::new(0));
        let attach_attempts = Arc::clone(&attempts);
        inner
            .run_reconnect(lapin::Error::ChannelsLimitReached, move || {
                let attempt = attach_attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(CacheError::Transport(lapin::Error::ChannelsLimitReached))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        // One reconnecting per attempt, the last immediately preceding
        // reconnected; the interval grows only after a failure; the cache
        // is already empty when the first event fires.
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ("reconnecting", 1, 0, 0),
                ("reconnecting", 2, 10, 0),
                ("reconnecting", 3, 20, 0),
                ("reconnecting", 4, 30, 0),
                ("reconnected", 4, 30, 0),
            ]
        );
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(inner.state(), SupervisorState::Connected);
        assert_eq!(inner.store.lock().unwrap().item_count(), 0);
    }

    #[tokio::test]
    async fn test_recovery_discards_values_loaded_during_outage() {
        let inner = test_inner(
            ReconnectionOptions::builder()
                .allow_stale_data(true)
                .retry_interval_increase_ms(10)
                .build(),
        );

        let attempts = Arc::new(AtomicUsize::new(0));
        let attach_attempts = Arc::clone(&attempts);
        let outage_store = Arc::clone(&inner);
        inner
            .run_reconnect(lapin::Error::ChannelsLimitReached, move || {
                let attempt = attach_attempts.fetch_add(1, Ordering::SeqCst);
                let outage_store = Arc::clone(&outage_store);
                async move {
                    if attempt == 0 {
                        // A load finishing mid-outage lands in the store
                        // because allow_stale_data permits it
                        outage_store
                            .store
                            .lock()
                            .unwrap()
                            .set("z", "v".to_string());
                        Err(CacheError::Transport(lapin::Error::ChannelsLimitReached))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        // Reattach wipes the slate: the stale value does not survive
        assert!(!inner.store.lock().unwrap().has("z"));
        assert_eq!(inner.state(), SupervisorState::Connected);
    }

    #[tokio::test]
    async fn test_closing_stops_reconnect_loop() {
        let inner = test_inner(
            ReconnectionOptions::builder()
                .retry_interval_increase_ms(10)
                .retry_interval_up_to_ms(10)
                .build(),
        );
        let events = record_reconnection_events(&inner);

        let cycle = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                inner
                    .run_reconnect(lapin::Error::ChannelsLimitReached, move || async move {
                        Err(CacheError::Transport(lapin::Error::ChannelsLimitReached))
                    })
                    .await;
            })
        };

        tokio::time::sleep(Duration::from_millis(35)).await;
        inner.set_state(SupervisorState::Closing);
        // The loop observes Closing and returns instead of retrying
        cycle.await.unwrap();

        let emitted = events.lock().unwrap().len();
        assert!(emitted >= 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(events.lock().unwrap().len(), emitted);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|(event, _, _, _)| *event == "reconnecting"));
        assert_eq!(inner.state(), SupervisorState::Closing);
    }
}
