//! Cache facade
//!
//! [`RabbitLruCache`] ties the local LRU store, the request-coalescing
//! inflight table, the invalidation protocol, and the connection
//! supervisor together behind one handle. Handles are cheap to clone and
//! share one instance.
//!
//! Mutations publish before they apply locally: peers see the
//! invalidation no later than local consistency would suggest, and since
//! an invalidation is idempotent on its originator there is no
//! corruption if the two race.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::FutureExt;
use lapin::options::BasicCancelOptions;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::config::{AmqpConnectOptions, RabbitLruCacheOptions, ReconnectionOptions};
use crate::errors::{CacheError, CacheResult};
use crate::events::{EventRegistry, InvalidationMessageListener, ReconnectionListener};
use crate::inflight::{InflightTable, LoadError};
use crate::protocol::{self, InvalidationMessage};
use crate::store::LruStore;
use crate::supervisor::{BusHandles, SupervisorState};

/// State shared between the facade and the supervision tasks
pub(crate) struct CacheInner<T> {
    pub(crate) cache_id: String,
    pub(crate) exchange: String,
    pub(crate) queue: String,
    pub(crate) amqp: AmqpConnectOptions,
    pub(crate) reconnection: ReconnectionOptions,
    pub(crate) state: StdMutex<SupervisorState>,
    pub(crate) store: StdMutex<LruStore<T>>,
    pub(crate) inflight: InflightTable<T>,
    pub(crate) events: EventRegistry,
    pub(crate) bus: TokioMutex<Option<BusHandles>>,
    pub(crate) transport_tx: mpsc::UnboundedSender<lapin::Error>,
}

impl<T: Clone + Send + Sync + 'static> CacheInner<T> {
    pub(crate) fn build(
        options: RabbitLruCacheOptions,
        transport_tx: mpsc::UnboundedSender<lapin::Error>,
    ) -> Arc<Self> {
        let cache_id = Uuid::now_v7().to_string();
        let exchange = protocol::exchange_name(&options.name);
        let queue = protocol::queue_name(&exchange, &cache_id);
        Arc::new(Self {
            cache_id,
            exchange,
            queue,
            amqp: options.amqp,
            reconnection: options.reconnection,
            state: StdMutex::new(SupervisorState::Connected),
            store: StdMutex::new(LruStore::new(&options.lru)),
            inflight: InflightTable::new(),
            events: EventRegistry::default(),
            bus: TokioMutex::new(None),
            transport_tx,
        })
    }

    pub(crate) fn state(&self) -> SupervisorState {
        *self.state.lock().unwrap()
    }

    pub(crate) fn set_state(&self, next: SupervisorState) {
        *self.state.lock().unwrap() = next;
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(
            self.state(),
            SupervisorState::Closing | SupervisorState::Closed
        )
    }

    /// Transition into `Closing`; returns false when already closing/closed
    fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, SupervisorState::Closing | SupervisorState::Closed) {
            false
        } else {
            *state = SupervisorState::Closing;
            true
        }
    }

    pub(crate) fn ensure_open(&self, operation: &'static str) -> CacheResult<()> {
        if self.is_closing() {
            Err(CacheError::closing(operation))
        } else {
            Ok(())
        }
    }

    /// Empty the inflight table and the store; loads finishing after this
    /// see their entry gone and do not cache
    pub(crate) fn clear_local_state(&self) {
        self.inflight.clear();
        self.store.lock().unwrap().reset();
    }
}

/// Bounded LRU cache kept coherent across instances via fanout
/// invalidation
///
/// Every instance constructed with the same `name` forms one invalidation
/// domain: a `del` or `reset` on any of them drops the affected entries
/// on all of them. Loads are coalesced per key, so concurrent misses
/// invoke the loader once.
pub struct RabbitLruCache<T> {
    inner: Arc<CacheInner<T>>,
}

impl<T> Clone for RabbitLruCache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for RabbitLruCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitLruCache")
            .field("cache_id", &self.inner.cache_id)
            .field("exchange", &self.inner.exchange)
            .field("state", &*self.inner.state.lock().unwrap())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> RabbitLruCache<T> {
    /// Connect a new cache instance
    ///
    /// Validates the options, connects to the broker, declares the fanout
    /// exchange and this instance's exclusive queue, and starts consuming
    /// invalidations. Must run inside a tokio runtime.
    #[instrument(skip(options), fields(name = %options.name))]
    pub async fn new(options: RabbitLruCacheOptions) -> CacheResult<Self> {
        options.validate()?;
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let inner = CacheInner::build(options, transport_tx);
        inner.attach().await?;
        inner.spawn_supervisor(transport_rx);
        info!(
            cache_id = %inner.cache_id,
            exchange = %inner.exchange,
            "Cache instance ready"
        );
        Ok(Self { inner })
    }

    /// Unique, time-ordered identity of this instance
    pub fn cache_id(&self) -> &str {
        &self.inner.cache_id
    }

    /// Read a key, loading it on a miss
    ///
    /// Concurrent calls for the same key share one loader invocation and
    /// one outcome. A loader yielding `Ok(None)` means "no value": it is
    /// returned to the caller but never cached. A loader failure reaches
    /// every waiting caller as [`CacheError::Load`] and is not cached.
    ///
    /// If the key is invalidated while the load is in flight (by a local
    /// or remote `del`/`reset`, or by a connection loss), the loaded value
    /// is still returned to the callers but stays out of the cache.
    pub async fn get_or_load<F, Fut>(&self, key: &str, load: F) -> CacheResult<Option<T>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<T>, Box<dyn std::error::Error + Send + Sync>>>
            + Send
            + 'static,
    {
        self.inner.ensure_open("get_or_load")?;

        if let Some(value) = self.inner.store.lock().unwrap().get(key) {
            return Ok(Some(value));
        }

        let (future, is_leader) = self.inner.inflight.get_or_insert_with(key, || {
            let load_future = load(key.to_string());
            async move { load_future.await.map_err(LoadError::from) }
                .boxed()
                .shared()
        });

        if !is_leader {
            return future.await.map_err(|source| CacheError::load(key, source));
        }

        let result = future.clone().await;
        match result {
            Ok(Some(value)) => {
                // Cache only if the entry survived the load untouched, and
                // never while disconnected unless stale data is acceptable
                let still_inflight = self.inner.inflight.remove_if_same(key, &future);
                let may_store = self.inner.state() != SupervisorState::Reconnecting
                    || self.inner.reconnection.allow_stale_data;
                if still_inflight && may_store {
                    self.inner.store.lock().unwrap().set(key, value.clone());
                }
                Ok(Some(value))
            }
            Ok(None) => {
                self.inner.inflight.remove_if_same(key, &future);
                Ok(None)
            }
            Err(source) => {
                self.inner.inflight.remove_if_same(key, &future);
                Err(CacheError::load(key, source))
            }
        }
    }

    /// Remove a key here and on every peer
    pub async fn del(&self, key: &str) -> CacheResult<()> {
        self.inner.ensure_open("del")?;
        self.inner
            .publish_invalidation(&InvalidationMessage::delete(key))
            .await;
        self.inner.inflight.remove(key);
        self.inner.store.lock().unwrap().del(key);
        Ok(())
    }

    /// Clear the cache here and on every peer
    pub async fn reset(&self) -> CacheResult<()> {
        self.inner.ensure_open("reset")?;
        self.inner
            .publish_invalidation(&InvalidationMessage::Reset)
            .await;
        self.inner.clear_local_state();
        Ok(())
    }

    /// Whether a live entry exists locally
    pub fn has(&self, key: &str) -> CacheResult<bool> {
        self.inner.ensure_open("has")?;
        Ok(self.inner.store.lock().unwrap().has(key))
    }

    /// Locally cached keys, most recently used first
    pub fn keys(&self) -> CacheResult<Vec<String>> {
        self.inner.ensure_open("keys")?;
        Ok(self.inner.store.lock().unwrap().keys())
    }

    /// Eagerly drop expired local entries
    pub fn prune(&self) -> CacheResult<()> {
        self.inner.ensure_open("prune")?;
        self.inner.store.lock().unwrap().prune();
        Ok(())
    }

    pub fn item_count(&self) -> CacheResult<usize> {
        self.inner.ensure_open("item_count")?;
        Ok(self.inner.store.lock().unwrap().item_count())
    }

    pub fn length(&self) -> CacheResult<usize> {
        self.inner.ensure_open("length")?;
        Ok(self.inner.store.lock().unwrap().length())
    }

    pub fn max(&self) -> CacheResult<usize> {
        self.inner.ensure_open("max")?;
        Ok(self.inner.store.lock().unwrap().max())
    }

    pub fn max_age(&self) -> CacheResult<Option<Duration>> {
        self.inner.ensure_open("max_age")?;
        Ok(self.inner.store.lock().unwrap().max_age())
    }

    pub fn allows_stale(&self) -> CacheResult<bool> {
        self.inner.ensure_open("allows_stale")?;
        Ok(self.inner.store.lock().unwrap().allow_stale())
    }

    pub fn add_invalidation_message_received_listener(
        &self,
        listener: InvalidationMessageListener,
    ) -> CacheResult<()> {
        self.inner
            .ensure_open("add_invalidation_message_received_listener")?;
        self.inner.events.add_invalidation_message_received(listener);
        Ok(())
    }

    pub fn remove_invalidation_message_received_listener(
        &self,
        listener: &InvalidationMessageListener,
    ) -> CacheResult<()> {
        self.inner
            .ensure_open("remove_invalidation_message_received_listener")?;
        self.inner
            .events
            .remove_invalidation_message_received(listener);
        Ok(())
    }

    pub fn add_reconnecting_listener(&self, listener: ReconnectionListener) -> CacheResult<()> {
        self.inner.ensure_open("add_reconnecting_listener")?;
        self.inner.events.add_reconnecting(listener);
        Ok(())
    }

    pub fn remove_reconnecting_listener(&self, listener: &ReconnectionListener) -> CacheResult<()> {
        self.inner.ensure_open("remove_reconnecting_listener")?;
        self.inner.events.remove_reconnecting(listener);
        Ok(())
    }

    pub fn add_reconnected_listener(&self, listener: ReconnectionListener) -> CacheResult<()> {
        self.inner.ensure_open("add_reconnected_listener")?;
        self.inner.events.add_reconnected(listener);
        Ok(())
    }

    pub fn remove_reconnected_listener(&self, listener: &ReconnectionListener) -> CacheResult<()> {
        self.inner.ensure_open("remove_reconnected_listener")?;
        self.inner.events.remove_reconnected(listener);
        Ok(())
    }

    /// Detach from the broker and release every resource
    ///
    /// Cancels the consumer, closes both channels concurrently, closes the
    /// connection, and resets the local store, in that order. Idempotent:
    /// a second call observes the closed state and returns `Ok`.
    #[instrument(skip(self), fields(cache_id = %self.inner.cache_id))]
    pub async fn close(&self) -> CacheResult<()> {
        if !self.inner.begin_close() {
            return Ok(());
        }
        if let Some(handles) = self.inner.bus.lock().await.take() {
            if let Err(error) = handles
                .consumer_channel
                .basic_cancel(&self.inner.cache_id, BasicCancelOptions::default())
                .await
            {
                warn!(error = %error, "Consumer cancel failed during close");
            }
            let (subscriber, publisher) = tokio::join!(
                handles.consumer_channel.close(200, "closing"),
                handles.publisher.close(200, "closing"),
            );
            for result in [subscriber, publisher] {
                if let Err(error) = result {
                    warn!(error = %error, "Channel close failed during close");
                }
            }
            if let Err(error) = handles.connection.close(200, "closing").await {
                warn!(error = %error, "Connection close failed during close");
            }
        }
        self.inner.store.lock().unwrap().reset();
        self.inner.set_state(SupervisorState::Closed);
        info!("Cache instance closed");
        Ok(())
    }
}
