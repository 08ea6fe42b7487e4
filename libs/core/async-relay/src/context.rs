//! Relay wiring
//!
//! Everything is constructed once here and handed to callers; there is no
//! process-global client.

use redis::aio::ConnectionManager;
use std::sync::Arc;

use crate::broker::{MessageBroker, RedisStreamBroker, ResilientBroker};
use crate::config::RelayConfig;
use crate::consumer::{ResultFeed, StreamConsumer};
use crate::dispatcher::Dispatcher;
use crate::health::{BrokerProbe, ConnectionHealthState, HealthProbe, StartupHealthGate, StoreProbe};
use crate::listener::ResultListener;
use crate::lock::DistributedLock;
use crate::resilience::Resilience;
use crate::result_store::ResultStore;
use crate::routes::RouteTable;
use crate::store::{KeyValueStore, RedisStore};
use crate::waiter::WaitFacade;

#[derive(Clone)]
pub struct RelayContext {
    pub config: RelayConfig,
    pub store: Arc<dyn KeyValueStore>,
    pub results: ResultStore,
    pub broker: ResilientBroker,
    pub dispatcher: Dispatcher,
    pub waiter: WaitFacade,
    pub lock: DistributedLock,
    pub health: ConnectionHealthState,
    feed: Arc<dyn ResultFeed>,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn KeyValueStore>,
        broker: Arc<dyn MessageBroker>,
        feed: Arc<dyn ResultFeed>,
        routes: RouteTable,
    ) -> Self {
        let store_resilience = Resilience::new("store", config.store_retry);
        let broker_resilience =
            Resilience::new("broker", config.broker_retry).with_circuit_breaker(config.circuit_breaker);

        let results = ResultStore::new(store.clone(), store_resilience.clone(), config.result_ttl);
        let broker = ResilientBroker::new(broker, broker_resilience);
        let dispatcher = Dispatcher::new(broker.clone(), results.clone(), routes);
        let waiter = WaitFacade::new(results.clone(), config.wait);
        let lock = DistributedLock::new(
            store.clone(),
            store_resilience,
            config.instance_id.clone(),
            &config.lock,
        );

        Self {
            config,
            store,
            results,
            broker,
            dispatcher,
            waiter,
            lock,
            health: ConnectionHealthState::new(),
            feed,
        }
    }

    /// Broker, store and results feed all on one Redis connection manager
    pub fn from_redis(redis: ConnectionManager, config: RelayConfig, routes: RouteTable) -> Self {
        let store = Arc::new(RedisStore::new(redis.clone()));
        let broker = Arc::new(RedisStreamBroker::new(redis.clone(), config.request_max_length));
        let feed = Arc::new(StreamConsumer::new(redis, config.listener.clone()));
        Self::new(config, store, broker, feed, routes)
    }

    pub fn feed(&self) -> Arc<dyn ResultFeed> {
        self.feed.clone()
    }

    pub fn listener(&self) -> ResultListener {
        ResultListener::new(self.feed.clone(), self.results.clone(), self.config.listener.batch_size)
            .with_claim_idle(self.config.listener.claim_idle)
    }

    /// Gate over `leading` probes (e.g. a database) followed by the broker and the store
    pub fn health_gate(&self, leading: Vec<Arc<dyn HealthProbe>>) -> StartupHealthGate {
        let gate = leading
            .into_iter()
            .fold(StartupHealthGate::new(self.config.health_gate, self.health.clone()), |gate, probe| {
                gate.with_probe(probe)
            });
        gate.with_probe(Arc::new(BrokerProbe::new(self.broker.clone())))
            .with_probe(Arc::new(StoreProbe::new(self.store.clone())))
    }
}
