//! The one place shared resources are constructed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use capbridge_core::sync::lock;
use capbridge_core::{
    BoundedBlockingQueue, Deadline, Error, ExpiringCache, HolderId, LockTable, NamedLock, Result, Sweeper,
    TopicEventBus, Value,
};
use capbridge_db::Database;
use capbridge_net::{
    HttpClient, HttpClientConfig, Protocol, SocketConfig, SocketMode, TcpConnection,
    TcpListenerHandle, UdpConnection,
};

use crate::capability::Capability;
use crate::config::{CapabilityConfig, DatabaseConfig, RegistryConfig};
use crate::kind::{CapabilityKey, CapabilityKind};

/// One resource, built at most once.
type Slot = Mutex<Option<Capability>>;

/// How long a socket dial made through [`CapabilityRegistry::resolve`] may take.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves `(kind, configuration)` to a capability handle.
///
/// Resources are built on first request and kept for the life of the
/// registry. Locks all live in one [`LockTable`], so a lock name means the
/// same lock everywhere. Dialed sockets are the exception: every dial opens
/// a new connection.
pub struct CapabilityRegistry {
    config: RegistryConfig,
    locks: Arc<LockTable>,
    resources: Mutex<HashMap<CapabilityKey, Arc<Slot>>>,
    sweepers: Mutex<Vec<Sweeper>>,
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("config", &self.config)
            .field("resources", &self.len())
            .finish_non_exhaustive()
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl CapabilityRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            locks: Arc::new(LockTable::new()),
            resources: Mutex::new(HashMap::new()),
            sweepers: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Number of shared resources constructed so far.
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<Slot>> = lock(&self.resources).values().cloned().collect();
        // A slot still under construction is busy and not yet counted.
        slots
            .iter()
            .filter(|slot| match slot.try_lock() {
                Ok(built) => built.is_some(),
                Err(std::sync::TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_some(),
                Err(std::sync::TryLockError::WouldBlock) => false,
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a capability from its kind name and JSON configuration.
    pub fn resolve_named(&self, kind: &str, config: &serde_json::Value) -> Result<Capability> {
        self.resolve(kind.parse()?, config)
    }

    /// Resolve a capability. Identical `(kind, config)` pairs return handles
    /// to the same resource, dialed sockets excepted.
    pub fn resolve(&self, kind: CapabilityKind, config: &serde_json::Value) -> Result<Capability> {
        self.resolve_config(CapabilityConfig::parse(kind, config)?)
    }

    pub fn resolve_config(&self, config: CapabilityConfig) -> Result<Capability> {
        match config {
            CapabilityConfig::Queue(queue) => self.queue(&queue.name, queue.capacity).map(Capability::Queue),
            CapabilityConfig::Pipe(named) => self.pipe(&named.name).map(Capability::Pipe),
            CapabilityConfig::Lock(named) => Ok(Capability::Lock(self.lock(&named.name))),
            CapabilityConfig::Cache(named) => self.cache(&named.name).map(Capability::Cache),
            CapabilityConfig::EventBus(named) => self.event_bus(&named.name).map(Capability::EventBus),
            CapabilityConfig::Database(db) => self.database(&db).map(Capability::Database),
            CapabilityConfig::HttpClient(http) => self.http_client(http).map(Capability::HttpClient),
            CapabilityConfig::Socket(socket) => self.socket(&socket, &Deadline::after(DEFAULT_DIAL_TIMEOUT)),
        }
    }

    /// Look `key` up, building it with `create` on first use.
    ///
    /// The table lock is only held to find the key's slot. Building happens
    /// under the slot's own lock, so concurrent first requests for one key
    /// still build it once while other keys resolve freely.
    fn shared(&self, key: CapabilityKey, create: impl FnOnce() -> Result<Capability>) -> Result<Capability> {
        let slot = Arc::clone(lock(&self.resources).entry(key.clone()).or_default());
        let mut slot = lock(&slot);
        if let Some(existing) = slot.as_ref() {
            return Ok(existing.clone());
        }
        let capability = create()?;
        tracing::debug!(capability = %key, "capability constructed");
        *slot = Some(capability.clone());
        Ok(capability)
    }

    pub fn queue(&self, name: &str, capacity: Option<usize>) -> Result<Arc<BoundedBlockingQueue<Value>>> {
        let wanted = capacity.unwrap_or(self.config.default_queue_capacity);
        let key = CapabilityKey::new(CapabilityKind::Queue, name);
        let capability = self.shared(key, || {
            Ok(Capability::Queue(Arc::new(BoundedBlockingQueue::new(wanted))))
        })?;
        let queue = expect_queue(capability)?;
        if capacity.is_some() && queue.capacity() != wanted {
            tracing::warn!(
                queue = name,
                existing = queue.capacity(),
                requested = wanted,
                "queue already exists with a different capacity"
            );
        }
        Ok(queue)
    }

    pub fn pipe(&self, name: &str) -> Result<Arc<BoundedBlockingQueue<Value>>> {
        let capacity = self.config.pipe_capacity;
        let key = CapabilityKey::new(CapabilityKind::Pipe, name);
        let capability = self.shared(key, || {
            Ok(Capability::Pipe(Arc::new(BoundedBlockingQueue::new(capacity))))
        })?;
        expect_queue(capability)
    }

    /// Locks are not stored as resources; every handle points into the one
    /// lock table.
    pub fn lock(&self, name: &str) -> NamedLock {
        NamedLock::new(Arc::clone(&self.locks), name)
    }

    /// Host-level cleanup of every lock a holder still owns.
    pub fn release_locks(&self, holder: HolderId) -> Vec<String> {
        self.locks.release_all(holder)
    }

    pub fn cache(&self, name: &str) -> Result<Arc<ExpiringCache<Value>>> {
        let key = CapabilityKey::new(CapabilityKind::Cache, name);
        let capability = self.shared(key, || {
            let cache = Arc::new(ExpiringCache::new());
            if let Some(interval) = self.config.cache_sweep_interval_ms.filter(|ms| *ms > 0) {
                let sweeper = cache.spawn_sweeper(Duration::from_millis(interval))?;
                lock(&self.sweepers).push(sweeper);
            }
            Ok(Capability::Cache(cache))
        })?;
        match capability {
            Capability::Cache(cache) => Ok(cache),
            other => Err(mismatch(CapabilityKind::Cache, &other)),
        }
    }

    pub fn event_bus(&self, name: &str) -> Result<Arc<TopicEventBus>> {
        let capacity = self.config.subscriber_capacity;
        let key = CapabilityKey::new(CapabilityKind::EventBus, name);
        let capability = self.shared(key, || {
            Ok(Capability::EventBus(Arc::new(TopicEventBus::new(capacity))))
        })?;
        match capability {
            Capability::EventBus(bus) => Ok(bus),
            other => Err(mismatch(CapabilityKind::EventBus, &other)),
        }
    }

    /// One pool per `(driver, connection)`; the pool size of the first
    /// request wins.
    pub fn database(&self, config: &DatabaseConfig) -> Result<Arc<Database>> {
        let key = CapabilityKey::new(
            CapabilityKind::Database,
            format!("{}\u{0}{}", config.driver.to_ascii_lowercase(), config.connection),
        );
        let pool_size = config.pool_size.unwrap_or(self.config.database_pool_size);
        let capability = self.shared(key, || {
            Database::open(&config.driver, &config.connection, pool_size)
                .map(|db| Capability::Database(Arc::new(db)))
        })?;
        match capability {
            Capability::Database(db) => Ok(db),
            other => Err(mismatch(CapabilityKind::Database, &other)),
        }
    }

    pub fn http_client(&self, config: HttpClientConfig) -> Result<Arc<HttpClient>> {
        let signature = serde_json::to_string(&config)
            .map_err(|e| Error::upstream("serialize http client configuration", e))?;
        let key = CapabilityKey::new(CapabilityKind::HttpClient, signature);
        let capability = self.shared(key, || {
            HttpClient::new(config).map(|client| Capability::HttpClient(Arc::new(client)))
        })?;
        match capability {
            Capability::HttpClient(client) => Ok(client),
            other => Err(mismatch(CapabilityKind::HttpClient, &other)),
        }
    }

    /// Listening sockets are shared by protocol and address. Dialing always
    /// connects anew; a TCP dial waits at most until `deadline`.
    pub fn socket(&self, config: &SocketConfig, deadline: &Deadline) -> Result<Capability> {
        match (config.protocol, config.mode) {
            (Protocol::Tcp, SocketMode::Dial) => TcpConnection::dial(&config.host, config.port, deadline)
                .map(|conn| Capability::TcpConnection(Arc::new(conn))),
            (Protocol::Udp, SocketMode::Dial) => UdpConnection::dial(&config.host, config.port)
                .map(|socket| Capability::Udp(Arc::new(socket))),
            (Protocol::Tcp, SocketMode::Listen) => {
                let key = CapabilityKey::new(
                    CapabilityKind::Socket,
                    format!("tcp/{}:{}", config.host, config.port),
                );
                self.shared(key, || {
                    TcpListenerHandle::bind(&config.host, config.port)
                        .map(|listener| Capability::TcpListener(Arc::new(listener)))
                })
            }
            (Protocol::Udp, SocketMode::Listen) => {
                let key = CapabilityKey::new(
                    CapabilityKind::Socket,
                    format!("udp/{}:{}", config.host, config.port),
                );
                self.shared(key, || {
                    UdpConnection::listen(&config.host, config.port)
                        .map(|socket| Capability::Udp(Arc::new(socket)))
                })
            }
        }
    }
}

fn expect_queue(capability: Capability) -> Result<Arc<BoundedBlockingQueue<Value>>> {
    match capability {
        Capability::Queue(queue) | Capability::Pipe(queue) => Ok(queue),
        other => Err(mismatch(CapabilityKind::Queue, &other)),
    }
}

fn mismatch(expected: CapabilityKind, found: &Capability) -> Error {
    Error::illegal_state(format!(
        "registry entry for {} holds a {}",
        expected,
        found.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn same_name_same_queue() {
        let registry = CapabilityRegistry::default();
        let a = registry.resolve(CapabilityKind::Queue, &json!({"name": "jobs", "capacity": 2})).unwrap();
        let b = registry.resolve(CapabilityKind::Queue, &json!({"name": "jobs", "capacity": 2})).unwrap();
        assert!(a.same_resource(&b));
        assert_eq!(a.as_queue().unwrap().capacity(), 2);
    }

    #[test]
    fn queue_capacity_fixed_at_creation() {
        let registry = CapabilityRegistry::default();
        let first = registry.queue("jobs", Some(2)).unwrap();
        let second = registry.queue("jobs", Some(50)).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.capacity(), 2);
    }

    #[test]
    fn queue_and_pipe_namespaces_are_separate() {
        let registry = CapabilityRegistry::default();
        let queue = registry.queue("x", None).unwrap();
        let pipe = registry.pipe("x").unwrap();
        assert!(!Arc::ptr_eq(&queue, &pipe));
        assert_eq!(pipe.capacity(), 99);
        assert_eq!(queue.capacity(), 1024);
    }

    #[test]
    fn locks_share_one_table() {
        let registry = CapabilityRegistry::default();
        let one = registry.resolve_named("lock", &json!({"name": "job"})).unwrap();
        let two = registry.resolve_named("lock", &json!({"name": "job"})).unwrap();
        let holder = HolderId::new();
        one.as_lock().unwrap().lock(holder, &Deadline::immediate()).unwrap();
        assert_eq!(two.as_lock().unwrap().holder(), Some(holder));
        assert_eq!(registry.release_locks(holder), vec!["job".to_string()]);
    }

    #[test]
    fn caches_and_buses_by_name() {
        let registry = CapabilityRegistry::default();
        let a = registry.cache("sessions").unwrap();
        a.set_ms("k", Value::from(1), 0);
        let b = registry.resolve(CapabilityKind::Cache, &json!({"name": "sessions"})).unwrap();
        assert_eq!(b.as_cache().unwrap().get("k"), Some(Value::from(1)));
        assert!(registry.cache("other").unwrap().get("k").is_none());

        let bus = registry.event_bus("default").unwrap();
        let same = registry.resolve(CapabilityKind::EventBus, &json!({})).unwrap();
        assert!(Arc::ptr_eq(&bus, same.as_event_bus().unwrap()));
    }

    #[test]
    fn http_clients_by_full_config() {
        let registry = CapabilityRegistry::default();
        let a = registry.resolve(CapabilityKind::HttpClient, &json!({"timeout_ms": 1000})).unwrap();
        let b = registry.resolve(CapabilityKind::HttpClient, &json!({"timeout_ms": 1000})).unwrap();
        let c = registry.resolve(CapabilityKind::HttpClient, &json!({"timeout_ms": 2000})).unwrap();
        assert!(a.same_resource(&b));
        assert!(!a.same_resource(&c));
    }

    #[test]
    fn tcp_listen_shared_by_address() {
        let registry = CapabilityRegistry::default();
        let config = json!({"protocol": "tcp", "mode": "listen", "host": "127.0.0.1", "port": 0});
        let a = registry.resolve(CapabilityKind::Socket, &config).unwrap();
        let b = registry.resolve(CapabilityKind::Socket, &config).unwrap();
        assert!(a.same_resource(&b));
        assert!(a.as_tcp_listener().is_some());
    }

    #[test]
    fn tcp_dial_is_fresh() {
        let registry = CapabilityRegistry::default();
        let listener = registry
            .resolve(
                CapabilityKind::Socket,
                &json!({"protocol": "tcp", "mode": "listen", "host": "127.0.0.1", "port": 0}),
            )
            .unwrap();
        let port = listener.as_tcp_listener().unwrap().local_addr().port();
        let dial = json!({"protocol": "tcp", "mode": "dial", "host": "127.0.0.1", "port": port});
        let a = registry.resolve(CapabilityKind::Socket, &dial).unwrap();
        let b = registry.resolve(CapabilityKind::Socket, &dial).unwrap();
        assert!(!a.same_resource(&b));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let registry = CapabilityRegistry::default();
        let err = registry.resolve(CapabilityKind::Queue, &json!({"capacity": 1})).unwrap_err();
        assert!(matches!(err, Error::IllegalState { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn failed_construction_is_not_cached() {
        let registry = CapabilityRegistry::default();
        let config = json!({"driver": "mysql", "connection": "x"});
        assert!(registry.resolve(CapabilityKind::Database, &config).is_err());
        assert!(registry.is_empty());
    }

    #[test]
    fn background_sweep_when_configured() {
        let registry = CapabilityRegistry::new(RegistryConfig {
            cache_sweep_interval_ms: Some(10),
            ..Default::default()
        });
        let cache = registry.cache("short").unwrap();
        cache.set_ms("k", Value::from(1), 5);
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.sweep(), 0);
    }

    #[test]
    fn slow_construction_does_not_block_other_keys() {
        let registry = Arc::new(CapabilityRegistry::default());
        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let slow = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                registry
                    .shared(CapabilityKey::new(CapabilityKind::Pipe, "slow"), || {
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(Capability::Pipe(Arc::new(BoundedBlockingQueue::new(1))))
                    })
                    .unwrap()
            })
        };
        started_rx.recv().unwrap();

        // "slow" is still being built while another key resolves.
        let other = registry.pipe("other").unwrap();
        assert_eq!(other.capacity(), 99);
        assert_eq!(registry.len(), 1);

        release_tx.send(()).unwrap();
        let slow = slow.join().unwrap();
        assert!(slow.same_resource(&Capability::Pipe(registry.pipe("slow").unwrap())));
        assert_eq!(registry.len(), 2);
    }
}
