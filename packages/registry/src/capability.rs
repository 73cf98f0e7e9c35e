use std::sync::Arc;

use capbridge_core::{BoundedBlockingQueue, ExpiringCache, NamedLock, TopicEventBus, Value};
use capbridge_db::Database;
use capbridge_net::{HttpClient, TcpConnection, TcpListenerHandle, UdpConnection};

use crate::kind::CapabilityKind;

/// A handle returned by the registry. Cloning shares the resource.
#[derive(Debug, Clone)]
pub enum Capability {
    Queue(Arc<BoundedBlockingQueue<Value>>),
    Pipe(Arc<BoundedBlockingQueue<Value>>),
    Lock(NamedLock),
    Cache(Arc<ExpiringCache<Value>>),
    EventBus(Arc<TopicEventBus>),
    Database(Arc<Database>),
    HttpClient(Arc<HttpClient>),
    TcpListener(Arc<TcpListenerHandle>),
    TcpConnection(Arc<TcpConnection>),
    Udp(Arc<UdpConnection>),
}

impl Capability {
    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::Queue(_) => CapabilityKind::Queue,
            Capability::Pipe(_) => CapabilityKind::Pipe,
            Capability::Lock(_) => CapabilityKind::Lock,
            Capability::Cache(_) => CapabilityKind::Cache,
            Capability::EventBus(_) => CapabilityKind::EventBus,
            Capability::Database(_) => CapabilityKind::Database,
            Capability::HttpClient(_) => CapabilityKind::HttpClient,
            Capability::TcpListener(_) | Capability::TcpConnection(_) | Capability::Udp(_) => {
                CapabilityKind::Socket
            }
        }
    }

    /// Queues and pipes share one implementation.
    pub fn as_queue(&self) -> Option<&Arc<BoundedBlockingQueue<Value>>> {
        match self {
            Capability::Queue(queue) | Capability::Pipe(queue) => Some(queue),
            _ => None,
        }
    }

    pub fn as_lock(&self) -> Option<&NamedLock> {
        match self {
            Capability::Lock(lock) => Some(lock),
            _ => None,
        }
    }

    pub fn as_cache(&self) -> Option<&Arc<ExpiringCache<Value>>> {
        match self {
            Capability::Cache(cache) => Some(cache),
            _ => None,
        }
    }

    pub fn as_event_bus(&self) -> Option<&Arc<TopicEventBus>> {
        match self {
            Capability::EventBus(bus) => Some(bus),
            _ => None,
        }
    }

    pub fn as_database(&self) -> Option<&Arc<Database>> {
        match self {
            Capability::Database(db) => Some(db),
            _ => None,
        }
    }

    pub fn as_http_client(&self) -> Option<&Arc<HttpClient>> {
        match self {
            Capability::HttpClient(client) => Some(client),
            _ => None,
        }
    }

    pub fn as_tcp_listener(&self) -> Option<&Arc<TcpListenerHandle>> {
        match self {
            Capability::TcpListener(listener) => Some(listener),
            _ => None,
        }
    }

    pub fn as_tcp_connection(&self) -> Option<&Arc<TcpConnection>> {
        match self {
            Capability::TcpConnection(conn) => Some(conn),
            _ => None,
        }
    }

    pub fn as_udp(&self) -> Option<&Arc<UdpConnection>> {
        match self {
            Capability::Udp(socket) => Some(socket),
            _ => None,
        }
    }

    /// Whether two handles point at the same underlying resource.
    pub fn same_resource(&self, other: &Capability) -> bool {
        match (self, other) {
            (Capability::Queue(a), Capability::Queue(b)) | (Capability::Pipe(a), Capability::Pipe(b)) => {
                Arc::ptr_eq(a, b)
            }
            (Capability::Lock(a), Capability::Lock(b)) => a.name() == b.name(),
            (Capability::Cache(a), Capability::Cache(b)) => Arc::ptr_eq(a, b),
            (Capability::EventBus(a), Capability::EventBus(b)) => Arc::ptr_eq(a, b),
            (Capability::Database(a), Capability::Database(b)) => Arc::ptr_eq(a, b),
            (Capability::HttpClient(a), Capability::HttpClient(b)) => Arc::ptr_eq(a, b),
            (Capability::TcpListener(a), Capability::TcpListener(b)) => Arc::ptr_eq(a, b),
            (Capability::TcpConnection(a), Capability::TcpConnection(b)) => Arc::ptr_eq(a, b),
            (Capability::Udp(a), Capability::Udp(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
