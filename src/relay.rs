//! In-process publish/subscribe relay.
//!
//! Clients [connect](Relay::connect) to the relay and broadcast messages to
//! named clusters. Services [register](Relay::register) a [`Handler`] with a
//! cluster and receive a copy of every message broadcast to it. Each service
//! owns a delivery thread that invokes its handler in broadcast order.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use ahash::HashMap;
use crossbeam::channel::{Receiver, Sender};
use dashmap::DashMap;

use crate::barrier::BoxError;

/// Indicates an error within the relay.
#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    /// The relay was shut down.
    #[error("Relay is closed")]
    RelayClosed,

    /// The connection was closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The handler failed to initialize.
    #[error("Handler initialization failed: {0}")]
    Init(#[source] BoxError),

    /// Failed to spawn the delivery thread of a service.
    #[error("Failed to spawn delivery thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Receives the messages broadcast to a service's cluster.
pub trait Handler: Send + 'static {
    /// Called once during registration, before any message is delivered.
    fn init(&mut self, _conn: Connection) -> Result<(), BoxError> {
        Ok(())
    }

    fn handle_broadcast(&mut self, message: Vec<u8>);
}

impl<F> Handler for F
where
    F: FnMut(Vec<u8>) + Send + 'static,
{
    fn handle_broadcast(&mut self, message: Vec<u8>) {
        self(message)
    }
}

type ClusterMembers = HashMap<u64, Sender<Vec<u8>>>;

struct RelayInner {
    clusters: DashMap<String, ClusterMembers, ahash::RandomState>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl RelayInner {
    fn ensure_open(&self) -> Result<(), RelayError> {
        if self.closed.load(Ordering::Acquire) {
            Err(RelayError::RelayClosed)
        } else {
            Ok(())
        }
    }

    fn remove_member(&self, cluster: &str, id: u64) {
        let now_empty = match self.clusters.get_mut(cluster) {
            Some(mut members) => {
                members.remove(&id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.clusters.remove_if(cluster, |_, members| members.is_empty());
        }
    }
}

/// A shared in-process relay.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Default for Relay {
    fn default() -> Self {
        Self::new()
    }
}

impl Relay {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RelayInner {
                clusters: DashMap::default(),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connects a new client.
    #[tracing::instrument(skip(self))]
    pub fn connect(&self) -> Result<Connection, RelayError> {
        self.inner.ensure_open()?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, "client connected");

        Ok(Connection {
            relay: self.inner.clone(),
            id,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Registers a service with `cluster`.
    ///
    /// The handler is initialized with the service's own connection before
    /// the service becomes visible to broadcasts.
    #[tracing::instrument(skip(self, handler))]
    pub fn register<H: Handler>(&self, cluster: &str, mut handler: H) -> Result<Service, RelayError> {
        let conn = self.connect()?;
        handler.init(conn.clone()).map_err(RelayError::Init)?;

        let (sender, receiver) = crossbeam::channel::unbounded();
        let delivery = std::thread::Builder::new()
            .name(format!("relay-delivery-{}", conn.id))
            .spawn(move || deliver(handler, receiver))?;

        self.inner
            .clusters
            .entry(cluster.to_string())
            .or_default()
            .insert(conn.id, sender);
        tracing::debug!(id = conn.id, cluster, "service registered");

        Ok(Service {
            cluster: cluster.to_string(),
            conn,
            delivery: Some(delivery),
        })
    }

    /// The number of services currently registered with `cluster`.
    pub fn members(&self, cluster: &str) -> usize {
        self.inner
            .clusters
            .get(cluster)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    /// Closes the relay. Pending deliveries are still handed to the services,
    /// but every further operation fails.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.clusters.clear();
        tracing::debug!("relay shut down");
    }
}

fn deliver<H: Handler>(mut handler: H, receiver: Receiver<Vec<u8>>) {
    for message in receiver {
        handler.handle_broadcast(message);
    }
    tracing::trace!("delivery finished");
}

/// A client connection to a [`Relay`].
#[derive(Clone)]
pub struct Connection {
    relay: Arc<RelayInner>,
    id: u64,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Delivers a copy of `message` to every service registered with
    /// `cluster`. Broadcasting to a cluster without services succeeds.
    pub fn broadcast(&self, cluster: &str, message: &[u8]) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }
        self.relay.ensure_open()?;

        if let Some(members) = self.relay.clusters.get(cluster) {
            for (id, sender) in members.iter() {
                if sender.send(message.to_vec()).is_err() {
                    tracing::trace!(from = self.id, to = id, "service stopped receiving");
                }
            }
        }
        Ok(())
    }

    /// Closes the connection and every clone of it.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::trace!(id = self.id, "connection closed");
        }
    }
}

/// A service registered with a [`Relay`].
///
/// Dropping the service unregisters it.
pub struct Service {
    cluster: String,
    conn: Connection,
    delivery: Option<JoinHandle<()>>,
}

impl Service {
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// The service's own connection, usable for broadcasting.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Removes the service from its cluster and waits until every message
    /// already queued for it has been handled.
    pub fn unregister(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(delivery) = self.delivery.take() else {
            return;
        };

        self.conn.relay.remove_member(&self.cluster, self.conn.id);
        self.conn.close();
        if delivery.join().is_err() {
            tracing::error!(id = self.conn.id, "service handler panicked");
        }
        tracing::debug!(id = self.conn.id, cluster = %self.cluster, "service unregistered");
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}
