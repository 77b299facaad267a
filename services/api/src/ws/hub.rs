//! Connection Registry
//!
//! The hub is the single authority on which clients are live. Registration
//! and unregistration are messages handled by one control loop, the only
//! place the client map is mutated. Senders look clients up concurrently
//! under a shared read lock.

use super::{error::HubError, protocol::OutboundMessage};
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};
use tokio::{
    sync::{RwLock, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process-unique identifier of one client connection.
pub type ClientId = Uuid;

const CONTROL_QUEUE: usize = 64;

/// The registry's view of a connection: where to enqueue its outbound
/// messages and how to stop its tasks.
///
/// The hub holds the only outbound sender, so dropping the handle on
/// unregistration is what closes the queue.
pub struct ClientHandle {
    pub client_id: ClientId,
    pub user_id: String,
    outbound: mpsc::Sender<OutboundMessage>,
    shutdown: CancellationToken,
}

impl ClientHandle {
    pub fn new(
        client_id: ClientId,
        user_id: String,
        outbound: mpsc::Sender<OutboundMessage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client_id,
            user_id,
            outbound,
            shutdown,
        }
    }
}

enum Command {
    Register {
        client: ClientHandle,
        ack: oneshot::Sender<()>,
    },
    Unregister {
        client_id: ClientId,
    },
}

/// Point-in-time counts exposed to the metrics observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    pub connections: usize,
    pub pending: i64,
}

struct Shared {
    clients: RwLock<HashMap<ClientId, ClientHandle>>,
    pending: AtomicI64,
}

/// Cheaply clonable handle to the registry.
#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
}

impl Hub {
    /// Creates the registry and spawns its control loop. The loop runs until
    /// every `Hub` clone has been dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let shared = Arc::new(Shared {
            clients: RwLock::new(HashMap::new()),
            pending: AtomicI64::new(0),
        });
        let (commands, rx) = mpsc::channel(CONTROL_QUEUE);
        let handle = tokio::spawn(control_loop(shared.clone(), rx));
        (Self { shared, commands }, handle)
    }

    /// Registers a client and waits until the control loop has accepted it.
    pub async fn register(&self, client: ClientHandle) -> Result<(), HubError> {
        let (ack, accepted) = oneshot::channel();
        self.commands
            .send(Command::Register { client, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        accepted.await.map_err(|_| HubError::Stopped)
    }

    /// Requests removal of a client. Unknown or already removed clients are
    /// ignored by the control loop.
    pub async fn unregister(&self, client_id: ClientId) -> Result<(), HubError> {
        self.commands
            .send(Command::Unregister { client_id })
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Enqueues a message for a client without waiting for queue space.
    pub async fn send(&self, client_id: ClientId, message: OutboundMessage) -> Result<(), HubError> {
        let clients = self.shared.clients.read().await;
        let client = clients
            .get(&client_id)
            .ok_or(HubError::NotFound(client_id))?;

        // Counted before the enqueue so a fast writer can never settle a
        // message that is not yet counted.
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        match client.outbound.try_send(message) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.settle(1);
                Err(match err {
                    mpsc::error::TrySendError::Full(_) => HubError::QueueFull(client_id),
                    mpsc::error::TrySendError::Closed(_) => HubError::Closed(client_id),
                })
            }
        }
    }

    /// Marks `count` previously enqueued messages as delivered or failed.
    pub(crate) fn settle(&self, count: usize) {
        if count == 0 {
            return;
        }
        let previous = self
            .shared
            .pending
            .fetch_sub(count as i64, Ordering::AcqRel);
        debug_assert!(previous >= count as i64, "pending count went negative");
    }

    pub fn pending(&self) -> i64 {
        self.shared.pending.load(Ordering::Acquire)
    }

    pub async fn contains(&self, client_id: ClientId) -> bool {
        self.shared.clients.read().await.contains_key(&client_id)
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            connections: self.shared.clients.read().await.len(),
            pending: self.pending(),
        }
    }
}

async fn control_loop(shared: Arc<Shared>, mut commands: mpsc::Receiver<Command>) {
    info!("hub control loop started");
    while let Some(command) = commands.recv().await {
        match command {
            Command::Register { client, ack } => {
                let client_id = client.client_id;
                let user_id = client.user_id.clone();
                let replaced = shared.clients.write().await.insert(client_id, client);
                if let Some(old) = replaced {
                    warn!(%client_id, "client id registered twice, replacing");
                    old.shutdown.cancel();
                }
                debug!(%client_id, %user_id, "client registered");
                let _ = ack.send(());
            }
            Command::Unregister { client_id } => {
                let removed = shared.clients.write().await.remove(&client_id);
                match removed {
                    Some(client) => {
                        client.shutdown.cancel();
                        drop(client);
                        debug!(%client_id, "client unregistered");
                    }
                    None => debug!(%client_id, "unregister for unknown client ignored"),
                }
            }
        }
    }
    info!("hub control loop stopped");
}
