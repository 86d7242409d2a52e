//! Fan-out of change notifications to streaming clients.
//!
//! Every client owns a bounded queue. Producers only ever `try_send`, so a
//! slow or vanished consumer cannot hold up the rest: when its queue is full
//! or closed it is dropped from the subscriber set and the others carry on.
//!
//! Queued items are complete Server-Sent Events frames:
//!
//! ```text
//! event: data_changed
//! data: {"event_type":"data_changed","timestamp":"2024-01-15T14:30:00Z"}
//! id: 7
//!
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::change::ChangeEvent;

const CONNECTED_MESSAGE: &str = "Successfully connected to lease updates stream";

/// Frame ids increase across every broadcaster in the process.
static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Payloads carried in the `data:` line of a frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Notification {
    ConnectionEstablished {
        client_id: Uuid,
        message: String,
        active_connections: usize,
    },
    DataChanged {
        event_type: String,
        timestamp: String,
    },
    Heartbeat {
        /// Seconds since the Unix epoch.
        timestamp: f64,
        active_connections: usize,
    },
}

impl Notification {
    pub fn data_changed(at: DateTime<Utc>) -> Self {
        Notification::DataChanged {
            event_type: "data_changed".to_string(),
            timestamp: at.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        }
    }

    pub fn heartbeat(at: DateTime<Utc>, active_connections: usize) -> Self {
        Notification::Heartbeat {
            timestamp: at.timestamp_micros() as f64 / 1_000_000.0,
            active_connections,
        }
    }

    /// The SSE `event:` name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::ConnectionEstablished { .. } => "connection_established",
            Notification::DataChanged { .. } => "data_changed",
            Notification::Heartbeat { .. } => "heartbeat",
        }
    }
}

/// One serialized frame, shared by every queue it is delivered to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: u64,
    pub event: &'static str,
    pub data: String,
}

impl StreamMessage {
    pub fn new(notification: &Notification) -> serde_json::Result<Self> {
        let data = serde_json::to_string(notification)?;
        Ok(Self {
            id: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed),
            event: notification.event_name(),
            data,
        })
    }

    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\nid: {}\n\n", self.event, self.data, self.id)
    }
}

struct Client {
    sender: mpsc::Sender<Arc<StreamMessage>>,
    active: Arc<AtomicBool>,
    connected_at: DateTime<Utc>,
}

struct Shared {
    clients: Mutex<HashMap<Uuid, Client>>,
    capacity: usize,
}

impl Shared {
    fn remove(&self, id: Uuid) -> bool {
        let removed = self.clients.lock().remove(&id);
        match removed {
            Some(client) => {
                client.active.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

/// Owns the connected clients. Cloning yields another handle to the same set.
#[derive(Clone)]
pub struct StreamBroadcaster {
    shared: Arc<Shared>,
}

impl StreamBroadcaster {
    /// Creates a broadcaster whose clients each buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                clients: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Registers a client. Its first queued frame is `connection_established`.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let connected_at = Utc::now();
        let (sender, receiver) = mpsc::channel(self.shared.capacity);
        let active = Arc::new(AtomicBool::new(true));

        let mut clients = self.shared.clients.lock();
        let notification = Notification::ConnectionEstablished {
            client_id: id,
            message: CONNECTED_MESSAGE.to_string(),
            active_connections: clients.len() + 1,
        };
        match StreamMessage::new(&notification) {
            Ok(message) => {
                // The queue is fresh and has room for at least one frame.
                let _ = sender.try_send(Arc::new(message));
            }
            Err(e) => error!("Failed to encode connection message: {}", e),
        }
        clients.insert(
            id,
            Client {
                sender,
                active: Arc::clone(&active),
                connected_at,
            },
        );
        let active_connections = clients.len();
        drop(clients);

        info!("Client {} connected ({} active)", id, active_connections);

        Subscription {
            id,
            connected_at,
            receiver,
            active,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Removes a client, discarding anything still queued for it.
    ///
    /// Returns false if the id was not subscribed.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        let removed = self.shared.remove(id);
        if removed {
            info!("Client {} disconnected", id);
        }
        removed
    }

    /// Sends one `data_changed` frame for the batch to every client.
    ///
    /// Returns the number of clients that received it. An empty batch sends
    /// nothing.
    pub fn broadcast(&self, events: &[ChangeEvent]) -> usize {
        let Some(at) = events.iter().map(|event| event.timestamp).max() else {
            return 0;
        };
        let delivered = self.publish(&Notification::data_changed(at));
        info!(
            "Broadcast {} lease changes to {} clients",
            events.len(),
            delivered
        );
        delivered
    }

    /// Sends a `heartbeat` frame to every client.
    pub fn heartbeat(&self) -> usize {
        let notification = Notification::heartbeat(Utc::now(), self.active_count());
        self.publish(&notification)
    }

    /// Sends heartbeats every `interval` until every broadcaster handle is dropped.
    pub fn spawn_heartbeat(&self, interval: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(shared) = shared.upgrade() else {
                    debug!("Broadcaster dropped, stopping heartbeat");
                    break;
                };
                let delivered = StreamBroadcaster { shared }.heartbeat();
                debug!("Heartbeat delivered to {} clients", delivered);
            }
        })
    }

    pub fn active_count(&self) -> usize {
        self.shared.clients.lock().len()
    }

    /// When each connected client subscribed.
    pub fn connections(&self) -> Vec<(Uuid, DateTime<Utc>)> {
        let clients = self.shared.clients.lock();
        let mut connections: Vec<_> = clients
            .iter()
            .map(|(id, client)| (*id, client.connected_at))
            .collect();
        connections.sort_by_key(|(_, connected_at)| *connected_at);
        connections
    }

    fn publish(&self, notification: &Notification) -> usize {
        let message = match StreamMessage::new(notification) {
            Ok(message) => Arc::new(message),
            Err(e) => {
                error!("Failed to encode {} message: {}", notification.event_name(), e);
                return 0;
            }
        };

        let mut clients = self.shared.clients.lock();
        let mut failed = Vec::new();
        let mut delivered = 0;

        for (id, client) in clients.iter() {
            match client.sender.try_send(Arc::clone(&message)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Client {} queue full, disconnecting", id);
                    failed.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Client {} queue closed, disconnecting", id);
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            if let Some(client) = clients.remove(&id) {
                client.active.store(false, Ordering::Release);
            }
        }

        delivered
    }
}

/// The consuming end of one client's queue.
///
/// Dropping it unsubscribes the client.
pub struct Subscription {
    id: Uuid,
    connected_at: DateTime<Utc>,
    receiver: mpsc::Receiver<Arc<StreamMessage>>,
    active: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Returns true until the client is unsubscribed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Waits for the next frame. `None` once the client is unsubscribed.
    pub async fn recv(&mut self) -> Option<Arc<StreamMessage>> {
        if !self.is_active() {
            return None;
        }
        let message = self.receiver.recv().await?;
        self.is_active().then_some(message)
    }

    /// Returns the next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Arc<StreamMessage>> {
        if !self.is_active() {
            return None;
        }
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade()
            && shared.remove(self.id)
        {
            debug!("Client {} dropped its subscription", self.id);
        }
    }
}
