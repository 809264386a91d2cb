//! Notification hub: fans task lifecycle events out to connected clients.
//!
//! A single coordinator task owns the register / unregister / broadcast
//! queues and applies them in arrival order, so each sink sees events in
//! FIFO order and delivery is at-most-once. The queued broadcast path is
//! lossy under pressure; `broadcast_to_account` bypasses the queue for
//! pushes that belong to a specific moment, like the reminder sync sent
//! right after a client connects.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::Notification;

const REGISTER_QUEUE: usize = 10;
const UNREGISTER_QUEUE: usize = 10;
const BROADCAST_QUEUE: usize = 100;

/// A connected client able to receive notifications. One sink per
/// connection; a client connected twice registers two sinks.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: Notification) -> anyhow::Result<()>;
}

struct Registration {
    account: String,
    sink: Arc<dyn NotificationSink>,
}

struct Unregistration {
    account: String,
    sink: Arc<dyn NotificationSink>,
}

enum Outbound {
    /// One account's sinks.
    Account(String, Notification),
    /// Every sink in every account; for events with no resolvable owner.
    All(Notification),
}

pub struct NotificationHub {
    sinks: RwLock<HashMap<String, Vec<Arc<dyn NotificationSink>>>>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Unregistration>,
    broadcast_tx: mpsc::Sender<Outbound>,
    /// Owner-facing stream of accounts that just registered a sink.
    registrations: Mutex<Option<mpsc::Sender<String>>>,
    shutdown: CancellationToken,
    /// Cancelled by the coordinator when it exits.
    stopped: CancellationToken,
}

impl NotificationHub {
    pub fn new() -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(REGISTER_QUEUE);
        let (unregister_tx, unregister_rx) = mpsc::channel(UNREGISTER_QUEUE);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(BROADCAST_QUEUE);

        let hub = Arc::new(Self {
            sinks: RwLock::new(HashMap::new()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            registrations: Mutex::new(None),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
        });

        {
            let hub = Arc::clone(&hub);
            tokio::spawn(async move {
                hub.run_coordinator(register_rx, unregister_rx, broadcast_rx)
                    .await;
                hub.stopped.cancel();
            });
        }

        hub
    }

    /// Subscribes the hub owner to registration events. The owner uses
    /// this to push a reminder sync at each new connection.
    pub async fn registration_events(&self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(REGISTER_QUEUE);
        *self.registrations.lock().await = Some(tx);
        rx
    }

    pub async fn register(&self, account: &str, sink: Arc<dyn NotificationSink>) {
        let cmd = Registration {
            account: account.to_string(),
            sink,
        };
        if self.register_tx.send(cmd).await.is_err() {
            warn!(account, "hub coordinator gone, register dropped");
        }
    }

    pub async fn unregister(&self, account: &str, sink: &Arc<dyn NotificationSink>) {
        let cmd = Unregistration {
            account: account.to_string(),
            sink: Arc::clone(sink),
        };
        if self.unregister_tx.send(cmd).await.is_err() {
            warn!(account, "hub coordinator gone, unregister dropped");
        }
    }

    /// Queues a notification for the account's sinks. Lossy: when the
    /// queue is full the notification is dropped with a warning.
    pub fn broadcast(&self, account: &str, notification: Notification) {
        match self
            .broadcast_tx
            .try_send(Outbound::Account(account.to_string(), notification))
        {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(account, "Notification channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(account, "hub coordinator gone, notification dropped");
            }
        }
    }

    /// Queues a notification for every connected sink, regardless of
    /// account. Same lossy semantics as `broadcast`.
    pub fn broadcast_all(&self, notification: Notification) {
        match self.broadcast_tx.try_send(Outbound::All(notification)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Notification channel full, dropping message");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("hub coordinator gone, notification dropped");
            }
        }
    }

    /// Delivers directly to the account's sinks, bypassing the queue.
    pub async fn broadcast_to_account(&self, account: &str, notification: Notification) {
        let sinks: Vec<Arc<dyn NotificationSink>> = {
            let map = self.sinks.read().await;
            match map.get(account) {
                Some(sinks) => sinks.clone(),
                None => return,
            }
        };
        let mut dead = Vec::new();
        for sink in &sinks {
            if let Err(err) = sink.deliver(notification.clone()).await {
                warn!(account, error = %err, "notification delivery failed, evicting sink");
                dead.push(Arc::clone(sink));
            }
        }
        if !dead.is_empty() {
            self.evict(account, &dead).await;
        }
    }

    pub async fn connected_accounts(&self) -> usize {
        self.sinks.read().await.len()
    }

    pub async fn total_connections(&self) -> usize {
        self.sinks.read().await.values().map(Vec::len).sum()
    }

    /// Stops the coordinator. Queued notifications that were not yet
    /// processed are dropped.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.stopped.cancelled().await;
        info!("notification hub stopped");
    }

    async fn run_coordinator(
        &self,
        mut register_rx: mpsc::Receiver<Registration>,
        mut unregister_rx: mpsc::Receiver<Unregistration>,
        mut broadcast_rx: mpsc::Receiver<Outbound>,
    ) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(cmd) = register_rx.recv() => {
                    self.sinks
                        .write()
                        .await
                        .entry(cmd.account.clone())
                        .or_default()
                        .push(cmd.sink);
                    debug!(account = %cmd.account, "notification sink registered");
                    let registrations = self.registrations.lock().await;
                    if let Some(tx) = registrations.as_ref() {
                        if tx.try_send(cmd.account.clone()).is_err() {
                            warn!(account = %cmd.account, "registration event dropped");
                        }
                    }
                }
                Some(cmd) = unregister_rx.recv() => {
                    self.evict(&cmd.account, &[cmd.sink]).await;
                    debug!(account = %cmd.account, "notification sink unregistered");
                }
                Some(outbound) = broadcast_rx.recv() => match outbound {
                    Outbound::Account(account, notification) => {
                        self.broadcast_to_account(&account, notification).await;
                    }
                    Outbound::All(notification) => {
                        let accounts: Vec<String> =
                            self.sinks.read().await.keys().cloned().collect();
                        for account in accounts {
                            self.broadcast_to_account(&account, notification.clone()).await;
                        }
                    }
                },
            }
        }
    }

    async fn evict(&self, account: &str, targets: &[Arc<dyn NotificationSink>]) {
        let mut map = self.sinks.write().await;
        if let Some(sinks) = map.get_mut(account) {
            sinks.retain(|s| !targets.iter().any(|t| Arc::ptr_eq(s, t)));
            if sinks.is_empty() {
                map.remove(account);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestSink;
    use crate::types::{Notification, NotificationKind};
    use std::time::Duration;

    fn note(kind: NotificationKind) -> Notification {
        Notification::new("t1", kind)
    }

    async fn wait_until_connections(hub: &NotificationHub, expected: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while hub.total_connections().await != expected {
            assert!(
                tokio::time::Instant::now() < deadline,
                "hub never reached {expected} connections"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn queued_broadcasts_arrive_in_order() {
        let hub = NotificationHub::new();
        let sink = TestSink::new();
        hub.register("alice", sink.clone()).await;
        wait_until_connections(&hub, 1).await;

        hub.broadcast("alice", note(NotificationKind::Submitted));
        hub.broadcast("alice", note(NotificationKind::Started));
        hub.broadcast("alice", note(NotificationKind::Done));

        sink.wait_for(
            |n| n.kind == NotificationKind::Done,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert_eq!(
            sink.kinds().await,
            vec![
                NotificationKind::Submitted,
                NotificationKind::Started,
                NotificationKind::Done
            ]
        );
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn direct_broadcast_is_scoped_to_the_account() {
        let hub = NotificationHub::new();
        let alice = TestSink::new();
        let bob = TestSink::new();
        hub.register("alice", alice.clone()).await;
        hub.register("bob", bob.clone()).await;
        wait_until_connections(&hub, 2).await;

        hub.broadcast_to_account("alice", note(NotificationKind::Reminder))
            .await;

        assert_eq!(alice.received().await.len(), 1);
        assert!(bob.received().await.is_empty());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn broadcast_all_reaches_every_account() {
        let hub = NotificationHub::new();
        let alice = TestSink::new();
        let bob = TestSink::new();
        hub.register("alice", alice.clone()).await;
        hub.register("bob", bob.clone()).await;
        wait_until_connections(&hub, 2).await;

        hub.broadcast_all(note(NotificationKind::Reminder));

        for sink in [&alice, &bob] {
            sink.wait_for(
                |n| n.kind == NotificationKind::Reminder,
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        }
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let hub = NotificationHub::new();
        let sink = TestSink::new();
        hub.register("alice", sink.clone()).await;
        wait_until_connections(&hub, 1).await;

        let as_sink: Arc<dyn NotificationSink> = sink.clone();
        hub.unregister("alice", &as_sink).await;
        wait_until_connections(&hub, 0).await;
        assert_eq!(hub.connected_accounts().await, 0);

        hub.broadcast_to_account("alice", note(NotificationKind::Done))
            .await;
        assert!(sink.received().await.is_empty());
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn failing_sink_is_evicted() {
        struct BrokenSink;

        #[async_trait]
        impl NotificationSink for BrokenSink {
            async fn deliver(&self, _notification: Notification) -> anyhow::Result<()> {
                anyhow::bail!("connection reset")
            }
        }

        let hub = NotificationHub::new();
        hub.register("alice", Arc::new(BrokenSink)).await;
        wait_until_connections(&hub, 1).await;

        hub.broadcast_to_account("alice", note(NotificationKind::Done))
            .await;
        assert_eq!(hub.total_connections().await, 0);
        hub.shutdown().await;
    }

    #[tokio::test]
    async fn registration_events_carry_the_account() {
        let hub = NotificationHub::new();
        let mut events = hub.registration_events().await;
        hub.register("alice", TestSink::new()).await;

        let account = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(account, "alice");
        hub.shutdown().await;
    }
}
