//! The Hub: a single task that owns room membership and fans messages out.
//!
//! Every operation arrives as a [`HubCommand`] on one bounded mailbox and is
//! processed to completion before the next, so membership changes and
//! broadcasts share a single total order. Nothing outside this loop can see
//! the member map; read-only queries are request/reply commands.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::HubError;
use crate::ws::protocol::Envelope;
use crate::ws::session::Session;

/// Server-assigned member identity. Rendered as a decimal string on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub fn get(&self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of a session's outbound queue.
pub type QueueSender = mpsc::Sender<Arc<Envelope>>;

/// Commands processed by the Hub loop, one at a time.
pub enum HubCommand {
    /// Assign an id, add to the room, welcome the session, announce the join.
    Register {
        username: String,
        queue: QueueSender,
        reply: oneshot::Sender<SessionId>,
    },
    /// Remove a member if present. No-op otherwise.
    Unregister(SessionId),
    /// Fan an envelope out to every member.
    Broadcast(Envelope),
    /// Snapshot of current members, ordered by id.
    Members(oneshot::Sender<Vec<MemberInfo>>),
    /// Current member count.
    Count(oneshot::Sender<usize>),
}

/// Read-only view of a member, as returned by [`HubCommand::Members`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberInfo {
    pub id: String,
    pub username: String,
}

struct Member {
    username: String,
    queue: QueueSender,
}

/// Membership state. Owned exclusively by the task running [`Hub::run`].
pub struct Hub {
    members: BTreeMap<SessionId, Member>,
    next_id: u64,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Start the Hub loop on its own task and return a handle to its mailbox.
    pub fn spawn(mailbox_capacity: usize, queue_capacity: usize) -> HubHandle {
        let (tx, rx) = mpsc::channel(mailbox_capacity);
        tokio::spawn(Hub::new().run(rx));
        HubHandle { tx, queue_capacity }
    }

    /// Process mailbox commands until every handle has been dropped.
    pub async fn run(mut self, mut mailbox: mpsc::Receiver<HubCommand>) {
        tracing::debug!("Hub started");
        while let Some(cmd) = mailbox.recv().await {
            self.handle(cmd);
        }
        tracing::info!(members = self.members.len(), "Hub mailbox closed, stopping");
    }

    /// Apply a single command. Never awaits, so commands cannot interleave.
    pub fn handle(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Register {
                username,
                queue,
                reply,
            } => {
                let id = self.register(username, queue);
                if reply.send(id).is_err() {
                    // Caller went away and will never run this session.
                    tracing::debug!(member_id = %id, "Register reply dropped");
                    self.unregister(id);
                }
            }
            HubCommand::Unregister(id) => self.unregister(id),
            HubCommand::Broadcast(envelope) => self.broadcast(Arc::new(envelope)),
            HubCommand::Members(reply) => {
                let _ = reply.send(self.members());
            }
            HubCommand::Count(reply) => {
                let _ = reply.send(self.members.len());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> Vec<MemberInfo> {
        self.members
            .iter()
            .map(|(id, member)| MemberInfo {
                id: id.to_string(),
                username: member.username.clone(),
            })
            .collect()
    }

    fn register(&mut self, username: String, queue: QueueSender) -> SessionId {
        self.next_id += 1;
        let id = SessionId(self.next_id);
        let member_id = id.to_string();

        // Best effort: a full queue here just loses the welcome.
        if queue
            .try_send(Arc::new(Envelope::welcome(&member_id, &username)))
            .is_err()
        {
            tracing::debug!(member_id = %id, "Welcome dropped, queue unavailable");
        }

        let join = Envelope::join(&member_id, &username);
        tracing::info!(member_id = %id, username = %username, "Member joined");
        self.members.insert(id, Member { username, queue });
        self.broadcast(Arc::new(join));
        id
    }

    fn unregister(&mut self, id: SessionId) {
        let Some(member) = self.members.remove(&id) else {
            return;
        };
        // Dropping the member drops the only sender, closing its queue.
        let Member { username, queue } = member;
        drop(queue);
        tracing::info!(member_id = %id, username = %username, "Member left");
        self.broadcast(Arc::new(Envelope::leave(&id.to_string(), &username)));
    }

    /// Non-blocking fan-out. A member whose queue is full (or already closed)
    /// is evicted on the spot.
    fn broadcast(&mut self, envelope: Arc<Envelope>) {
        let mut evicted = Vec::new();
        for (id, member) in &self.members {
            match member.queue.try_send(Arc::clone(&envelope)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(member_id = %id, "Outbound queue full, evicting slow member");
                    evicted.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(member_id = %id, "Outbound queue closed, removing member");
                    evicted.push(*id);
                }
            }
        }
        for id in evicted {
            self.members.remove(&id);
        }
        tracing::debug!(
            kind = envelope.kind.as_str(),
            recipients = self.members.len(),
            "Broadcast"
        );
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle to the Hub mailbox. The only way to reach the Hub.
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
    queue_capacity: usize,
}

impl HubHandle {
    /// Wrap the sending half of a mailbox whose receiver is driven by
    /// [`Hub::run`] on a task the caller owns.
    pub fn new(tx: mpsc::Sender<HubCommand>, queue_capacity: usize) -> Self {
        Self { tx, queue_capacity }
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), HubError> {
        self.tx.send(cmd).await.map_err(|_| HubError::Closed)
    }

    /// Register a new participant and return its session with the assigned
    /// identity. The welcome envelope is already waiting in the queue.
    pub async fn register(&self, username: String) -> Result<Session, HubError> {
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Register {
            username: username.clone(),
            queue: queue_tx,
            reply: reply_tx,
        })
        .await?;
        let id = reply_rx.await.map_err(|_| HubError::Closed)?;
        Ok(Session::new(id, username, queue_rx))
    }

    pub async fn unregister(&self, id: SessionId) -> Result<(), HubError> {
        self.send(HubCommand::Unregister(id)).await
    }

    /// Waits for mailbox space, throttling fast senders.
    pub async fn broadcast(&self, envelope: Envelope) -> Result<(), HubError> {
        self.send(HubCommand::Broadcast(envelope)).await
    }

    pub async fn members(&self) -> Result<Vec<MemberInfo>, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Members(reply_tx)).await?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn member_count(&self) -> Result<usize, HubError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(HubCommand::Count(reply_tx)).await?;
        reply_rx.await.map_err(|_| HubError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::protocol::EnvelopeKind;
    use proptest::prelude::*;

    /// Register directly against a Hub, keeping the queue receiver.
    fn register(
        hub: &mut Hub,
        name: &str,
        capacity: usize,
    ) -> (SessionId, mpsc::Receiver<Arc<Envelope>>) {
        let (queue_tx, queue_rx) = mpsc::channel(capacity);
        let (reply_tx, mut reply_rx) = oneshot::channel();
        hub.handle(HubCommand::Register {
            username: name.to_string(),
            queue: queue_tx,
            reply: reply_tx,
        });
        (reply_rx.try_recv().unwrap(), queue_rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<Envelope>>) -> Vec<Arc<Envelope>> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[test]
    fn test_register_assigns_sequential_ids() {
        let mut hub = Hub::new();
        let (a, _rx_a) = register(&mut hub, "Alice", 8);
        let (b, _rx_b) = register(&mut hub, "Bob", 8);
        assert_eq!(a.to_string(), "1");
        assert_eq!(b.to_string(), "2");
        assert_eq!(hub.len(), 2);
    }

    #[test]
    fn test_register_sends_welcome_then_join() {
        let mut hub = Hub::new();
        let (_, mut rx_a) = register(&mut hub, "Alice", 8);
        let got = drain(&mut rx_a);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].kind, EnvelopeKind::Welcome);
        assert_eq!(got[0].member_id.as_deref(), Some("1"));
        assert_eq!(got[0].username, "Alice");
        assert_eq!(got[1].kind, EnvelopeKind::Join);

        let (_, mut rx_b) = register(&mut hub, "Bob", 8);
        let a_view = drain(&mut rx_a);
        assert_eq!(a_view.len(), 1);
        assert_eq!(a_view[0].kind, EnvelopeKind::Join);
        assert_eq!(a_view[0].member_id.as_deref(), Some("2"));
        assert_eq!(a_view[0].username, "Bob");
        assert_eq!(drain(&mut rx_b).len(), 2);
    }

    #[test]
    fn test_welcome_dropped_when_queue_full() {
        let mut hub = Hub::new();
        let (queue_tx, mut queue_rx) = mpsc::channel(1);
        queue_tx
            .try_send(Arc::new(Envelope::error(None, "System", "filler")))
            .unwrap();
        let (reply_tx, mut reply_rx) = oneshot::channel();
        hub.handle(HubCommand::Register {
            username: "Alice".into(),
            queue: queue_tx,
            reply: reply_tx,
        });
        assert!(reply_rx.try_recv().is_ok());
        // The join broadcast also hit a full queue, so the member is evicted.
        assert!(hub.is_empty());
        assert_eq!(queue_rx.try_recv().unwrap().kind, EnvelopeKind::Error);
    }

    #[test]
    fn test_register_without_caller_is_removed() {
        let mut hub = Hub::new();
        let (_, mut rx_a) = register(&mut hub, "Alice", 8);
        drain(&mut rx_a);

        let (queue_tx, _queue_rx) = mpsc::channel(8);
        let (reply_tx, reply_rx) = oneshot::channel();
        drop(reply_rx);
        hub.handle(HubCommand::Register {
            username: "Ghost".into(),
            queue: queue_tx,
            reply: reply_tx,
        });

        assert_eq!(hub.members().len(), 1);
        assert_eq!(hub.members()[0].username, "Alice");
        let kinds: Vec<_> = drain(&mut rx_a).iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EnvelopeKind::Join, EnvelopeKind::Leave]);
    }

    #[test]
    fn test_unregister_broadcasts_leave_and_closes_queue() {
        let mut hub = Hub::new();
        let (a, mut rx_a) = register(&mut hub, "Alice", 8);
        let (_, mut rx_b) = register(&mut hub, "Bob", 8);
        drain(&mut rx_a);
        drain(&mut rx_b);

        hub.handle(HubCommand::Unregister(a));
        assert_eq!(hub.len(), 1);
        let b_view = drain(&mut rx_b);
        assert_eq!(b_view.len(), 1);
        assert_eq!(b_view[0].kind, EnvelopeKind::Leave);
        assert_eq!(b_view[0].member_id.as_deref(), Some("1"));
        assert_eq!(b_view[0].username, "Alice");
        assert!(matches!(
            rx_a.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_unregister_unknown_is_noop() {
        let mut hub = Hub::new();
        let (a, _rx_a) = register(&mut hub, "Alice", 8);
        let (_, mut rx_b) = register(&mut hub, "Bob", 8);
        drain(&mut rx_b);

        hub.handle(HubCommand::Unregister(a));
        drain(&mut rx_b);
        hub.handle(HubCommand::Unregister(a));
        hub.handle(HubCommand::Unregister(SessionId(42)));
        assert_eq!(hub.len(), 1);
        assert!(drain(&mut rx_b).is_empty());
    }

    #[test]
    fn test_broadcast_evicts_full_queue_only() {
        let mut hub = Hub::new();
        // Capacity 2: welcome + own join fills Alice's queue.
        let (_, mut rx_slow) = register(&mut hub, "Alice", 2);
        let (_, mut rx_fast) = register(&mut hub, "Bob", 16);
        // Bob's join overflowed Alice, who is gone already.
        assert_eq!(hub.members().len(), 1);
        assert_eq!(hub.members()[0].username, "Bob");
        drain(&mut rx_fast);

        let chat = Envelope::chat("2", "Bob", Some("hi".into()));
        hub.handle(HubCommand::Broadcast(chat));
        let fast_view = drain(&mut rx_fast);
        assert_eq!(fast_view.len(), 1);
        assert_eq!(fast_view[0].content.as_deref(), Some("hi"));

        // Alice keeps what was buffered, then sees the queue closed.
        assert_eq!(drain(&mut rx_slow).len(), 2);
        assert!(matches!(
            rx_slow.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_broadcast_removes_closed_queue() {
        let mut hub = Hub::new();
        let (_, rx_a) = register(&mut hub, "Alice", 8);
        let (_, _rx_b) = register(&mut hub, "Bob", 8);
        drop(rx_a);
        hub.handle(HubCommand::Broadcast(Envelope::chat("2", "Bob", None)));
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_broadcast_order_preserved() {
        let mut hub = Hub::new();
        let (_, mut rx) = register(&mut hub, "Alice", 16);
        drain(&mut rx);
        for n in 0..5 {
            hub.handle(HubCommand::Broadcast(Envelope::chat(
                "1",
                "Alice",
                Some(n.to_string()),
            )));
        }
        let contents: Vec<_> = drain(&mut rx)
            .iter()
            .map(|e| e.content.clone().unwrap())
            .collect();
        assert_eq!(contents, vec!["0", "1", "2", "3", "4"]);
    }

    #[tokio::test]
    async fn test_handle_register_and_query() {
        let hub = Hub::spawn(8, 8);
        let mut alice = hub.register("Alice".into()).await.unwrap();
        let bob = hub.register("Bob".into()).await.unwrap();
        assert_eq!(alice.id().to_string(), "1");
        assert_eq!(bob.id().to_string(), "2");

        let members = hub.members().await.unwrap();
        assert_eq!(
            members,
            vec![
                MemberInfo {
                    id: "1".into(),
                    username: "Alice".into(),
                },
                MemberInfo {
                    id: "2".into(),
                    username: "Bob".into(),
                },
            ]
        );

        hub.unregister(bob.id()).await.unwrap();
        hub.unregister(bob.id()).await.unwrap();
        assert_eq!(hub.member_count().await.unwrap(), 1);

        let kinds: Vec<_> = [
            alice.recv().await.unwrap(),
            alice.recv().await.unwrap(),
            alice.recv().await.unwrap(),
            alice.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.kind)
        .collect();
        assert_eq!(
            kinds,
            vec![
                EnvelopeKind::Welcome,
                EnvelopeKind::Join,
                EnvelopeKind::Join,
                EnvelopeKind::Leave
            ]
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Unregister(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Register), (1u64..40).prop_map(Op::Unregister)]
    }

    proptest! {
        #[test]
        fn prop_membership_matches_model(ops in proptest::collection::vec(op(), 0..40)) {
            let mut hub = Hub::new();
            let mut model = std::collections::BTreeSet::new();
            let mut receivers = Vec::new();
            for op in ops {
                match op {
                    Op::Register => {
                        let (id, rx) = register(&mut hub, "p", 256);
                        prop_assert!(model.insert(id.get()));
                        receivers.push(rx);
                    }
                    Op::Unregister(n) => {
                        hub.handle(HubCommand::Unregister(SessionId(n)));
                        let _ = model.remove(&n);
                    }
                }
                prop_assert_eq!(hub.len(), model.len());
            }
        }
    }
}
