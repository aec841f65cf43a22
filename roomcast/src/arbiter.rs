use std::{
    any::Any,
    collections::HashMap,
    panic::{self, AssertUnwindSafe},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;
use rand::{rngs::OsRng, rngs::StdRng, RngCore, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use roomcast_proto::{MsgSubscribeBatch, MsgSubscribeData, MSG_TYPE_DATA};

use crate::rooms::RoomManager;

const JOB_QUEUE_SIZE: usize = 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Delivery slot towards one subscriber's sending loop. A full slot fails
/// sends immediately; dropping the sender closes the slot.
pub(crate) type Mailbox = mpsc::Sender<MsgSubscribeBatch>;

pub(crate) fn mailbox() -> (Mailbox, mpsc::Receiver<MsgSubscribeBatch>) {
    mpsc::channel(1)
}

/// A blocking wait was aborted by the shutdown signal.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("interrupted by shutdown")]
pub(crate) struct Interrupted;

#[derive(Debug)]
struct SubscriberInfo {
    id: u32,
    cmds: Vec<String>,
}

pub(crate) enum Job {
    AllocSubscriber {
        mailbox: Mailbox,
        reply: oneshot::Sender<u32>,
    },
    ClearSubscriptions {
        sub_id: u32,
        reply: oneshot::Sender<()>,
    },
    SubscribeRoom {
        room_id: i64,
        sub_id: u32,
        cmds: Vec<String>,
    },
    Logout {
        sub_id: u32,
    },
    /// An upstream event body. `cmd_filtered` distinguishes ordinary room
    /// messages (delivered only to subscribers listing `cmd`) from live-state
    /// changes (delivered to every subscriber of the room).
    RoomData {
        room_id: i64,
        cmd: String,
        data: Bytes,
        cmd_filtered: bool,
    },
    /// A room connection state transition. An empty `targets` list means
    /// every subscriber of the room.
    RoomState {
        room_id: i64,
        msg_type: u8,
        info: Option<Bytes>,
        targets: Vec<u32>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    #[cfg(test)]
    Inspect {
        reply: oneshot::Sender<Snapshot>,
    },
}

/// Handle submitting jobs to the serialized executor that owns the
/// subscription registry, the mailbox table and the pending-batch cache.
#[derive(Debug, Clone)]
pub(crate) struct Arbiter {
    jobs: mpsc::Sender<Job>,
    shutdown: CancellationToken,
}

/// The executor half; runs all jobs on one task.
pub(crate) struct ArbiterDriver {
    jobs: mpsc::Receiver<Job>,
    shutdown: CancellationToken,
    state: State,
}

struct State {
    /// room_id → sub_id → descriptor
    subs: HashMap<i64, HashMap<u32, SubscriberInfo>>,
    /// sub_id → batches not yet delivered to the mailbox
    cache: HashMap<u32, Vec<MsgSubscribeBatch>>,
    /// sub_id → delivery slot
    mailbox: HashMap<u32, Mailbox>,
    next_id: u32,
}

impl Arbiter {
    pub(crate) fn channel(shutdown: CancellationToken) -> (Self, ArbiterDriver) {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_SIZE);
        let handle = Self {
            jobs: jobs_tx,
            shutdown: shutdown.clone(),
        };
        let driver = ArbiterDriver {
            jobs: jobs_rx,
            shutdown,
            state: State {
                subs: HashMap::new(),
                cache: HashMap::new(),
                mailbox: HashMap::new(),
                next_id: seed_subscriber_id(),
            },
        };
        (handle, driver)
    }

    /// Enqueue a job, applying backpressure when the queue is full.
    async fn post(&self, job: Job) {
        let _ = self.jobs.send(job).await;
    }

    /// Enqueue a job and wait for it to finish, aborting the wait if the
    /// shutdown signal fires first.
    async fn exec<T>(&self, job: Job, reply: oneshot::Receiver<T>) -> Result<T, Interrupted> {
        tokio::select! {
            () = self.shutdown.cancelled() => Err(Interrupted),
            sent = self.jobs.send(job) => {
                if sent.is_err() {
                    return Err(Interrupted);
                }
                tokio::select! {
                    () = self.shutdown.cancelled() => Err(Interrupted),
                    result = reply => result.map_err(|_| Interrupted),
                }
            }
        }
    }

    /// Allocate a subscriber id and record its mailbox.
    pub(crate) async fn alloc_subscriber(&self, mailbox: Mailbox) -> Result<u32, Interrupted> {
        let (reply, result) = oneshot::channel();
        self.exec(Job::AllocSubscriber { mailbox, reply }, result)
            .await
    }

    /// Remove the subscriber from every room, pruning rooms left empty.
    pub(crate) async fn clear_subscriptions(&self, sub_id: u32) -> Result<(), Interrupted> {
        let (reply, result) = oneshot::channel();
        self.exec(Job::ClearSubscriptions { sub_id, reply }, result)
            .await
    }

    /// Register (or overwrite) the subscriber's interest in a room and make
    /// sure an upstream client exists for it.
    pub(crate) async fn subscribe_room(&self, room_id: i64, sub_id: u32, cmds: Vec<String>) {
        self.post(Job::SubscribeRoom {
            room_id,
            sub_id,
            cmds,
        })
        .await;
    }

    /// Drop all state for the subscriber and close its mailbox.
    pub(crate) async fn logout(&self, sub_id: u32) {
        self.post(Job::Logout { sub_id }).await;
    }

    pub(crate) async fn room_data(&self, room_id: i64, cmd: String, data: Bytes, cmd_filtered: bool) {
        self.post(Job::RoomData {
            room_id,
            cmd,
            data,
            cmd_filtered,
        })
        .await;
    }

    pub(crate) async fn room_state(
        &self,
        room_id: i64,
        msg_type: u8,
        info: Option<Bytes>,
        targets: Vec<u32>,
    ) {
        self.post(Job::RoomState {
            room_id,
            msg_type,
            info,
            targets,
        })
        .await;
    }

    pub(crate) async fn flush(&self) -> Result<(), Interrupted> {
        let (reply, result) = oneshot::channel();
        self.exec(Job::Flush { reply }, result).await
    }

    /// Periodically drain the pending-batch cache into subscriber mailboxes.
    /// The ticker stops once a flush is interrupted by shutdown.
    pub(crate) fn start_flush_ticker(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            while this.flush().await.is_ok() {
                tokio::time::sleep(FLUSH_INTERVAL).await;
            }
        });
    }

    #[cfg(test)]
    pub(crate) async fn snapshot(&self) -> Result<Snapshot, Interrupted> {
        let (reply, result) = oneshot::channel();
        self.exec(Job::Inspect { reply }, result).await
    }
}

impl ArbiterDriver {
    /// Run jobs in submission order until shutdown, then drain and discard
    /// the queue, close every mailbox once and clear all state.
    pub(crate) async fn run(mut self, rooms: RoomManager) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => self.dispatch(job, &rooms),
                    None => break,
                },
            }
        }
        self.drain().await;
    }

    fn dispatch(&mut self, job: Job, rooms: &RoomManager) {
        let state = &mut self.state;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| state.run(job, rooms))) {
            error!(panic = panic_message(&payload), "arbiter job panicked");
        }
    }

    async fn drain(mut self) {
        // Closing the queue keeps producers from blocking; anything already
        // buffered is discarded.
        self.jobs.close();
        while self.jobs.recv().await.is_some() {}

        self.state.cache.clear();
        self.state.subs.clear();
        // Dropping the senders closes every mailbox exactly once.
        self.state.mailbox.clear();
    }
}

impl State {
    fn run(&mut self, job: Job, rooms: &RoomManager) {
        match job {
            Job::AllocSubscriber { mailbox, reply } => {
                self.next_id = self.next_id.wrapping_add(1);
                self.mailbox.insert(self.next_id, mailbox);
                let _ = reply.send(self.next_id);
            }
            Job::ClearSubscriptions { sub_id, reply } => {
                self.clear_subscriptions(sub_id);
                let _ = reply.send(());
            }
            Job::SubscribeRoom {
                room_id,
                sub_id,
                cmds,
            } => {
                self.subs
                    .entry(room_id)
                    .or_default()
                    .insert(sub_id, SubscriberInfo { id: sub_id, cmds });

                let rooms = rooms.clone();
                tokio::spawn(async move {
                    rooms.ensure(room_id, sub_id).await;
                });
            }
            Job::Logout { sub_id } => self.logout(sub_id),
            Job::RoomData {
                room_id,
                cmd,
                data,
                cmd_filtered,
            } => {
                let batch = MsgSubscribeBatch {
                    msgs: vec![MsgSubscribeData {
                        room_id,
                        msg_type: MSG_TYPE_DATA,
                        cmd,
                        data,
                    }],
                };
                let Some(room_subs) = self.subs.get(&room_id) else {
                    return;
                };
                for info in room_subs.values() {
                    if cmd_filtered && !info.cmds.contains(&batch.msgs[0].cmd) {
                        continue;
                    }
                    self.cache.entry(info.id).or_default().push(batch.clone());
                }
            }
            Job::RoomState {
                room_id,
                msg_type,
                info,
                mut targets,
            } => {
                let batch = MsgSubscribeBatch {
                    msgs: vec![MsgSubscribeData {
                        room_id,
                        msg_type,
                        cmd: String::new(),
                        data: info.unwrap_or_default(),
                    }],
                };
                if targets.is_empty() {
                    if let Some(room_subs) = self.subs.get(&room_id) {
                        targets.extend(room_subs.values().map(|info| info.id));
                    }
                }
                for sub_id in targets {
                    self.cache.entry(sub_id).or_default().push(batch.clone());
                }
            }
            Job::Flush { reply } => {
                self.flush();
                let _ = reply.send(());
            }
            #[cfg(test)]
            Job::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn clear_subscriptions(&mut self, sub_id: u32) {
        self.subs.retain(|_room_id, room_subs| {
            room_subs.remove(&sub_id);
            !room_subs.is_empty()
        });
    }

    fn logout(&mut self, sub_id: u32) {
        self.clear_subscriptions(sub_id);

        let mut batch = MsgSubscribeBatch::default();
        if let Some(cached) = self.cache.remove(&sub_id) {
            for item in &cached {
                batch.combine_with(item);
            }
        }

        if let Some(mailbox) = self.mailbox.remove(&sub_id) {
            if !batch.msgs.is_empty() {
                // Best effort: a slow consumer loses its final batch.
                let _ = mailbox.try_send(batch);
            }
        }
    }

    fn flush(&mut self) {
        let mut new_cache = HashMap::new();
        for (sub_id, cached) in self.cache.drain() {
            let mut batch = MsgSubscribeBatch::default();
            for item in &cached {
                batch.combine_with(item);
            }
            if batch.msgs.is_empty() {
                continue;
            }

            // Cached batches for subscribers without a mailbox are dropped.
            let Some(mailbox) = self.mailbox.get(&sub_id) else {
                continue;
            };
            if let Err(undelivered) = mailbox.try_send(batch) {
                new_cache.insert(sub_id, vec![undelivered.into_inner()]);
            }
        }
        self.cache = new_cache;
    }

    #[cfg(test)]
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            rooms: self
                .subs
                .iter()
                .map(|(&room_id, room_subs)| {
                    (
                        room_id,
                        room_subs
                            .values()
                            .map(|info| (info.id, info.cmds.clone()))
                            .collect(),
                    )
                })
                .collect(),
            cache: self
                .cache
                .iter()
                .map(|(&sub_id, batches)| {
                    (sub_id, batches.iter().map(|b| b.msgs.len()).collect())
                })
                .collect(),
            mailboxes: {
                let mut ids = self.mailbox.keys().copied().collect::<Vec<_>>();
                ids.sort_unstable();
                ids
            },
        }
    }
}

/// Seed for the monotonic subscriber-id counter.
fn seed_subscriber_id() -> u32 {
    let mut buf = [0u8; 4];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => u32::from_be_bytes(buf),
        Err(err) => {
            warn!(%err, "OS random source unavailable, seeding subscriber ids from the clock");
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            StdRng::seed_from_u64(now).next_u32()
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
#[derive(Debug)]
pub(crate) struct Snapshot {
    /// room_id → (sub_id, cmds)
    pub(crate) rooms: HashMap<i64, Vec<(u32, Vec<String>)>>,
    /// sub_id → msgs per cached batch
    pub(crate) cache: HashMap<u32, Vec<usize>>,
    pub(crate) mailboxes: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use claims::{assert_err, assert_ok, assert_some};
    use futures_util::future::{self, BoxFuture};
    use tokio_util::sync::CancellationToken;

    use roomcast_proto::{MSG_TYPE_DATA, MSG_TYPE_WS_CONNECT};

    use super::{mailbox, Arbiter, Interrupted};
    use crate::rooms::{Dial, RoomConn, RoomManager};
    use crate::upstream::UpstreamError;

    /// A dialer whose connections never complete, keeping rooms in the
    /// `Connecting` state so no synthetic events reach the cache.
    struct PendingDial;

    impl Dial for PendingDial {
        fn dial(&self, _room_id: i64) -> BoxFuture<'static, Result<RoomConn, UpstreamError>> {
            Box::pin(future::pending())
        }
    }

    async fn spawn_arbiter() -> (Arbiter, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (arbiter, driver) = Arbiter::channel(shutdown.clone());
        let rooms = RoomManager::new(arbiter.clone(), Arc::new(PendingDial), shutdown.clone());
        tokio::spawn(driver.run(rooms));
        (arbiter, shutdown)
    }

    fn cmds(names: &[&str]) -> Vec<String> {
        names.iter().map(|&name| name.to_owned()).collect()
    }

    #[tokio::test]
    async fn allocates_strictly_increasing_ids() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (first_tx, _first_rx) = mailbox();
        let (second_tx, _second_rx) = mailbox();
        let first = assert_ok!(arbiter.alloc_subscriber(first_tx).await);
        let second = assert_ok!(arbiter.alloc_subscriber(second_tx).await);
        assert_eq!(first.wrapping_add(1), second);
    }

    #[tokio::test]
    async fn subscribe_replaces_wholesale() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (tx, _rx) = mailbox();
        let sub_id = assert_ok!(arbiter.alloc_subscriber(tx).await);

        arbiter.subscribe_room(1, sub_id, cmds(&["A"])).await;
        arbiter.subscribe_room(2, sub_id, cmds(&["A"])).await;

        // Resubscribe to rooms {2, 3} only.
        assert_ok!(arbiter.clear_subscriptions(sub_id).await);
        arbiter.subscribe_room(2, sub_id, cmds(&["B"])).await;
        arbiter.subscribe_room(3, sub_id, cmds(&["B"])).await;

        let snapshot = assert_ok!(arbiter.snapshot().await);
        let mut rooms = snapshot.rooms.keys().copied().collect::<Vec<_>>();
        rooms.sort_unstable();
        assert_eq!(vec![2, 3], rooms, "room 1 must be pruned once empty");
        assert_eq!(vec![(sub_id, cmds(&["B"]))], snapshot.rooms[&2]);
    }

    #[tokio::test]
    async fn repeated_subscribe_is_idempotent() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (tx, _rx) = mailbox();
        let sub_id = assert_ok!(arbiter.alloc_subscriber(tx).await);
        arbiter.subscribe_room(5, sub_id, cmds(&["A", "B"])).await;
        arbiter.subscribe_room(5, sub_id, cmds(&["A", "B"])).await;

        let snapshot = assert_ok!(arbiter.snapshot().await);
        assert_eq!(1, snapshot.rooms.len());
        assert_eq!(vec![(sub_id, cmds(&["A", "B"]))], snapshot.rooms[&5]);
    }

    #[tokio::test]
    async fn data_events_filter_on_cmd_and_room() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (a_tx, mut a_rx) = mailbox();
        let a = assert_ok!(arbiter.alloc_subscriber(a_tx).await);
        let (b_tx, mut b_rx) = mailbox();
        let b = assert_ok!(arbiter.alloc_subscriber(b_tx).await);

        arbiter.subscribe_room(7, a, cmds(&["WANTED"])).await;
        arbiter.subscribe_room(7, b, cmds(&["OTHER"])).await;

        arbiter
            .room_data(7, "WANTED".to_owned(), Bytes::from_static(b"x"), true)
            .await;
        arbiter
            .room_data(8, "WANTED".to_owned(), Bytes::from_static(b"y"), true)
            .await;
        assert_ok!(arbiter.flush().await);

        let batch = assert_some!(a_rx.recv().await);
        assert_eq!(1, batch.msgs.len());
        assert_eq!(7, batch.msgs[0].room_id);
        assert_eq!("WANTED", batch.msgs[0].cmd);

        assert!(b_rx.try_recv().is_err(), "subscriber with other cmds gets nothing");
    }

    #[tokio::test]
    async fn state_events_ignore_cmd_filters() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (tx, mut rx) = mailbox();
        let sub_id = assert_ok!(arbiter.alloc_subscriber(tx).await);
        arbiter.subscribe_room(7, sub_id, cmds(&["ONLY_THIS"])).await;

        // Live-state change: DATA type but delivered to every room subscriber.
        arbiter
            .room_data(7, "LIVE".to_owned(), Bytes::from_static(b"{}"), false)
            .await;
        // Untargeted connection notice.
        arbiter
            .room_state(7, MSG_TYPE_WS_CONNECT, None, Vec::new())
            .await;
        assert_ok!(arbiter.flush().await);

        let batch = assert_some!(rx.recv().await);
        assert_eq!(2, batch.msgs.len());
        assert_eq!(MSG_TYPE_DATA, batch.msgs[0].msg_type);
        assert_eq!("LIVE", batch.msgs[0].cmd);
        assert_eq!(MSG_TYPE_WS_CONNECT, batch.msgs[1].msg_type);
    }

    #[tokio::test]
    async fn flush_coalesces_in_arrival_order() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (tx, mut rx) = mailbox();
        let sub_id = assert_ok!(arbiter.alloc_subscriber(tx).await);
        arbiter.subscribe_room(7, sub_id, cmds(&["A"])).await;

        for payload in [&b"1"[..], b"2", b"3"] {
            arbiter
                .room_data(7, "A".to_owned(), Bytes::from_static(payload), true)
                .await;
        }
        assert_ok!(arbiter.flush().await);

        let batch = assert_some!(rx.recv().await);
        let payloads = batch
            .msgs
            .iter()
            .map(|msg| msg.data.as_ref())
            .collect::<Vec<_>>();
        assert_eq!(vec![&b"1"[..], b"2", b"3"], payloads);
    }

    #[tokio::test]
    async fn slow_subscriber_spills_one_coalesced_batch() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (tx, mut rx) = mailbox();
        let sub_id = assert_ok!(arbiter.alloc_subscriber(tx).await);
        arbiter.subscribe_room(7, sub_id, cmds(&["A"])).await;

        // First flush parks a batch in the single mailbox slot.
        arbiter
            .room_data(7, "A".to_owned(), Bytes::from_static(b"1"), true)
            .await;
        assert_ok!(arbiter.flush().await);

        // Subsequent flushes cannot deliver; the spill is replaced, not
        // appended, so the cache stays at one coalesced batch.
        for payload in [&b"2"[..], b"3"] {
            arbiter
                .room_data(7, "A".to_owned(), Bytes::from_static(payload), true)
                .await;
            assert_ok!(arbiter.flush().await);
        }
        let snapshot = assert_ok!(arbiter.snapshot().await);
        assert_eq!(vec![2], snapshot.cache[&sub_id]);

        // Draining the slot lets the next flush deliver the rest in order.
        let first = assert_some!(rx.recv().await);
        assert_eq!(1, first.msgs.len());
        assert_ok!(arbiter.flush().await);
        let rest = assert_some!(rx.recv().await);
        assert_eq!(
            vec![&b"2"[..], b"3"],
            rest.msgs.iter().map(|msg| msg.data.as_ref()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn logout_drains_cache_and_closes_mailbox() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        let (tx, mut rx) = mailbox();
        let sub_id = assert_ok!(arbiter.alloc_subscriber(tx).await);
        arbiter.subscribe_room(7, sub_id, cmds(&["A"])).await;
        arbiter
            .room_data(7, "A".to_owned(), Bytes::from_static(b"last"), true)
            .await;

        arbiter.logout(sub_id).await;

        let batch = assert_some!(rx.recv().await);
        assert_eq!(1, batch.msgs.len());
        assert_eq!(None, rx.recv().await, "mailbox must be closed");

        // Logout after logout is a no-op.
        arbiter.logout(sub_id).await;
        let snapshot = assert_ok!(arbiter.snapshot().await);
        assert!(snapshot.rooms.is_empty());
        assert!(snapshot.cache.is_empty());
        assert!(snapshot.mailboxes.is_empty());
    }

    #[tokio::test]
    async fn cache_without_mailbox_is_dropped_on_flush() {
        let (arbiter, _shutdown) = spawn_arbiter().await;

        arbiter
            .room_state(7, MSG_TYPE_WS_CONNECT, None, vec![999])
            .await;
        let snapshot = assert_ok!(arbiter.snapshot().await);
        assert_eq!(vec![1], snapshot.cache[&999]);

        assert_ok!(arbiter.flush().await);
        let snapshot = assert_ok!(arbiter.snapshot().await);
        assert!(snapshot.cache.is_empty());
    }

    #[tokio::test]
    async fn shutdown_closes_mailboxes_and_interrupts_exec() {
        let (arbiter, shutdown) = spawn_arbiter().await;

        let (tx, mut rx) = mailbox();
        let sub_id = assert_ok!(arbiter.alloc_subscriber(tx).await);
        arbiter.subscribe_room(7, sub_id, cmds(&["A"])).await;

        // Leave some jobs in flight; they must be discarded, not run.
        for _ in 0..16 {
            arbiter
                .room_data(7, "A".to_owned(), Bytes::from_static(b"x"), true)
                .await;
        }
        shutdown.cancel();

        assert_eq!(None, rx.recv().await, "mailbox closed exactly once");
        assert_err!(arbiter.flush().await);
        let (orphan_tx, _orphan_rx) = mailbox();
        assert_eq!(
            Err(Interrupted),
            arbiter.alloc_subscriber(orphan_tx).await
        );
    }
}
