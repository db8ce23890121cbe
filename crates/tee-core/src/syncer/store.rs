//! Task store: coalesces path observations into debounced tasks.
//!
//! All scheduling state is owned by a single loop task. Producers talk to it
//! through a bounded channel, and expired tasks leave through an unbounded
//! one. Exactly one task (the earliest deadline) is armed on the loop's
//! timer at any time; every other pending task waits in the [`TaskHeap`].

use super::heap::{TaskHeap, TaskId};
use super::task::{AggregationWindow, Task};
use crate::path::{Path, PathKey};
use std::collections::HashMap;
use std::panic;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Capacity of the observation channel. Producers wait when it is full.
pub const OBSERVATION_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, Error)]
#[error("task store is closed")]
pub struct StoreClosed;

#[derive(Debug)]
struct Observation {
    path: Path,
    at: Instant,
}

/// Handle to a running scheduling loop.
#[derive(Debug)]
pub struct TaskStore {
    input: mpsc::Sender<Observation>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskStore {
    /// Start the scheduling loop. Expired tasks are delivered on the returned
    /// receiver, which closes once the loop has exited.
    pub fn spawn(window: AggregationWindow) -> (Self, mpsc::UnboundedReceiver<Task>) {
        Self::spawn_until(window, CancellationToken::new())
    }

    /// Like [`spawn`](Self::spawn), but the loop also stops as soon as
    /// `shutdown` is cancelled. [`close`](Self::close) cancels it too, so
    /// pass a child token when the parent must outlive the store.
    pub fn spawn_until(
        window: AggregationWindow,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (input, observations) = mpsc::channel(OBSERVATION_BUFFER);
        let (expired, expired_rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run(
            Scheduler::new(window),
            observations,
            expired,
            shutdown.clone(),
        ));

        let store = Self {
            input,
            shutdown,
            worker: Mutex::new(Some(worker)),
        };
        (store, expired_rx)
    }

    /// Record an observation of `path` at `at`. Waits while the loop is
    /// backed up.
    pub async fn add_or_refresh(&self, path: &Path, at: Instant) -> Result<(), StoreClosed> {
        if self.shutdown.is_cancelled() {
            return Err(StoreClosed);
        }
        self.input
            .send(Observation {
                path: path.clone(),
                at,
            })
            .await
            .map_err(|_| StoreClosed)
    }

    /// Stop accepting observations and wait for the loop to exit. Pending
    /// tasks are dropped without being emitted.
    ///
    /// A panic inside the loop (a broken scheduling invariant) is re-raised
    /// here.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };
        if let Err(err) = worker.await {
            if err.is_panic() {
                panic::resume_unwind(err.into_panic());
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

async fn run(
    mut scheduler: Scheduler,
    mut observations: mpsc::Receiver<Observation>,
    expired: mpsc::UnboundedSender<Task>,
    shutdown: CancellationToken,
) {
    loop {
        let deadline = scheduler.armed_deadline();
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            // Checked before new observations so a steady stream of writes
            // can not hold back a due task.
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                let task = scheduler.expire_armed();
                debug!(path = %task.path(), "task expired");
                if expired.send(task).is_err() {
                    trace!("expired task receiver dropped");
                }
            }
            observation = observations.recv() => match observation {
                Some(Observation { path, at }) => scheduler.add_or_refresh(path, at),
                None => break,
            },
        }
    }
    observations.close();
    debug!(pending = scheduler.pending(), "task store stopped");
}

/// Scheduling state of the loop: the path index, the heap of waiting tasks
/// and the single armed task.
#[derive(Debug)]
pub(crate) struct Scheduler {
    window: AggregationWindow,
    tasks: HashMap<PathKey, TaskId>,
    heap: TaskHeap,
    armed: Option<TaskId>,
}

impl Scheduler {
    pub fn new(window: AggregationWindow) -> Self {
        Self {
            window,
            tasks: HashMap::new(),
            heap: TaskHeap::new(),
            armed: None,
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    pub fn armed_deadline(&self) -> Option<Instant> {
        self.armed
            .map(|id| self.heap.get(id).expiration_deadline())
    }

    #[cfg(test)]
    pub fn armed(&self) -> Option<&Task> {
        self.armed.map(|id| self.heap.get(id))
    }

    pub fn add_or_refresh(&mut self, path: Path, at: Instant) {
        let key = path.key();
        match self.tasks.get(&key) {
            Some(&id) => {
                self.heap.get_mut(id).merge(at);
                if self.armed == Some(id) {
                    // Its deadline moved; let it compete with the heap again.
                    self.armed = None;
                    self.heap.push(id);
                } else {
                    self.heap.fix(id);
                }
                trace!(%path, "task refreshed");
            }
            None => {
                let id = self.heap.insert(Task::new(path, at, self.window));
                self.tasks.insert(key, id);
                self.heap.push(id);
                trace!(path = %self.heap.get(id).path(), "task added");
            }
        }
        self.rearm();
        self.check_invariants();
    }

    /// Expire the armed task and arm the next one.
    ///
    /// # Panics
    /// If no task is armed.
    pub fn expire_armed(&mut self) -> Task {
        let Some(id) = self.armed.take() else {
            panic!("timer fired with no armed task");
        };
        let mut task = self.heap.take(id);
        let indexed = self.tasks.remove(&task.path().key());
        assert_eq!(indexed, Some(id), "path index out of sync with armed task");
        task.expire();

        self.armed = self.heap.pop();
        self.check_invariants();
        task
    }

    /// Keep the earliest deadline armed.
    fn rearm(&mut self) {
        let Some(earliest) = self.heap.peek() else {
            return;
        };
        match self.armed {
            None => self.armed = self.heap.pop(),
            Some(armed) => {
                let armed_deadline = self.heap.get(armed).expiration_deadline();
                if self.heap.get(earliest).expiration_deadline() < armed_deadline {
                    self.armed = self.heap.pop();
                    self.heap.push(armed);
                }
            }
        }
    }

    fn check_invariants(&self) {
        let armed = usize::from(self.armed.is_some());
        assert_eq!(
            self.tasks.len(),
            self.heap.len() + armed,
            "task index holds {} tasks but {} are scheduled",
            self.tasks.len(),
            self.heap.len() + armed,
        );
        assert_eq!(self.heap.stored(), self.tasks.len(), "orphaned tasks in arena");
        match self.armed {
            Some(id) => assert!(!self.heap.contains(id), "armed task is still heap-resident"),
            None => assert!(self.heap.is_empty(), "tasks waiting with nothing armed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashSet;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn window(min: Duration, max: Duration) -> AggregationWindow {
        AggregationWindow { min, max }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_scheduler_keeps_earliest_armed() {
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(window(ms(1000), ms(10_000)));

        scheduler.add_or_refresh(Path::new(["late"]), t0 + ms(500));
        assert_eq!(scheduler.armed().unwrap().path(), &Path::new(["late"]));

        scheduler.add_or_refresh(Path::new(["early"]), t0);
        assert_eq!(scheduler.armed().unwrap().path(), &Path::new(["early"]));
        assert_eq!(scheduler.armed_deadline(), Some(t0 + ms(1000)));

        // Refreshing the armed task pushes it behind "late".
        scheduler.add_or_refresh(Path::new(["early"]), t0 + ms(900));
        assert_eq!(scheduler.armed().unwrap().path(), &Path::new(["late"]));
        assert_eq!(scheduler.pending(), 2);
    }

    #[test]
    fn test_scheduler_random_observations_expire_in_deadline_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let t0 = Instant::now();
        let mut scheduler = Scheduler::new(window(ms(1000), ms(5000)));
        let mut touched = HashSet::new();

        for _ in 0..2000 {
            let path = Path::new([format!("f{}", rng.random_range(0..300))]);
            touched.insert(path.clone());
            scheduler.add_or_refresh(path, t0 + ms(rng.random_range(0..20_000)));
        }
        assert_eq!(scheduler.pending(), touched.len());

        let mut previous = None;
        let mut expired = HashSet::new();
        while scheduler.armed().is_some() {
            let task = scheduler.expire_armed();
            let deadline = task.expiration_deadline();
            if let Some(previous) = previous {
                assert!(previous <= deadline, "expired out of deadline order");
            }
            previous = Some(deadline);
            assert!(task.is_expired());
            assert!(expired.insert(task.path().clone()), "path expired twice");
        }
        assert_eq!(expired, touched);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_path_debounce() {
        let (store, mut expired) = TaskStore::spawn(window(ms(1000), Duration::from_secs(30)));
        let path = Path::new(["dir", "file.txt"]);
        let t0 = Instant::now();

        for _ in 0..3 {
            store.add_or_refresh(&path, Instant::now()).await.unwrap();
            sleep(ms(100)).await;
        }

        let task = expired.recv().await.unwrap();
        assert_eq!(task.path(), &path);
        assert_eq!(task.first_event(), t0);
        assert_eq!(task.last_event(), t0 + ms(200));
        let fired = Instant::now();
        assert!(fired >= t0 + ms(1200) && fired < t0 + ms(1250), "fired at {:?}", fired - t0);

        assert!(timeout(Duration::from_secs(60), expired.recv()).await.is_err());

        store.close().await;
        assert!(expired.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_writes_bounded_by_max() {
        let (store, mut expired) = TaskStore::spawn(window(ms(1000), ms(5000)));
        let store = std::sync::Arc::new(store);
        let path = Path::new(["busy.log"]);
        let t0 = Instant::now();

        let producer = {
            let store = std::sync::Arc::clone(&store);
            let path = path.clone();
            tokio::spawn(async move {
                for _ in 0..80 {
                    if store.add_or_refresh(&path, Instant::now()).await.is_err() {
                        break;
                    }
                    sleep(ms(500)).await;
                }
            })
        };

        let first = expired.recv().await.unwrap();
        let elapsed = Instant::now() - t0;
        assert!(elapsed >= ms(5000) && elapsed < ms(5500), "first expiry after {elapsed:?}");
        assert_eq!(first.first_event(), t0);

        let second = expired.recv().await.unwrap();
        assert_eq!(second.path(), &path);
        assert!(second.first_event() > first.last_event());
        assert!(second.expiration_deadline() - second.first_event() <= ms(5000));

        store.close().await;
        producer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_timestamps_merge() {
        let (store, mut expired) = TaskStore::spawn(window(ms(1000), ms(10_000)));
        let path = Path::new(["a"]);
        let t0 = Instant::now();

        for offset in [300, 100, 200] {
            store.add_or_refresh(&path, t0 + ms(offset)).await.unwrap();
        }

        let task = expired.recv().await.unwrap();
        assert_eq!(task.first_event(), t0 + ms(100));
        assert_eq!(task.last_event(), t0 + ms(300));
        assert!(Instant::now() >= t0 + ms(1300));
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_task_preempts_armed_one() {
        let (store, mut expired) = TaskStore::spawn(window(ms(1000), ms(10_000)));
        let t0 = Instant::now();

        store.add_or_refresh(&Path::new(["a"]), t0).await.unwrap();
        sleep(ms(500)).await;
        // "a" is armed; refreshing it moves its deadline to 1.5s.
        store.add_or_refresh(&Path::new(["a"]), Instant::now()).await.unwrap();
        // Back-dated observation for "b" lands ahead of it.
        store.add_or_refresh(&Path::new(["b"]), t0).await.unwrap();

        let first = expired.recv().await.unwrap();
        assert_eq!(first.path(), &Path::new(["b"]));
        assert!(Instant::now() < t0 + ms(1100));

        let second = expired.recv().await.unwrap();
        assert_eq!(second.path(), &Path::new(["a"]));
        assert!(Instant::now() >= t0 + ms(1500));
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_past_observations_each_expire_once() {
        let (store, mut expired) = TaskStore::spawn(window(ms(1000), ms(10_000)));
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();
        let mut touched = HashSet::new();

        for _ in 0..100 {
            let path = Path::new([format!("p{}", rng.random_range(0..40))]);
            let at = now - ms(1000) + ms(rng.random_range(1..1000));
            touched.insert(path.clone());
            store.add_or_refresh(&path, at).await.unwrap();
        }

        let mut previous = None;
        let mut seen = HashSet::new();
        for _ in 0..touched.len() {
            let task = expired.recv().await.unwrap();
            let deadline = task.expiration_deadline();
            if let Some(previous) = previous {
                assert!(previous <= deadline);
            }
            previous = Some(deadline);
            assert!(seen.insert(task.path().clone()), "{} expired twice", task.path());
        }
        assert_eq!(seen, touched);
        assert!(timeout(Duration::from_secs(5), expired.recv()).await.is_err());
        store.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_drops_pending_tasks() {
        let (store, mut expired) = TaskStore::spawn(window(Duration::from_secs(3600), Duration::from_secs(7200)));
        for n in 0..10 {
            store
                .add_or_refresh(&Path::new([format!("f{n}")]), Instant::now())
                .await
                .unwrap();
        }

        store.close().await;
        assert!(store.is_closed());
        assert!(expired.recv().await.is_none());
        assert!(store.add_or_refresh(&Path::new(["late"]), Instant::now()).await.is_err());

        // Closing twice is harmless.
        store.close().await;
    }

    #[tokio::test]
    async fn test_cancelled_shutdown_token_stops_loop() {
        let token = CancellationToken::new();
        let (store, mut expired) = TaskStore::spawn_until(
            window(Duration::from_secs(3600), Duration::from_secs(7200)),
            token.child_token(),
        );
        store
            .add_or_refresh(&Path::new(["pending"]), Instant::now())
            .await
            .unwrap();

        token.cancel();
        assert!(store.is_closed());
        assert!(expired.recv().await.is_none());
        assert!(store.add_or_refresh(&Path::new(["late"]), Instant::now()).await.is_err());
        store.close().await;
    }
}
