//! The process-wide scheduler: dirty queue, worker pool, update epoch, and
//! quiescence barrier.
//!
//! The epoch counter and the "one atomic counter bumped per top-level
//! write" shape are grounded in the teacher's `SharedState`/
//! `with_incremented_revision` (`runtime.rs`). The worker-pool fan-out
//! itself has no equivalent in the teacher (salsa queries run
//! synchronously on the calling thread); it is grounded instead in the
//! coordinator/worker channel split used by the block-execution scheduler
//! example in the retrieval pack, adapted from a fixed work-partition
//! model to an open-ended dirty queue.

use crate::errors::QuiescenceFromEvaluator;
use crate::node::AnyNode;
use crate::recorder;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

enum WorkItem {
    Node(Arc<dyn AnyNode>),
    OneShot(Box<dyn FnOnce() + Send>),
}

/// State shared between the `Manager` and its worker threads: the send
/// half of the dirty queue, plus the quiescence barrier. Split out from
/// `Manager` so workers can be spawned with a handle to this before the
/// `Manager` itself (which owns the `JoinHandle`s) finishes construction.
struct SchedulerCore {
    sender: Sender<WorkItem>,
    outstanding: Mutex<usize>,
    quiesced: Condvar,
}

impl SchedulerCore {
    fn begin_outstanding(&self) {
        *self.outstanding.lock() += 1;
    }

    fn end_outstanding(&self) {
        let mut count = self.outstanding.lock();
        *count -= 1;
        if *count == 0 {
            self.quiesced.notify_all();
        }
    }
}

pub(crate) struct Manager {
    core: Arc<SchedulerCore>,
    epoch: AtomicU64,
    _workers: Vec<JoinHandle<()>>,
}

impl Manager {
    fn new(worker_count: usize) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = unbounded::<WorkItem>();
        let core = Arc::new(SchedulerCore {
            sender,
            outstanding: Mutex::new(0),
            quiesced: Condvar::new(),
        });
        debug!("starting manager with {} worker(s)", worker_count);

        let workers = (0..worker_count)
            .map(|idx| {
                let receiver = receiver.clone();
                let core = core.clone();
                std::thread::Builder::new()
                    .name(format!("propagate-worker-{}", idx))
                    .spawn(move || worker_loop(receiver, core))
                    .expect("failed to spawn propagation worker thread")
            })
            .collect();

        Arc::new(Manager {
            core,
            epoch: AtomicU64::new(0),
            _workers: workers,
        })
    }

    /// Idempotently enqueues `node` for evaluation, coalescing with any
    /// already-pending or in-flight evaluation of the same node.
    pub(crate) fn enqueue(&self, node: Arc<dyn AnyNode>) {
        if node.clone().mark_dirty() {
            self.core.begin_outstanding();
            let _ = self.core.sender.send(WorkItem::Node(node));
        }
    }

    /// Schedules a one-shot task to run on a worker thread. Used for
    /// destructor-driven side effects that need to touch the graph from a
    /// context where doing so synchronously would be unsafe, such as
    /// `PollSource`'s `unsubscribe` callback (`source.rs`).
    pub(crate) fn run_on_manager_thread(&self, f: impl FnOnce() + Send + 'static) {
        self.core.begin_outstanding();
        let _ = self.core.sender.send(WorkItem::OneShot(Box::new(f)));
    }

    /// Blocks until the dirty queue is empty and no worker is evaluating.
    ///
    /// # Panics
    /// Panics if called from inside an evaluator running on a worker
    /// thread (`QuiescenceFromEvaluator`): that would deadlock the
    /// manager, since the calling worker would never come back around to
    /// drain the queue it is waiting on.
    pub(crate) fn wait_for_all_updates(&self) {
        if recorder::is_inside_evaluation() {
            panic!("{}", QuiescenceFromEvaluator);
        }
        let mut count = self.core.outstanding.lock();
        while *count != 0 {
            self.core.quiesced.wait(&mut count);
        }
    }

    /// Bumps and returns the new global update epoch. Called once per
    /// top-level `Source::set`.
    pub(crate) fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn worker_loop(receiver: Receiver<WorkItem>, core: Arc<SchedulerCore>) {
    while let Ok(item) = receiver.recv() {
        match item {
            WorkItem::Node(node) => {
                let reenqueue = node.clone().evaluate();
                if reenqueue {
                    // Still outstanding work; hand straight back to the
                    // queue instead of going through `begin_outstanding`
                    // again (the node never left the "outstanding" set).
                    let _ = core.sender.send(WorkItem::Node(node));
                } else {
                    core.end_outstanding();
                }
            }
            WorkItem::OneShot(f) => {
                f();
                core.end_outstanding();
            }
        }
    }
}

static MANAGER: OnceLock<Arc<Manager>> = OnceLock::new();

fn worker_count_from_env() -> usize {
    std::env::var("PROPAGATE_WORKERS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

/// Returns the process-wide manager, lazily starting its worker pool on
/// first use (the first `Source::new` or `make_observer` call anywhere in
/// the process).
pub(crate) fn global() -> &'static Arc<Manager> {
    MANAGER.get_or_init(|| {
        debug!("lazily initializing propagation manager");
        Manager::new(worker_count_from_env())
    })
}
