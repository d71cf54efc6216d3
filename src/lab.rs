//! Deterministic single-threaded executor for driving bus tasks.
//!
//! The lab polls spawned tasks in wake order from a FIFO ready queue, so a
//! given spawn order always produces the same interleaving. It exists for
//! tests, examples and benches; any executor that delivers wakes works with
//! the bus.
//!
//! # Example
//!
//! ```
//! use corobus::{lab::Lab, Bus};
//! use std::{cell::RefCell, rc::Rc};
//!
//! let bus = Bus::new();
//! let id = bus.open(1);
//! let mut lab = Lab::new();
//!
//! let tx = bus.clone();
//! lab.spawn(async move {
//!     for n in 0..3 {
//!         tx.send(id, n).await.unwrap();
//!     }
//! });
//!
//! let got = Rc::new(RefCell::new(Vec::new()));
//! let sink = Rc::clone(&got);
//! let rx = bus.clone();
//! lab.spawn(async move {
//!     for _ in 0..3 {
//!         let msg = rx.recv(id).await.unwrap();
//!         sink.borrow_mut().push(msg);
//!     }
//! });
//!
//! lab.run_until_stalled();
//! assert!(lab.is_quiescent());
//! assert_eq!(*got.borrow(), [0, 1, 2]);
//! ```

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Wake, Waker};

/// Identifier of a task spawned on a [`Lab`].
pub type TaskId = usize;

/// Configuration for a [`Lab`] executor.
#[derive(Debug, Clone)]
pub struct LabConfig {
    max_polls: u64,
}

impl LabConfig {
    /// Default lifetime poll budget of a lab.
    pub const DEFAULT_MAX_POLLS: u64 = 1 << 20;

    /// Creates the default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_polls: Self::DEFAULT_MAX_POLLS,
        }
    }

    /// Caps the total number of polls the lab will ever perform.
    ///
    /// The budget is a livelock guard: a task set that keeps waking itself
    /// without progressing trips the cap instead of hanging the test.
    #[must_use]
    pub const fn max_polls(mut self, max_polls: u64) -> Self {
        self.max_polls = max_polls;
        self
    }
}

impl Default for LabConfig {
    fn default() -> Self {
        Self::new()
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = ()>>>;

#[derive(Debug, Default)]
struct ReadyState {
    queue: VecDeque<TaskId>,
    queued: HashSet<TaskId>,
}

/// FIFO of woken tasks, deduplicated.
#[derive(Debug, Default)]
struct ReadyQueue {
    state: Mutex<ReadyState>,
}

impl ReadyQueue {
    fn push(&self, task: TaskId) {
        let mut state = self.state.lock().expect("ready queue poisoned");
        if state.queued.insert(task) {
            state.queue.push_back(task);
        }
    }

    fn pop(&self) -> Option<TaskId> {
        let mut state = self.state.lock().expect("ready queue poisoned");
        let task = state.queue.pop_front()?;
        state.queued.remove(&task);
        Some(task)
    }
}

struct TaskWaker {
    task: TaskId,
    ready: Arc<ReadyQueue>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.ready.push(self.task);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.ready.push(self.task);
    }
}

/// Deterministic single-threaded executor.
pub struct Lab {
    config: LabConfig,
    tasks: Vec<Option<TaskFuture>>,
    ready: Arc<ReadyQueue>,
    live: usize,
    polls: u64,
}

impl Default for Lab {
    fn default() -> Self {
        Self::new()
    }
}

impl Lab {
    /// Creates a lab with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(LabConfig::new())
    }

    /// Creates a lab with an explicit configuration.
    #[must_use]
    pub fn with_config(config: LabConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            ready: Arc::new(ReadyQueue::default()),
            live: 0,
            polls: 0,
        }
    }

    /// Spawns a task. It is first polled on the next run. Returns its id.
    pub fn spawn(&mut self, future: impl Future<Output = ()> + 'static) -> TaskId {
        let task = self.tasks.len();
        self.tasks.push(Some(Box::pin(future)));
        self.live += 1;
        self.ready.push(task);
        task
    }

    /// Polls ready tasks in wake order until every task is either finished
    /// or parked. Returns the number of polls performed by this call.
    ///
    /// # Panics
    ///
    /// Panics when the configured poll budget is exhausted, which almost
    /// always means the scheduled tasks livelock.
    pub fn run_until_stalled(&mut self) -> u64 {
        let mut performed = 0;
        while let Some(task) = self.ready.pop() {
            let Some(Some(future)) = self.tasks.get_mut(task) else {
                continue;
            };
            self.polls += 1;
            performed += 1;
            assert!(
                self.polls <= self.config.max_polls,
                "lab poll budget exhausted after {} polls",
                self.polls
            );
            let waker = Waker::from(Arc::new(TaskWaker {
                task,
                ready: Arc::clone(&self.ready),
            }));
            let mut ctx = Context::from_waker(&waker);
            let done = future.as_mut().poll(&mut ctx).is_ready();
            if done {
                self.tasks[task] = None;
                self.live -= 1;
            }
        }
        performed
    }

    /// Number of spawned tasks that have not yet completed.
    #[must_use]
    pub fn live_tasks(&self) -> usize {
        self.live
    }

    /// True when every spawned task has run to completion.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.live == 0
    }
}
