//! Fixed-Delay Timer Set
//!
//! Every item fires exactly once, a fixed delay after it was added. Because
//! the delay is uniform the queue is already sorted by due time, so a FIFO
//! of `(due_at, item)` pairs replaces the radix heap. Re-adding an item adds
//! a second entry; consumers that renew should make firing idempotent.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::clock::SharedClock;
use super::tick::TickSource;
use super::timer_set::{fire, FireHandler};

struct Shared<T> {
    queue: Mutex<VecDeque<(Instant, T)>>,
    handler: Option<FireHandler<T>>,
    clock: SharedClock,
    tick: TickSource,
    fire_delay: Duration,
}

impl<T> Shared<T>
where
    T: Send + 'static,
{
    async fn run(self: Arc<Self>) {
        // Nothing can be due before one full delay has passed.
        tokio::time::sleep(self.fire_delay).await;

        loop {
            let now = self.clock.now();
            let mut resume_delay = self.fire_delay;
            let mut due = Vec::new();
            {
                let mut queue = self.queue.lock();
                while let Some((due_at, _)) = queue.front() {
                    if *due_at > now {
                        resume_delay = *due_at - now;
                        break;
                    }
                    if let Some((_, item)) = queue.pop_front() {
                        due.push(item);
                    }
                }
            }

            if let Some(handler) = &self.handler {
                for item in due {
                    fire(handler, item);
                }
            }

            if resume_delay < self.tick.period() {
                self.tick.when_next_tick().await;
            } else {
                tokio::time::sleep(resume_delay).await;
            }
        }
    }
}

/// A FIFO timer set with one fixed fire delay.
///
/// Must be created inside a tokio runtime. Dropping the set stops it.
pub struct FixedTimerSet<T> {
    shared: Arc<Shared<T>>,
    task: JoinHandle<()>,
}

impl<T> FixedTimerSet<T>
where
    T: Send + 'static,
{
    /// Create a set firing each item `fire_delay` after it is added.
    pub fn new(
        fire_delay: Duration,
        tick: TickSource,
        clock: SharedClock,
        handler: Option<FireHandler<T>>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            handler,
            clock,
            tick,
            fire_delay: fire_delay.max(Duration::from_millis(1)),
        });
        let task = tokio::spawn(Arc::clone(&shared).run());
        Self { shared, task }
    }

    /// The fixed fire delay.
    pub fn fire_delay(&self) -> Duration {
        self.shared.fire_delay
    }

    /// Number of pending entries.
    pub fn count(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Enqueue `item` to fire after the fixed delay.
    pub fn add(&self, item: T) {
        let due_at = self.shared.clock.now() + self.shared.fire_delay;
        self.shared.queue.lock().push_back((due_at, item));
    }

    /// Fire every pending item right now, on a separate task.
    pub fn fire_immediately(&self) -> JoinHandle<()> {
        let due: Vec<T> = self.shared.queue.lock().drain(..).map(|(_, item)| item).collect();
        let handler = self.shared.handler.clone();
        tokio::spawn(async move {
            if let Some(handler) = handler {
                for item in due {
                    fire(&handler, item);
                }
            }
        })
    }

    /// Stop the background task. Pending items never fire.
    pub fn dispose(&self) {
        self.task.abort();
    }
}

impl<T> Drop for FixedTimerSet<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> std::fmt::Debug for FixedTimerSet<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedTimerSet")
            .field("fire_delay", &self.shared.fire_delay)
            .field("count", &self.shared.queue.lock().len())
            .finish()
    }
}
