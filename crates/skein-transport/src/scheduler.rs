//! Single-threaded cooperative task scheduler.
//!
//! A [`Scheduler`] owns a tokio current-thread runtime and a `LocalSet`, so
//! every task it runs shares one OS thread and only switches at an `.await`.
//! State shared between tasks (connection tables, the node registry) can
//! therefore live in `Rc<RefCell<_>>` without locks, as long as no borrow is
//! held across an `.await`.
//!
//! Suspension points offered here: waiting for descriptor readiness
//! ([`FdWaiter`]), waiting on a [`Signal`], [`sleep`] and [`yield_now`].

use std::cell::RefCell;
use std::future::Future;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::error::SchedulerError;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum number of live tasks (default: 100_000).
    pub max_tasks: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { max_tasks: 100_000 }
    }
}

/// Identifier of a live task. Ids of finished tasks are reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub usize);

#[derive(Debug, Default)]
struct TaskSlots {
    live: usize,
    next_id: usize,
    free: Vec<usize>,
}

/// Returns its slot to the pool when the task finishes or is dropped.
struct SlotGuard {
    slots: Rc<RefCell<TaskSlots>>,
    id: usize,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut slots = self.slots.borrow_mut();
        slots.live -= 1;
        slots.free.push(self.id);
    }
}

/// Cheap, clonable spawner usable from inside scheduler tasks.
#[derive(Clone)]
pub struct SchedulerHandle {
    slots: Rc<RefCell<TaskSlots>>,
    max_tasks: usize,
}

impl SchedulerHandle {
    fn acquire(&self) -> Result<SlotGuard, SchedulerError> {
        let mut slots = self.slots.borrow_mut();
        if slots.live >= self.max_tasks {
            warn!(max = self.max_tasks, "task limit reached");
            return Err(SchedulerError::TaskLimit {
                max: self.max_tasks,
            });
        }
        let id = match slots.free.pop() {
            Some(id) => id,
            None => {
                slots.next_id += 1;
                slots.next_id - 1
            }
        };
        slots.live += 1;
        Ok(SlotGuard {
            slots: Rc::clone(&self.slots),
            id,
        })
    }

    /// Spawns a task onto the running scheduler.
    ///
    /// Must be called from a task running on this scheduler's thread; panics
    /// otherwise.
    pub fn spawn<F>(&self, task: F) -> Result<TaskId, SchedulerError>
    where
        F: Future<Output = ()> + 'static,
    {
        let guard = self.acquire()?;
        let id = TaskId(guard.id);
        tokio::task::spawn_local(async move {
            let _slot = guard;
            task.await;
        });
        Ok(id)
    }

    /// Number of tasks that have been spawned and not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.slots.borrow().live
    }

    /// Configured task cap.
    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }
}

/// One cooperative scheduler per OS thread.
pub struct Scheduler {
    runtime: Runtime,
    local: LocalSet,
    handle: SchedulerHandle,
}

impl Scheduler {
    /// Builds the runtime.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        debug!(max_tasks = config.max_tasks, "scheduler created");
        Ok(Self {
            runtime,
            local: LocalSet::new(),
            handle: SchedulerHandle {
                slots: Rc::new(RefCell::new(TaskSlots::default())),
                max_tasks: config.max_tasks,
            },
        })
    }

    /// A spawner for use inside tasks.
    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    /// Queues a task before (or while) the scheduler runs.
    pub fn spawn<F>(&self, task: F) -> Result<TaskId, SchedulerError>
    where
        F: Future<Output = ()> + 'static,
    {
        let guard = self.handle.acquire()?;
        let id = TaskId(guard.id);
        self.local.spawn_local(async move {
            let _slot = guard;
            task.await;
        });
        Ok(id)
    }

    /// Runs `f` on a fixed period until the scheduler stops.
    ///
    /// Late ticks are delayed rather than bunched up.
    pub fn every<F>(&self, period: Duration, mut f: F) -> Result<TaskId, SchedulerError>
    where
        F: FnMut() + 'static,
    {
        self.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                f();
            }
        })
    }

    /// Drives all tasks until `main` completes.
    pub fn block_on<F: Future>(&self, main: F) -> F::Output {
        self.local.block_on(&self.runtime, main)
    }
}

/// Readiness a task can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitFor {
    /// Readable (or peer closed).
    Read,
    /// Writable.
    Write,
    /// Either.
    Both,
}

/// Outcome of an [`FdWaiter::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Data (or EOF) can be read.
    Readable,
    /// The send buffer has room.
    Writable,
    /// Both at once.
    Both,
    /// The timeout expired first.
    TimedOut,
}

/// Registers a descriptor with the reactor so tasks can sleep on it.
///
/// The waiter does not own the descriptor; it must be dropped before the
/// descriptor is closed.
pub struct FdWaiter {
    inner: AsyncFd<RawFd>,
}

impl FdWaiter {
    /// Registers `fd` for read and write readiness.
    pub fn new(fd: RawFd) -> Result<Self, SchedulerError> {
        let inner = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?;
        Ok(Self { inner })
    }

    /// The watched descriptor.
    pub fn fd(&self) -> RawFd {
        *self.inner.get_ref()
    }

    /// Suspends until the descriptor is ready or `timeout` passes.
    ///
    /// Readiness is consumed by the call: only wait again after the
    /// corresponding operation has reported `EAGAIN`.
    pub async fn wait(&self, what: WaitFor, timeout: Option<Duration>) -> io::Result<Readiness> {
        let ready = async {
            let interest = match what {
                WaitFor::Read => Interest::READABLE,
                WaitFor::Write => Interest::WRITABLE,
                WaitFor::Both => Interest::READABLE | Interest::WRITABLE,
            };
            let mut guard = self.inner.ready(interest).await?;
            let seen = guard.ready();
            guard.clear_ready();
            let readable = seen.is_readable() || seen.is_read_closed();
            let writable = seen.is_writable() || seen.is_write_closed();
            Ok(match (readable, writable) {
                (true, true) if what == WaitFor::Both => Readiness::Both,
                (true, _) if what != WaitFor::Write => Readiness::Readable,
                _ => Readiness::Writable,
            })
        };
        match timeout {
            Some(limit) => match tokio::time::timeout(limit, ready).await {
                Ok(result) => result,
                Err(_) => Ok(Readiness::TimedOut),
            },
            None => ready.await,
        }
    }
}

/// Condition-variable-like wakeup between tasks on one scheduler.
#[derive(Clone, Default)]
pub struct Signal {
    notify: Rc<Notify>,
}

impl Signal {
    /// Creates an unsignalled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wakes one waiter, or the next task to wait if none is waiting.
    pub fn notify_one(&self) {
        self.notify.notify_one();
    }

    /// Wakes every task currently waiting.
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    /// Waits for a notification. Returns false if `timeout` passed first.
    pub async fn wait(&self, timeout: Option<Duration>) -> bool {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.notify.notified())
                .await
                .is_ok(),
            None => {
                self.notify.notified().await;
                true
            }
        }
    }
}

/// Suspends the current task for `duration`.
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Lets every other runnable task run once.
pub async fn yield_now() {
    tokio::task::yield_now().await;
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    use super::*;

    fn scheduler(max_tasks: usize) -> Scheduler {
        Scheduler::new(SchedulerConfig { max_tasks }).unwrap()
    }

    #[test]
    fn test_tasks_interleave_on_one_thread() {
        let sched = scheduler(16);
        let log = Rc::new(RefCell::new(Vec::new()));
        for name in ["a", "b"] {
            let log = Rc::clone(&log);
            sched
                .spawn(async move {
                    for i in 0..2 {
                        log.borrow_mut().push(format!("{name}{i}"));
                        yield_now().await;
                    }
                })
                .unwrap();
        }
        sched.block_on(async {
            sleep(Duration::from_millis(10)).await;
        });
        assert_eq!(*log.borrow(), vec!["a0", "b0", "a1", "b1"]);
    }

    #[test]
    fn test_task_limit_and_slot_reuse() {
        let sched = scheduler(2);
        let handle = sched.handle();
        let first = sched.spawn(async {}).unwrap();
        sched.spawn(async { sleep(Duration::from_millis(50)).await }).unwrap();
        assert!(matches!(
            sched.spawn(async {}),
            Err(SchedulerError::TaskLimit { max: 2 })
        ));
        assert_eq!(handle.live_tasks(), 2);

        sched.block_on(async {
            yield_now().await;
        });
        assert_eq!(handle.live_tasks(), 1);
        let reused = sched.spawn(async {}).unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn test_handle_spawn_inside_task() {
        let sched = scheduler(8);
        let handle = sched.handle();
        let done = Rc::new(RefCell::new(false));
        let flag = Rc::clone(&done);
        sched.block_on(async move {
            handle
                .spawn(async move {
                    *flag.borrow_mut() = true;
                })
                .unwrap();
            yield_now().await;
        });
        assert!(*done.borrow());
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let sched = scheduler(8);
        let signal = Signal::new();
        let woke = Rc::new(RefCell::new(false));
        {
            let signal = signal.clone();
            let woke = Rc::clone(&woke);
            sched
                .spawn(async move {
                    *woke.borrow_mut() = signal.wait(Some(Duration::from_secs(5))).await;
                })
                .unwrap();
        }
        sched.block_on(async move {
            yield_now().await;
            signal.notify_all();
            sleep(Duration::from_millis(5)).await;
        });
        assert!(*woke.borrow());
    }

    #[test]
    fn test_signal_timeout() {
        let sched = scheduler(8);
        let notified = sched.block_on(async {
            Signal::new().wait(Some(Duration::from_millis(10))).await
        });
        assert!(!notified);
    }

    #[test]
    fn test_fd_waiter_readable_and_timeout() {
        let sched = scheduler(8);
        let (mut a, b) = UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        sched.block_on(async {
            let waiter = FdWaiter::new(b.as_raw_fd()).unwrap();
            let r = waiter
                .wait(WaitFor::Read, Some(Duration::from_millis(20)))
                .await
                .unwrap();
            assert_eq!(r, Readiness::TimedOut);

            a.write_all(b"x").unwrap();
            let r = waiter
                .wait(WaitFor::Read, Some(Duration::from_secs(5)))
                .await
                .unwrap();
            assert_eq!(r, Readiness::Readable);

            let r = waiter.wait(WaitFor::Write, None).await.unwrap();
            assert_eq!(r, Readiness::Writable);
        });
    }

    #[test]
    fn test_every_ticks() {
        let sched = scheduler(8);
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        sched
            .every(Duration::from_millis(5), move || *c.borrow_mut() += 1)
            .unwrap();
        sched.block_on(sleep(Duration::from_millis(40)));
        assert!(*count.borrow() >= 3);
    }
}
