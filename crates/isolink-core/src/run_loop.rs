//! Cooperative run loop for one execution unit

use crate::error::ContextError;
use crate::timer;
use futures::channel::{mpsc, oneshot};
use futures::executor::{LocalPool, LocalSpawner};
use futures::future::{AbortHandle, Abortable};
use futures::task::LocalSpawnExt;
use futures::StreamExt;
use std::cell::RefCell;
use std::future::Future;
use std::thread::{self, ThreadId};
use std::time::Duration;

type Job = Box<dyn FnOnce() + Send>;

/// Single-threaded executor driving a Context's dispatcher and handlers
///
/// Tasks interleave only at their await points. The loop is not reentrant:
/// driving it from inside one of its own tasks panics.
pub struct RunLoop {
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
    jobs: mpsc::UnboundedSender<Job>,
    thread: ThreadId,
}

impl RunLoop {
    /// Create an empty run loop owned by the current thread
    pub fn new() -> Self {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        let (jobs, mut queue) = mpsc::unbounded::<Job>();
        let run_loop = Self {
            pool: RefCell::new(pool),
            spawner,
            jobs,
            thread: thread::current().id(),
        };
        run_loop.spawn(async move {
            while let Some(job) = queue.next().await {
                job();
            }
        });
        run_loop
    }

    /// Queue a task; it runs the next time the loop is driven
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        if let Err(e) = self.spawner.spawn_local(future) {
            tracing::error!(target: "isolink::context", "failed to spawn task: {}", e);
        }
    }

    /// Run `callback` on this loop once `delay` has elapsed
    ///
    /// The callback runs when the loop is driven at or after the deadline.
    pub fn schedule(&self, delay: Duration, callback: impl FnOnce() + 'static) -> ScheduledTask {
        let (handle, registration) = AbortHandle::new_pair();
        let task = Abortable::new(
            async move {
                timer::delay(delay).await;
                callback();
            },
            registration,
        );
        self.spawn(async move {
            let _ = task.await;
        });
        ScheduledTask { handle }
    }

    /// Thread-safe handle queuing closures onto this loop
    pub fn sender(&self) -> RunLoopSender {
        RunLoopSender {
            jobs: self.jobs.clone(),
            thread: self.thread,
        }
    }

    /// Run every task until none can make progress without outside input
    pub fn run_until_stalled(&self) {
        self.pool.borrow_mut().run_until_stalled();
    }

    /// Drive the loop until `future` completes, blocking the thread while idle
    pub fn run_until<F: Future>(&self, future: F) -> F::Output {
        self.pool.borrow_mut().run_until(future)
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback scheduled with [`RunLoop::schedule`]
///
/// Dropping it leaves the callback scheduled.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: AbortHandle,
}

impl ScheduledTask {
    /// Prevent the callback from running if it has not run yet
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Check whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.handle.is_aborted()
    }
}

/// Sends closures to a run loop from any thread
#[derive(Clone, Debug)]
pub struct RunLoopSender {
    jobs: mpsc::UnboundedSender<Job>,
    thread: ThreadId,
}

impl RunLoopSender {
    /// Queue `callback` on the loop and return immediately
    ///
    /// Fails with `ContextError::Closed` once the loop is gone.
    pub fn send<F>(&self, callback: F) -> Result<(), ContextError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.jobs
            .unbounded_send(Box::new(callback))
            .map_err(|_| ContextError::Closed)
    }

    /// Queue `callback` on the loop and block until it has run
    ///
    /// On the loop's own thread the callback runs immediately instead, since
    /// waiting there could never finish. From other threads this blocks until
    /// the owner drives the loop.
    pub fn send_and_wait<F, R>(&self, callback: F) -> Result<R, ContextError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if thread::current().id() == self.thread {
            return Ok(callback());
        }
        let (result, receiver) = oneshot::channel();
        self.send(move || {
            let _ = result.send(callback());
        })?;
        futures::executor::block_on(receiver).map_err(|_| ContextError::Closed)
    }

    /// Check whether the loop is gone
    pub fn is_closed(&self) -> bool {
        self.jobs.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_spawned_tasks_run_when_driven() {
        let run_loop = RunLoop::new();
        let hits = Rc::new(Cell::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            run_loop.spawn(async move { hits.set(hits.get() + 1) });
        }
        assert_eq!(hits.get(), 0);

        run_loop.run_until_stalled();
        assert_eq!(hits.get(), 3);
    }

    #[test]
    fn test_run_until_drives_other_tasks() {
        let run_loop = RunLoop::new();
        let (tx, rx) = oneshot::channel();
        run_loop.spawn(async move {
            let _ = tx.send(5);
        });
        assert_eq!(run_loop.run_until(rx), Ok(5));
    }

    #[test]
    fn test_sender_from_other_thread() {
        let run_loop = RunLoop::new();
        let sender = run_loop.sender();
        let hits = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();

        let worker_hits = hits.clone();
        let worker = thread::spawn(move || {
            sender
                .send(move || {
                    worker_hits.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            sender.send(move || drop(done_tx.send(()))).unwrap();
        });

        run_loop.run_until(done_rx).unwrap();
        worker.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_and_wait_returns_value() {
        let run_loop = RunLoop::new();
        let sender = run_loop.sender();
        let worker = thread::spawn(move || sender.send_and_wait(|| 6 * 7));

        let result = loop {
            run_loop.run_until_stalled();
            if worker.is_finished() {
                break worker.join().unwrap();
            }
            thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(result, Ok(42));
    }

    #[test]
    fn test_send_and_wait_on_own_thread_runs_inline() {
        let run_loop = RunLoop::new();
        assert_eq!(run_loop.sender().send_and_wait(|| "inline"), Ok("inline"));
    }

    #[test]
    fn test_sender_after_loop_dropped() {
        let run_loop = RunLoop::new();
        let sender = run_loop.sender();
        drop(run_loop);

        assert!(sender.is_closed());
        assert_eq!(sender.send(|| {}), Err(ContextError::Closed));
        let waited = thread::spawn(move || sender.send_and_wait(|| 1)).join().unwrap();
        assert_eq!(waited, Err(ContextError::Closed));
    }

    #[test]
    fn test_schedule_runs_after_delay() {
        let run_loop = RunLoop::new();
        let fired = Rc::new(Cell::new(None));
        let start = Instant::now();

        let slot = fired.clone();
        let _task = run_loop.schedule(Duration::from_millis(20), move || slot.set(Some(Instant::now())));
        run_loop.run_until_stalled();
        assert!(fired.get().is_none());

        run_loop.run_until(timer::delay(Duration::from_millis(40)));
        let at = fired.get().unwrap();
        assert!(at.duration_since(start) >= Duration::from_millis(20));
    }

    #[test]
    fn test_cancelled_schedule_never_runs() {
        let run_loop = RunLoop::new();
        let fired = Rc::new(Cell::new(false));

        let slot = fired.clone();
        let task = run_loop.schedule(Duration::from_millis(10), move || slot.set(true));
        task.cancel();
        assert!(task.is_cancelled());

        run_loop.run_until(timer::delay(Duration::from_millis(30)));
        run_loop.run_until_stalled();
        assert!(!fired.get());
    }
}
