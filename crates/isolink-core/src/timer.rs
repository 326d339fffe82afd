//! Process-wide timer thread
//!
//! Run loops are cooperative and have no clock of their own. A single timer
//! thread keeps a min-heap of deadlines and wakes the [`Delay`] futures
//! registered with it, which then resume on their own run loop.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread;
use std::time::{Duration, Instant};

static TIMER: Lazy<Arc<TimerThread>> = Lazy::new(TimerThread::start);

/// Future completing once `duration` has elapsed
pub fn delay(duration: Duration) -> Delay {
    Delay {
        deadline: Instant::now() + duration,
        state: None,
    }
}

// ============================================================================
// Delay
// ============================================================================

struct DelayInner {
    fired: bool,
    waker: Option<Waker>,
}

type DelayState = Arc<Mutex<DelayInner>>;

/// Future returned by [`delay`]
pub struct Delay {
    deadline: Instant,
    state: Option<DelayState>,
}

impl Delay {
    /// Instant at which the delay completes
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Delay {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if Instant::now() >= self.deadline {
            return Poll::Ready(());
        }
        if let Some(state) = &self.state {
            let mut inner = state.lock();
            if inner.fired {
                return Poll::Ready(());
            }
            inner.waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let state = Arc::new(Mutex::new(DelayInner {
            fired: false,
            waker: Some(cx.waker().clone()),
        }));
        TIMER.register(self.deadline, state.clone());
        self.state = Some(state);
        Poll::Pending
    }
}

// ============================================================================
// Timer Thread
// ============================================================================

struct TimerEntry {
    wake_at: Instant,
    seq: u64,
    state: DelayState,
}

// Reversed for a min-heap: earliest deadline first, then registration order
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
struct TimerState {
    pending: BinaryHeap<TimerEntry>,
    next_seq: u64,
}

struct TimerThread {
    state: Mutex<TimerState>,
    notify: Condvar,
}

impl TimerThread {
    fn start() -> Arc<Self> {
        let timer = Arc::new(Self {
            state: Mutex::new(TimerState::default()),
            notify: Condvar::new(),
        });
        let worker = timer.clone();
        if let Err(e) = thread::Builder::new()
            .name("isolink-timer".to_string())
            .spawn(move || worker.run())
        {
            tracing::error!(target: "isolink::context", "failed to spawn timer thread: {}", e);
        }
        timer
    }

    fn register(&self, wake_at: Instant, state: DelayState) {
        let mut timers = self.state.lock();
        let seq = timers.next_seq;
        timers.next_seq += 1;
        timers.pending.push(TimerEntry {
            wake_at,
            seq,
            state,
        });
        // The new deadline may be earlier than the one being waited on
        self.notify.notify_one();
    }

    fn run(&self) {
        let mut timers = self.state.lock();
        loop {
            let now = Instant::now();
            while timers.pending.peek().map_or(false, |e| e.wake_at <= now) {
                if let Some(entry) = timers.pending.pop() {
                    fire(&entry.state);
                }
            }

            match timers.pending.peek().map(|e| e.wake_at) {
                Some(next) => {
                    let timeout = next.saturating_duration_since(Instant::now());
                    self.notify.wait_for(&mut timers, timeout);
                }
                None => self.notify.wait(&mut timers),
            }
        }
    }
}

fn fire(state: &DelayState) {
    let waker = {
        let mut inner = state.lock();
        inner.fired = true;
        inner.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}
