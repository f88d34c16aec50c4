//! Timer capability for the control loop.
//!
//! Every delayed action in the pipeline (batch expiry, soft-expire
//! deferrals, dispatch rechecks, auto-refresh, hard timeouts, decode-
//! error debounce) goes through one [`Timers`] instance per window:
//! `schedule` returns a handle, `cancel` revokes it, and the control
//! loop awaits [`Timers::expired`] alongside its channels. No task is
//! ever spawned per timer and nothing busy-waits.

use std::task::Poll;
use std::time::Duration;

use tokio_util::time::delay_queue::{DelayQueue, Key};

/// Handle to one scheduled timer.
///
/// Valid until the timer fires or is cancelled; the owner must forget
/// the handle at that point since keys are recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(Key);

/// A deadline queue carrying one token per scheduled timer.
#[derive(Debug)]
pub struct Timers<T> {
    queue: DelayQueue<T>,
}

impl<T> Default for Timers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Timers<T> {
    pub fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
        }
    }

    /// Arm a timer; the token comes back out of [`expired`](Self::expired)
    /// after `delay`.
    pub fn schedule(&mut self, delay: Duration, token: T) -> TimerHandle {
        TimerHandle(self.queue.insert(token, delay))
    }

    /// Disarm a timer, returning its token when it was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        self.queue.try_remove(&handle.0).map(|e| e.into_inner())
    }

    /// Drop every pending timer.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Wait for the next timer to fire.
    ///
    /// Pends forever while the queue is empty instead of resolving, so
    /// it can sit in a `select!` arm without spinning; any branch that
    /// schedules a timer re-polls a fresh call on the next loop pass.
    pub async fn expired(&mut self) -> T {
        futures::future::poll_fn(|cx| {
            if self.queue.is_empty() {
                return Poll::Pending;
            }
            match self.queue.poll_expired(cx) {
                Poll::Ready(Some(expired)) => Poll::Ready(expired.into_inner()),
                _ => Poll::Pending,
            }
        })
        .await
    }
}
