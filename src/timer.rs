//! Retransmission timer.
//!
//! Each endpoint owns one [`RetransmitTimer`], always tracking its oldest
//! unacknowledged segment.  Arming spawns a tokio task that sleeps for the
//! fixed RTO and then runs the expiry callback; re-arming or cancelling
//! aborts that task.
//!
//! Aborting cannot stop a task that has already woken and is waiting for the
//! endpoint lock, so every arm hands the callback a generation number.  The
//! callback must check [`RetransmitTimer::is_current`] under the lock and
//! ignore a stale firing.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct RetransmitTimer {
    rto: Duration,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl RetransmitTimer {
    pub fn new(rto: Duration) -> Self {
        Self {
            rto,
            generation: 0,
            task: None,
        }
    }

    pub fn rto(&self) -> Duration {
        self.rto
    }

    /// Cancel any pending expiry and schedule `on_expiry` after one RTO.
    ///
    /// Must be called from within a tokio runtime.
    pub fn arm<F, Fut>(&mut self, on_expiry: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        let generation = self.generation;
        let rto = self.rto;
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(rto).await;
            on_expiry(generation).await;
        }));
    }

    /// Stop the timer.  A callback already past its sleep becomes stale.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.generation = self.generation.wrapping_add(1);
    }

    /// `true` if `generation` belongs to the currently armed expiry.
    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && self.generation == generation
    }

    /// Called by the expiry callback once it has claimed the firing.  Detaches
    /// the running task so a re-arm from inside the callback does not abort
    /// the callback itself.
    pub fn fired(&mut self) {
        self.task = None;
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_some()
    }
}

impl Drop for RetransmitTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
