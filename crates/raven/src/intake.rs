//! Staging for raw events on their way to reconstruction.
//!
//! Producers push; a single worker waits for the debounce window, swaps the
//! staged list out and hands it to the [`ReconstructionPipeline`]. Events
//! pushed while a batch is being processed land in the next batch.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nostr::Event;
use tokio::sync::{Mutex, Notify, broadcast};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::model::RavenEvent;
use crate::reconstruct::ReconstructionPipeline;

/// Arm once, fire once, re-arm on the next push.
#[derive(Debug)]
pub struct DebounceTimer {
    delay: Duration,
    armed: AtomicBool,
    wake: Notify,
}

impl DebounceTimer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            armed: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm an idle timer. Returns `false` if it was already armed.
    pub fn arm(&self) -> bool {
        let armed = self
            .armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if armed {
            self.wake.notify_one();
        }
        armed
    }

    pub fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Resolves one delay after the timer is seen armed.
    pub async fn wait_fire(&self) {
        while !self.is_armed() {
            self.wake.notified().await;
        }
        tokio::time::sleep(self.delay).await;
    }
}

#[derive(Debug, Default)]
struct Staged {
    events: Vec<Event>,
    ids: HashSet<String>,
}

#[derive(Debug)]
pub struct IntakeBuffer {
    staged: Mutex<Staged>,
    timer: DebounceTimer,
    max_batch_size: Option<usize>,
    expedite: Notify,
}

impl IntakeBuffer {
    pub fn new(delay: Duration, max_batch_size: Option<usize>) -> Self {
        Self {
            staged: Mutex::new(Staged::default()),
            timer: DebounceTimer::new(delay),
            max_batch_size,
            expedite: Notify::new(),
        }
    }

    pub fn timer(&self) -> &DebounceTimer {
        &self.timer
    }

    /// Stage `event`. Returns `false` if an event with the same id is
    /// already waiting in the current batch.
    pub async fn push(&self, event: Event) -> bool {
        let staged_len = {
            let mut staged = self.staged.lock().await;
            if !staged.ids.insert(event.id.clone()) {
                return false;
            }
            staged.events.push(event);
            staged.events.len()
        };

        self.timer.arm();
        if self.max_batch_size.is_some_and(|max| staged_len >= max) {
            self.expedite.notify_one();
        }
        true
    }

    /// Stage every event; returns how many were new to the batch.
    pub async fn extend(&self, events: impl IntoIterator<Item = Event>) -> usize {
        let mut added = 0;
        for event in events {
            if self.push(event).await {
                added += 1;
            }
        }
        added
    }

    pub async fn len(&self) -> usize {
        self.staged.lock().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Swap the staged list for an empty one.
    pub async fn take_batch(&self) -> Vec<Event> {
        let mut staged = self.staged.lock().await;
        staged.ids.clear();
        std::mem::take(&mut staged.events)
    }

    /// Mark the current batch processed. Re-arms at once if events were
    /// staged in the meantime.
    pub async fn finish_batch(&self) {
        self.timer.disarm();
        if !self.is_empty().await {
            self.timer.arm();
        }
    }

    /// Wait for the debounce window (or a full buffer) and take the batch.
    /// A wake-up that finds the buffer below the limit keeps the window
    /// that is already running.
    pub async fn next_batch(&self) -> Vec<Event> {
        loop {
            let fire = self.timer.wait_fire();
            tokio::pin!(fire);
            loop {
                tokio::select! {
                    () = &mut fire => break,
                    () = self.expedite.notified() => {
                        if self.is_full().await {
                            debug!("intake buffer full, flushing early");
                            break;
                        }
                    }
                }
            }

            let batch = self.take_batch().await;
            if !batch.is_empty() {
                return batch;
            }
            self.finish_batch().await;
        }
    }

    async fn is_full(&self) -> bool {
        match self.max_batch_size {
            Some(max) => self.len().await >= max,
            None => false,
        }
    }

    /// Run the reconstruction consumer until the handle is aborted.
    pub fn spawn_worker(
        self: Arc<Self>,
        pipeline: Arc<ReconstructionPipeline>,
        events: broadcast::Sender<RavenEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let batch = self.next_batch().await;
                debug!("reconstructing batch of {} events", batch.len());
                for emitted in pipeline.reconstruct(&batch).await {
                    // No subscribers is not an error.
                    let _ = events.send(emitted);
                }
                self.finish_batch().await;
            }
        })
    }
}
