//! Append wakeups that survive the gap between an empty claim and the wait.
//!
//! `Notify::notify_waiters` stores no permit, so an append landing after a
//! claim came back empty but before the poll loop starts waiting would be
//! lost. Each [`Wakeup`] carries a generation bumped on every wake; a claim
//! records the generation it started from in [`ClaimMarks`], and the wait
//! returns at once if the generation has moved since.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::select_all;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

use super::types::ConsumerConfig;

#[derive(Debug, Default)]
pub struct Wakeup {
    generation: AtomicU64,
    notify: Notify,
}

impl Wakeup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn wake(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn notified(&self) -> Pin<Box<Notified<'_>>> {
        let mut notified = Box::pin(self.notify.notified());
        notified.as_mut().enable();
        notified
    }
}

/// Sum of the generations of `wakeups`.
pub fn combined_generation<'a>(wakeups: impl IntoIterator<Item = &'a Wakeup>) -> u64 {
    wakeups
        .into_iter()
        .fold(0u64, |sum, w| sum.wrapping_add(w.generation()))
}

/// Wait until any of `wakeups` fires or `timeout` passes.
///
/// With `seen` set, returns immediately when the combined generation no
/// longer equals it.
pub async fn wait_any(wakeups: &[&Wakeup], seen: Option<u64>, timeout: Duration) {
    if wakeups.is_empty() {
        tokio::time::sleep(timeout).await;
        return;
    }
    // Registered before the generation check, so a wake in between is kept.
    let waits: Vec<_> = wakeups.iter().map(|w| w.notified()).collect();
    if seen.is_some_and(|seen| combined_generation(wakeups.iter().copied()) != seen) {
        return;
    }
    let _ = tokio::time::timeout(timeout, select_all(waits)).await;
}

/// Generation each consumer observed when its last claim started.
#[derive(Debug, Default)]
pub struct ClaimMarks {
    marks: Mutex<HashMap<(String, String), u64>>,
}

impl ClaimMarks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, config: &ConsumerConfig, generation: u64) {
        self.marks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(key(config), generation);
    }

    pub fn last(&self, config: &ConsumerConfig) -> Option<u64> {
        self.marks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&key(config))
            .copied()
    }

    pub fn clear(&self) {
        self.marks.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

fn key(config: &ConsumerConfig) -> (String, String) {
    (config.consumer_group.clone(), config.consumer_name.clone())
}
