//! Bounded memory of which image URLs resolve to placeholders

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Tracks URLs known to be placeholders (or known to load) so repeated
/// requests for missing images skip the origin
///
/// Capacity is fixed; inserting beyond it evicts the oldest URL.
#[derive(Debug)]
pub struct PlaceholderTracker {
    capacity: usize,
    inner: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// url -> true when loaded, false when placeholder
    status: HashMap<String, bool>,
    order: VecDeque<String>,
}

impl PlaceholderTracker {
    pub fn new(capacity: usize) -> Self {
        PlaceholderTracker {
            capacity: capacity.max(1),
            inner: Mutex::new(TrackerState::default()),
        }
    }

    /// URL shapes the origin and mirrors use for "no image"
    pub fn matches_placeholder_pattern(url: &str) -> bool {
        url.ends_with("bottle.png")
            || url.contains("/no-image.")
            || url.contains("/placeholder.")
            || url.ends_with("/0-1.jpg")
    }

    /// Whether `url` is a known or pattern-matched placeholder
    ///
    /// A pattern match is remembered.
    pub fn is_placeholder(&self, url: &str) -> bool {
        if let Some(loaded) = self.lock().status.get(url) {
            return !loaded;
        }

        if Self::matches_placeholder_pattern(url) {
            self.mark_placeholder(url);
            return true;
        }
        false
    }

    pub fn mark_placeholder(&self, url: &str) {
        self.insert(url, false);
    }

    pub fn mark_loaded(&self, url: &str) {
        self.insert(url, true);
    }

    pub fn len(&self) -> usize {
        self.lock().status.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.status.clear();
        state.order.clear();
    }

    fn insert(&self, url: &str, loaded: bool) {
        let mut state = self.lock();
        if let Some(existing) = state.status.get_mut(url) {
            *existing = loaded;
            return;
        }

        while state.status.len() >= self.capacity {
            match state.order.pop_front() {
                Some(oldest) => {
                    debug!("Evicting placeholder record for url={}", oldest);
                    state.status.remove(&oldest);
                }
                None => break,
            }
        }

        state.status.insert(url.to_string(), loaded);
        state.order.push_back(url.to_string());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
