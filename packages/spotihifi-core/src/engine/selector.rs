//! Continued-playback track selection.
//!
//! Once the explicit play queue drains, the engine keeps playback going
//! from a short shuffled queue of catalog tracks matching the active
//! filter. The queue is topped up on engine idle ticks and whenever it
//! runs low, so the next pick is always cheap.

use std::collections::VecDeque;

use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::catalog::Catalog;

/// Target queue length after a refill.
const TARGET_LEN: usize = 5;
/// Queue length at or below which a refill kicks in.
const REFILL_THRESHOLD: usize = 1;

/// Which catalog subset feeds continued playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackFilter {
    /// Every track in the catalog.
    All,
    /// Tracks belonging to the named playlist.
    Playlist(String),
    /// Tracks still carrying the unrated sentinel.
    Unrated,
}

/// Shuffle queue over the filtered catalog subset.
pub struct TrackSelector {
    filter: TrackFilter,
    queue: VecDeque<String>,
}

impl TrackSelector {
    /// Creates a selector over the full catalog with an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filter: TrackFilter::All,
            queue: VecDeque::new(),
        }
    }

    /// Active filter.
    #[must_use]
    pub fn filter(&self) -> &TrackFilter {
        &self.filter
    }

    /// Replaces the filter, clearing any queued picks.
    ///
    /// The caller forces a refill afterwards so the queue only ever holds
    /// ids matching the current filter.
    pub fn set_filter(&mut self, filter: TrackFilter) {
        tracing::info!(?filter, "continued playback filter changed");
        self.filter = filter;
        self.queue.clear();
    }

    /// Tops the queue up from the catalog when it has run low.
    ///
    /// Candidates are shuffled with an OS-seeded PRNG and pushed until the
    /// queue reaches its target length or the candidates run out.
    pub fn refill(&mut self, catalog: &Catalog) {
        if self.queue.len() > REFILL_THRESHOLD {
            return;
        }

        let mut candidates: Vec<String> = match &self.filter {
            TrackFilter::All => catalog.track_ids().map(str::to_string).collect(),
            TrackFilter::Playlist(name) => {
                catalog.ids_in_playlist(name).map(str::to_string).collect()
            }
            TrackFilter::Unrated => catalog.unrated_ids().map(str::to_string).collect(),
        };

        if candidates.is_empty() {
            return;
        }

        candidates.shuffle(&mut thread_rng());

        for id in candidates {
            if self.queue.len() >= TARGET_LEN {
                break;
            }
            self.queue.push_back(id);
        }
    }

    /// Pops the next pick.
    pub fn next(&mut self) -> Option<String> {
        self.queue.pop_front()
    }

    /// Queued picks remaining.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no picks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for TrackSelector {
    fn default() -> Self {
        Self::new()
    }
}
