//! Per-track play/skip statistics with JSON-file persistence.
//!
//! Stats are the only catalog state that survives a restart. The store is
//! loaded once at engine startup and written back by the engine shutdown
//! closure when a stats file is configured.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Lower clamp applied after a rating update.
pub const RATING_MIN: f64 = 0.1;
/// Upper clamp applied after a rating update.
pub const RATING_MAX: f64 = 10.0;

/// Multiplier applied on a completed play.
const PLAY_FACTOR: f64 = 1.1;
/// Multiplier applied on a skip.
const SKIP_FACTOR: f64 = 0.9;

/// Persistent counters for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackStat {
    pub track_id: String,
    pub play_count: u32,
    pub skip_count: u32,
    pub rating: f64,
}

impl TrackStat {
    fn new(track_id: String) -> Self {
        Self {
            track_id,
            play_count: 0,
            skip_count: 0,
            rating: 1.0,
        }
    }
}

/// In-memory stats map plus its backing file.
///
/// Owned by the engine thread; no interior locking.
pub struct TrackStatsStore {
    stats: HashMap<String, TrackStat>,
    path: Option<PathBuf>,
}

impl TrackStatsStore {
    /// Loads stats from `path`, or starts empty when no path is
    /// configured or the file does not exist yet.
    ///
    /// A file that exists but fails to parse is logged and treated as
    /// empty rather than aborting startup.
    #[must_use]
    pub fn load(path: Option<PathBuf>) -> Self {
        let stats = match &path {
            Some(p) if p.exists() => match Self::read_file(p) {
                Ok(stats) => {
                    tracing::info!(file = %p.display(), entries = stats.len(), "loaded track stats");
                    stats
                }
                Err(err) => {
                    tracing::error!(file = %p.display(), %err, "failed to load track stats");
                    HashMap::new()
                }
            },
            _ => HashMap::new(),
        };

        Self { stats, path }
    }

    fn read_file(path: &Path) -> Result<HashMap<String, TrackStat>, std::io::Error> {
        let data = std::fs::read(path)?;
        let entries: Vec<TrackStat> = serde_json::from_slice(&data)?;
        Ok(entries
            .into_iter()
            .map(|stat| (stat.track_id.clone(), stat))
            .collect())
    }

    /// Writes the stats back as a JSON array, if a path is configured.
    pub fn save(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let mut entries: Vec<&TrackStat> = self.stats.values().collect();
        entries.sort_by(|a, b| a.track_id.cmp(&b.track_id));

        match serde_json::to_vec_pretty(&entries)
            .map_err(std::io::Error::other)
            .and_then(|data| std::fs::write(path, data))
        {
            Ok(()) => {
                tracing::info!(file = %path.display(), entries = entries.len(), "saved track stats");
            }
            Err(err) => {
                tracing::error!(file = %path.display(), %err, "failed to save track stats");
            }
        }
    }

    /// Records a completed play and returns the updated rating.
    pub fn increase_play_count(&mut self, track_id: &str) -> f64 {
        let stat = self.entry(track_id);
        stat.play_count += 1;
        stat.rating = (stat.rating * PLAY_FACTOR).clamp(RATING_MIN, RATING_MAX);
        stat.rating
    }

    /// Records a skip and returns the updated rating.
    pub fn increase_skip_count(&mut self, track_id: &str) -> f64 {
        let stat = self.entry(track_id);
        stat.skip_count += 1;
        stat.rating = (stat.rating * SKIP_FACTOR).clamp(RATING_MIN, RATING_MAX);
        stat.rating
    }

    /// Looks up the stat entry for a track, if any.
    #[must_use]
    pub fn get(&self, track_id: &str) -> Option<&TrackStat> {
        self.stats.get(track_id)
    }

    /// Number of tracked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    /// Whether the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    fn entry(&mut self, track_id: &str) -> &mut TrackStat {
        self.stats
            .entry(track_id.to_string())
            .or_insert_with(|| TrackStat::new(track_id.to_string()))
    }
}
