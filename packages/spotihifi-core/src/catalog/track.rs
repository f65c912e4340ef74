//! Track metadata as mirrored from the streaming service.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::session::TrackMeta;

/// Rating sentinel for tracks that have never been played or skipped.
pub const UNRATED: f64 = -1.0;

fn unrated() -> f64 {
    UNRATED
}

/// One track in the catalog.
///
/// The wire payload (responses and `pb-event` notifications) carries every
/// field except `rating`, which is client-invisible and only feeds the
/// continued-playback selector. `playlists` is a sorted set so serialized
/// payloads are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: String,
    pub title: String,
    pub track_number: u32,
    /// Track length in milliseconds; the wire name is plain `duration`.
    #[serde(rename = "duration")]
    pub duration_ms: u32,
    pub artist: String,
    pub album: String,
    pub album_id: String,
    pub playlists: BTreeSet<String>,
    #[serde(skip_serializing, default = "unrated")]
    pub rating: f64,
}

impl Track {
    /// Builds a catalog entry from imported session metadata.
    ///
    /// The new entry starts with an empty playlist set and the unrated
    /// sentinel; the catalog fills in membership during import.
    #[must_use]
    pub fn from_meta(meta: &TrackMeta) -> Self {
        Self {
            track_id: meta.track_id.clone(),
            title: meta.title.clone(),
            track_number: meta.track_number,
            duration_ms: meta.duration_ms,
            artist: meta.artist.clone(),
            album: meta.album.clone(),
            album_id: meta.album_id.clone(),
            playlists: BTreeSet::new(),
            rating: UNRATED,
        }
    }

    /// Refreshes the metadata fields from the service without touching
    /// playlist membership or rating.
    pub fn update_meta(&mut self, meta: &TrackMeta) {
        self.title = meta.title.clone();
        self.track_number = meta.track_number;
        self.duration_ms = meta.duration_ms;
        self.artist = meta.artist.clone();
        self.album = meta.album.clone();
        self.album_id = meta.album_id.clone();
    }
}
