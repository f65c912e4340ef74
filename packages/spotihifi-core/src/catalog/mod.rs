//! In-memory catalog of tracks and playlists.
//!
//! The track map is the arena: every playlist is an ordered vector of
//! track ids pointing into it, and every track carries the set of
//! playlist names that currently reference it. Keeping name strings on
//! the track side and id references on the playlist side breaks the
//! track/playlist cycle without weak pointers.
//!
//! All mutation happens on the engine thread; the catalog itself has no
//! interior locking.

pub mod stats;
mod track;

use std::collections::HashMap;

use serde::Serialize;

use crate::session::TrackMeta;

pub use stats::{TrackStat, TrackStatsStore, RATING_MAX, RATING_MIN};
pub use track::{Track, UNRATED};

/// Result of a `sync` request against the catalog.
///
/// Version counters travel as strings on the wire; `tracks` is present
/// only when the client's incarnation does not match ours.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSnapshot {
    pub incarnation: String,
    pub transaction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<Track>>,
}

/// Track and playlist state mirrored from the streaming service.
pub struct Catalog {
    tracks: HashMap<String, Track>,
    playlists: HashMap<String, Vec<String>>,
    /// Process-unique token identifying this in-memory catalog instance.
    incarnation: i64,
    /// Mutation version within one incarnation. The sync protocol runs in
    /// full-snapshot mode, so this stays at zero; it is parsed and echoed
    /// so clients already speak the delta wire shape.
    transaction: i64,
}

impl Catalog {
    /// Creates an empty catalog under the given incarnation token.
    #[must_use]
    pub fn new(incarnation: i64) -> Self {
        Self {
            tracks: HashMap::new(),
            playlists: HashMap::new(),
            incarnation,
            transaction: 0,
        }
    }

    /// The incarnation token of this catalog instance.
    #[must_use]
    pub fn incarnation(&self) -> i64 {
        self.incarnation
    }

    /// Looks up a track by id.
    #[must_use]
    pub fn get(&self, track_id: &str) -> Option<&Track> {
        self.tracks.get(track_id)
    }

    /// Number of tracks in the catalog.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    /// Whether the catalog holds no tracks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Whether a playlist with this name exists.
    #[must_use]
    pub fn has_playlist(&self, name: &str) -> bool {
        self.playlists.contains_key(name)
    }

    /// Ids of every track, in unspecified order.
    pub fn track_ids(&self) -> impl Iterator<Item = &str> {
        self.tracks.keys().map(String::as_str)
    }

    /// Ids of the tracks that belong to the named playlist.
    pub fn ids_in_playlist<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.tracks
            .values()
            .filter(move |track| track.playlists.contains(name))
            .map(|track| track.track_id.as_str())
    }

    /// Ids of tracks still carrying the unrated sentinel.
    pub fn unrated_ids(&self) -> impl Iterator<Item = &str> {
        self.tracks
            .values()
            .filter(|track| track.rating == UNRATED)
            .map(|track| track.track_id.as_str())
    }

    /// Answers a `sync` request.
    ///
    /// A mismatched (or absent) client incarnation returns the complete
    /// track list; a match returns the version counters alone. The track
    /// list is sorted by id so identical catalogs serialize identically.
    #[must_use]
    pub fn sync(&self, client_incarnation: Option<i64>, _client_transaction: Option<i64>) -> SyncSnapshot {
        let tracks = if client_incarnation == Some(self.incarnation) {
            None
        } else {
            let mut all: Vec<Track> = self.tracks.values().cloned().collect();
            all.sort_by(|a, b| a.track_id.cmp(&b.track_id));
            Some(all)
        };

        SyncSnapshot {
            incarnation: self.incarnation.to_string(),
            transaction: self.transaction.to_string(),
            tracks,
        }
    }

    /// Materializes a fully loaded playlist snapshot.
    ///
    /// Unavailable tracks are logged and skipped: they enter neither the
    /// track map nor the playlist vector. Tracks already known from other
    /// playlists gain this playlist in their membership set and have
    /// their metadata refreshed. Re-importing a playlist replaces its
    /// vector and drops membership from tracks no longer present.
    pub fn import_playlist(&mut self, name: &str, entries: &[TrackMeta]) {
        let mut ordered = Vec::with_capacity(entries.len());

        for meta in entries {
            if !meta.available {
                tracing::warn!(track_id = %meta.track_id, title = %meta.title, "track unavailable");
                continue;
            }

            let track = self
                .tracks
                .entry(meta.track_id.clone())
                .or_insert_with(|| Track::from_meta(meta));
            track.update_meta(meta);
            track.playlists.insert(name.to_string());
            ordered.push(meta.track_id.clone());
        }

        if let Some(previous) = self.playlists.insert(name.to_string(), ordered) {
            self.drop_stale_membership(name, &previous);
        }

        tracing::info!(
            playlist = name,
            tracks = self.tracks.len(),
            "imported playlist"
        );
    }

    /// Inserts tracks into a playlist at `position`, merging membership
    /// into already-known entries.
    pub fn playlist_tracks_added(&mut self, name: &str, added: &[TrackMeta], position: usize) {
        let playlist = self.playlists.entry(name.to_string()).or_default();
        let position = position.min(playlist.len());

        let mut ids = Vec::with_capacity(added.len());
        for meta in added {
            let track = self
                .tracks
                .entry(meta.track_id.clone())
                .or_insert_with(|| Track::from_meta(meta));
            track.update_meta(meta);
            track.playlists.insert(name.to_string());
            ids.push(meta.track_id.clone());
            tracing::info!(track_id = %meta.track_id, playlist = name, "added track");
        }

        playlist.splice(position..position, ids);
    }

    /// Removes playlist entries at the given positions, applied in the
    /// order supplied by the service. Out-of-range positions are logged
    /// and skipped.
    ///
    /// Membership is erased from a removed track only when no other
    /// occurrence of it remains in the playlist.
    pub fn playlist_tracks_removed(&mut self, name: &str, positions: &[usize]) {
        let Some(playlist) = self.playlists.get_mut(name) else {
            tracing::warn!(playlist = name, "remove from unknown playlist");
            return;
        };

        for &position in positions {
            if position >= playlist.len() {
                tracing::warn!(playlist = name, position, len = playlist.len(), "remove position out of range");
                continue;
            }

            let track_id = playlist.remove(position);
            if !playlist.contains(&track_id) {
                if let Some(track) = self.tracks.get_mut(&track_id) {
                    track.playlists.remove(name);
                }
            }
            tracing::info!(track_id = %track_id, playlist = name, "removed track");
        }
    }

    /// Updates the rating field mirrored onto a track.
    pub fn set_rating(&mut self, track_id: &str, rating: f64) {
        if let Some(track) = self.tracks.get_mut(track_id) {
            track.rating = rating;
        }
    }

    fn drop_stale_membership(&mut self, name: &str, previous: &[String]) {
        let current = &self.playlists[name];
        for track_id in previous {
            if current.contains(track_id) {
                continue;
            }
            if let Some(track) = self.tracks.get_mut(track_id) {
                track.playlists.remove(name);
            }
        }
    }

    /// Checks the track/playlist cross-reference invariant; test support.
    #[cfg(test)]
    fn assert_membership_consistent(&self) {
        for track in self.tracks.values() {
            for name in &track.playlists {
                let playlist = self
                    .playlists
                    .get(name)
                    .unwrap_or_else(|| panic!("playlist {name} missing for {}", track.track_id));
                assert!(
                    playlist.contains(&track.track_id),
                    "{} claims membership of {name} but is not in it",
                    track.track_id
                );
            }
        }
        for (name, playlist) in &self.playlists {
            for track_id in playlist {
                let track = &self.tracks[track_id];
                assert!(
                    track.playlists.contains(name),
                    "{track_id} is in {name} but does not claim membership"
                );
            }
        }
    }
}
