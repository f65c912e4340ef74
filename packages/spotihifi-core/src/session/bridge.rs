//! The fixed callback surface handed to the session driver.
//!
//! The service library calls in from arbitrary internal threads. Every
//! callback is thunked onto the engine command queue so the engine thread
//! stays the single owner of session and catalog state, with two
//! latency-sensitive exceptions that run on the caller's thread:
//!
//! - `music_delivery` forwards PCM straight to the audio sink's own
//!   command queue (or discards it when no track is playing)
//! - `audio_buffer_stats` reads the sink's queued-frame counter
//!
//! Those two touch nothing but the atomic `track_playing` flag and the
//! shared sink slot.

use std::sync::Arc;

use crate::engine::{EngineCommand, EngineShared};
use crate::session::{PlaylistHandle, TrackMeta};
use crate::sync::CommandQueue;

/// Clonable callback handle owned by the session driver.
#[derive(Clone)]
pub struct SessionCallbacks {
    queue: Arc<CommandQueue<EngineCommand>>,
    shared: Arc<EngineShared>,
}

impl SessionCallbacks {
    pub(crate) fn new(queue: Arc<CommandQueue<EngineCommand>>, shared: Arc<EngineShared>) -> Self {
        Self { queue, shared }
    }

    /// Login attempt finished.
    pub fn logged_in(&self, ok: bool) {
        self.queue.push(Box::new(move |core| core.logged_in(ok)));
    }

    /// Session was logged out.
    pub fn logged_out(&self) {
        tracing::info!("session logged out");
    }

    /// The library lost its connection.
    pub fn connection_error(&self, message: &str) {
        tracing::error!(message, "session connection error");
    }

    /// The service wants to show a message to the user.
    pub fn message_to_user(&self, message: &str) {
        tracing::info!(message, "message from service");
    }

    /// The library asks to have its event pump run on the owning thread.
    pub fn notify_main_thread(&self) {
        self.queue.push(Box::new(|core| core.process_session_events()));
    }

    /// PCM frame batch from the library's decoder thread.
    ///
    /// Returns the number of frames consumed. Frames arriving while no
    /// track is playing are reported consumed and dropped; this path
    /// never creates a sink.
    pub fn music_delivery(&self, samples: &[i16]) -> usize {
        let num_frames = samples.len() / usize::from(crate::audio::CHANNELS);

        if !self.shared.track_playing() {
            tracing::warn!(num_frames, "music delivery while not playing");
            return num_frames;
        }

        match self.shared.sink() {
            Some(sink) => {
                sink.write_pcm(samples);
                num_frames
            }
            None => {
                tracing::warn!(num_frames, "music delivery with no audio sink");
                num_frames
            }
        }
    }

    /// Playback was interrupted because the account is in use elsewhere.
    pub fn play_token_lost(&self) {
        tracing::info!("play token lost");
    }

    /// Log line from inside the library.
    pub fn log_message(&self, message: &str) {
        tracing::debug!(target: "spotihifi::session", "{}", message.trim_end());
    }

    /// The current track played to its end.
    pub fn end_of_track(&self) {
        self.queue.push(Box::new(|core| core.end_of_track()));
    }

    /// A streaming error occurred; the library will retry by itself.
    pub fn stream_error(&self, message: &str) {
        tracing::error!(message, "stream error");
    }

    /// The library confirmed that audio playback started.
    ///
    /// This is what moves the track state machine into `playing` and
    /// publishes the `playing` event; the engine's own play call does
    /// not.
    pub fn start_playback(&self) {
        self.queue.push(Box::new(|core| core.playback_started()));
    }

    /// The library paused or stopped its audio output.
    pub fn stop_playback(&self) {
        tracing::debug!("service stopped playback");
    }

    /// Queued-frame count the library uses to throttle its decoder.
    #[must_use]
    pub fn audio_buffer_stats(&self) -> i64 {
        self.shared.sink().map_or(0, |sink| sink.queued_frames())
    }

    /// Metadata finished loading for one or more tracks.
    pub fn metadata_updated(&self) {
        self.queue.push(Box::new(|core| core.metadata_updated()));
    }

    /// A playlist appeared in the user's container.
    pub fn playlist_added(&self, handle: PlaylistHandle) {
        self.queue
            .push(Box::new(move |core| core.import_playlist(handle)));
    }

    /// The playlist container finished loading.
    pub fn container_loaded(&self, handles: Vec<PlaylistHandle>) {
        tracing::info!(playlists = handles.len(), "playlist container loaded");
        for handle in handles {
            self.queue
                .push(Box::new(move |core| core.import_playlist(handle)));
        }
    }

    /// Tracks were inserted into a playlist at `position`.
    pub fn playlist_tracks_added(&self, playlist: String, tracks: Vec<TrackMeta>, position: usize) {
        self.queue.push(Box::new(move |core| {
            core.playlist_tracks_added(&playlist, &tracks, position);
        }));
    }

    /// Playlist entries at `positions` were removed.
    pub fn playlist_tracks_removed(&self, playlist: String, positions: Vec<usize>) {
        self.queue.push(Box::new(move |core| {
            core.playlist_tracks_removed(&playlist, &positions);
        }));
    }

    /// A previously requested image finished loading.
    pub fn image_loaded(&self, image_id: String) {
        self.queue
            .push(Box::new(move |core| core.image_loaded(&image_id)));
    }
}
