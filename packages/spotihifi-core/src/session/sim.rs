//! In-process session driver.
//!
//! `SimSession` implements the full [`SessionDriver`] contract against a
//! scripted library instead of the real streaming service. The headless
//! binary runs on it out of the box (in realtime mode it spawns a feeder
//! thread that delivers PCM batches and honors the buffer-stats
//! back-pressure, exactly like the service library's decoder thread), and
//! the engine tests use the paired [`SimSessionHandle`] to fire callbacks
//! at controlled points.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::audio::{CHANNELS, SAMPLE_RATE};

use super::{
    CoverResolution, ImageState, PlaylistHandle, PlaylistSnapshot, SessionCallbacks,
    SessionConfig, SessionDriver, SessionError, TrackLoad, TrackMeta,
};

/// Frames per simulated delivery batch.
const BATCH_FRAMES: usize = 2048;
/// Queued frames above which the feeder backs off, mirroring the service
/// decoder's throttle on the buffer-stats callback.
const BACKPRESSURE_FRAMES: i64 = SAMPLE_RATE as i64;

/// One scripted playlist.
pub struct SimPlaylist {
    /// Service-side name; empty means the starred list.
    pub name: String,
    pub tracks: Vec<TrackMeta>,
    /// Snapshot polls that report "still loading" before the playlist
    /// materializes; exercises the import retry path.
    pub load_polls: u32,
}

/// Scripted service content and behavior.
#[derive(Default)]
pub struct SimLibrary {
    /// Playlists by handle; index 0 is the starred list.
    pub playlists: Vec<SimPlaylist>,
    /// Cover id to image bytes.
    pub covers: HashMap<String, Bytes>,
    /// Images that stay in `Loading` state until completed via the handle.
    pub loading_images: HashSet<String>,
    /// Cover ids whose album has not been browsed yet.
    pub unloaded_albums: HashSet<String>,
    /// Track ids that load asynchronously (a metadata-updated callback
    /// has to be fired to complete them).
    pub deferred_loads: HashSet<String>,
    /// Suppress the automatic start-of-playback confirmation on `play`;
    /// the test fires it through the handle instead.
    pub manual_start_confirmation: bool,
    /// Refuse the next login attempt.
    pub reject_login: bool,
    /// Fail session creation with this message.
    pub connect_error: Option<String>,
}

struct CurrentTrack {
    track_id: String,
    duration_ms: u32,
    loaded: bool,
    playing: bool,
    delivered_frames: u64,
}

struct SimState {
    callbacks: Option<SessionCallbacks>,
    library: SimLibrary,
    pending_polls: Vec<u32>,
    current: Option<CurrentTrack>,
    calls: Vec<String>,
    feeder_running: bool,
}

struct SimInner {
    state: Mutex<SimState>,
}

/// Scripted [`SessionDriver`] implementation.
pub struct SimSession {
    inner: Arc<SimInner>,
    realtime: bool,
}

impl SimSession {
    /// Creates a driver over the given library. Callbacks fire only when
    /// triggered through the [`SimSessionHandle`].
    #[must_use]
    pub fn new(library: SimLibrary) -> Self {
        let pending_polls = library.playlists.iter().map(|pl| pl.load_polls).collect();
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(SimState {
                    callbacks: None,
                    library,
                    pending_polls,
                    current: None,
                    calls: Vec::new(),
                    feeder_running: false,
                }),
            }),
            realtime: false,
        }
    }

    /// Like [`new`](Self::new), but playing tracks spawn a feeder thread
    /// that delivers PCM and ends tracks by itself.
    #[must_use]
    pub fn realtime(library: SimLibrary) -> Self {
        Self {
            realtime: true,
            ..Self::new(library)
        }
    }

    /// A small built-in demo library for running the daemon without any
    /// service integration.
    #[must_use]
    pub fn demo() -> Self {
        fn track(id: &str, number: u32, title: &str) -> TrackMeta {
            TrackMeta {
                track_id: id.to_string(),
                title: title.to_string(),
                track_number: number,
                duration_ms: 30_000,
                artist: "Sim Artist".to_string(),
                album: "Sim Album".to_string(),
                album_id: "sim-album".to_string(),
                available: true,
            }
        }

        let library = SimLibrary {
            playlists: vec![
                SimPlaylist {
                    name: String::new(),
                    tracks: vec![track("sim-1", 1, "First Light"), track("sim-2", 2, "Second Wind")],
                    load_polls: 0,
                },
                SimPlaylist {
                    name: "Demo".to_string(),
                    tracks: vec![track("sim-2", 2, "Second Wind"), track("sim-3", 3, "Third Rail")],
                    load_polls: 0,
                },
            ],
            covers: HashMap::from([(
                "sim-album".to_string(),
                Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]),
            )]),
            ..SimLibrary::default()
        };

        Self::realtime(library)
    }

    /// Control handle for tests and diagnostics.
    #[must_use]
    pub fn handle(&self) -> SimSessionHandle {
        SimSessionHandle {
            inner: self.inner.clone(),
        }
    }

    fn record(&self, call: impl Into<String>) {
        self.inner.state.lock().calls.push(call.into());
    }
}

impl SessionDriver for SimSession {
    fn connect(
        &mut self,
        callbacks: SessionCallbacks,
        config: &SessionConfig,
    ) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock();
        if let Some(message) = state.library.connect_error.take() {
            return Err(SessionError::Create(message));
        }
        tracing::debug!(
            cache_dir = %config.cache_dir.display(),
            bitrate = config.preferred_bitrate_kbps,
            volume_normalization = config.volume_normalization,
            "sim session connected"
        );
        state.callbacks = Some(callbacks);
        Ok(())
    }

    fn login(&mut self, username: &str, _password: &str) {
        self.record(format!("login {username}"));

        let (callbacks, reject, container) = {
            let state = self.inner.state.lock();
            let container: Vec<PlaylistHandle> =
                (1..state.library.playlists.len() as PlaylistHandle).collect();
            (state.callbacks.clone(), state.library.reject_login, container)
        };

        let Some(callbacks) = callbacks else { return };
        if reject {
            callbacks.logged_in(false);
            return;
        }
        callbacks.logged_in(true);
        callbacks.container_loaded(container);
    }

    fn set_scrobbling(&mut self, username: &str, _password: &str) {
        self.record(format!("set_scrobbling {username}"));
    }

    fn process_events(&mut self) -> Duration {
        Duration::from_millis(100)
    }

    fn load_track(&mut self, uri: &str) -> TrackLoad {
        self.record(format!("load_track {uri}"));

        let Some(track_id) = uri.strip_prefix("spotify:track:") else {
            return TrackLoad::NotATrack;
        };

        let mut state = self.inner.state.lock();
        let duration_ms = state
            .library
            .playlists
            .iter()
            .flat_map(|pl| pl.tracks.iter())
            .find(|meta| meta.track_id == track_id)
            .map_or(30_000, |meta| meta.duration_ms);
        let deferred = state.library.deferred_loads.contains(track_id);

        state.current = Some(CurrentTrack {
            track_id: track_id.to_string(),
            duration_ms,
            loaded: !deferred,
            playing: false,
            delivered_frames: 0,
        });

        if deferred {
            TrackLoad::Loading
        } else {
            TrackLoad::Loaded
        }
    }

    fn current_track_loaded(&self) -> bool {
        self.inner
            .state
            .lock()
            .current
            .as_ref()
            .is_some_and(|current| current.loaded)
    }

    fn load_current(&mut self) -> Result<(), SessionError> {
        self.record("load_current");
        Ok(())
    }

    fn play(&mut self, on: bool) -> Result<(), SessionError> {
        self.record(format!("play {on}"));

        let (callbacks, confirm, spawn_feeder) = {
            let mut state = self.inner.state.lock();
            let confirm = !state.library.manual_start_confirmation;
            let Some(current) = state.current.as_mut() else {
                return Err(SessionError::Call("play without a loaded track".to_string()));
            };
            current.playing = on;

            let spawn = on && self.realtime && !state.feeder_running;
            if spawn {
                state.feeder_running = true;
            }
            (state.callbacks.clone(), confirm, spawn)
        };

        if let Some(callbacks) = callbacks {
            if on && confirm {
                callbacks.start_playback();
            } else if !on {
                callbacks.stop_playback();
            }
        }
        if spawn_feeder {
            run_feeder(self.inner.clone());
        }
        Ok(())
    }

    fn unload(&mut self) {
        self.record("unload");
        if let Some(current) = self.inner.state.lock().current.as_mut() {
            current.playing = false;
        }
    }

    fn release_track(&mut self) {
        self.record("release_track");
        self.inner.state.lock().current = None;
    }

    fn starred_playlist(&mut self) -> PlaylistHandle {
        0
    }

    fn playlist_snapshot(&mut self, handle: PlaylistHandle) -> Option<PlaylistSnapshot> {
        let mut state = self.inner.state.lock();

        if let Some(polls) = state.pending_polls.get_mut(handle as usize) {
            if *polls > 0 {
                *polls -= 1;
                return None;
            }
        }

        match state.library.playlists.get(handle as usize) {
            Some(playlist) => Some(PlaylistSnapshot {
                name: playlist.name.clone(),
                tracks: playlist.tracks.clone(),
            }),
            // Unknown handles materialize as an empty starred list so an
            // import against them terminates.
            None => Some(PlaylistSnapshot {
                name: String::new(),
                tracks: Vec::new(),
            }),
        }
    }

    fn resolve_cover(&mut self, track_id: &str, cover_id: &str) -> CoverResolution {
        self.record(format!("resolve_cover {track_id} {cover_id}"));

        let state = self.inner.state.lock();
        if state.library.unloaded_albums.contains(cover_id) {
            // A real driver kicks off an album browse here.
            return CoverResolution::AlbumNotLoaded;
        }
        if state.library.covers.contains_key(cover_id)
            || state.library.loading_images.contains(cover_id)
        {
            return CoverResolution::Image(cover_id.to_string());
        }
        CoverResolution::Invalid(format!("unknown cover {cover_id}"))
    }

    fn request_image(&mut self, image_id: &str) -> ImageState {
        let state = self.inner.state.lock();
        if state.library.loading_images.contains(image_id) {
            return ImageState::Loading;
        }
        match state.library.covers.get(image_id) {
            Some(bytes) => ImageState::Loaded(bytes.clone()),
            None => ImageState::Failed(format!("no such image {image_id}")),
        }
    }
}

/// Test/diagnostic control surface over a [`SimSession`].
#[derive(Clone)]
pub struct SimSessionHandle {
    inner: Arc<SimInner>,
}

impl SimSessionHandle {
    fn callbacks(&self) -> Option<SessionCallbacks> {
        self.inner.state.lock().callbacks.clone()
    }

    /// Fires the end-of-track callback for the current track.
    pub fn finish_current_track(&self) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.end_of_track();
        }
    }

    /// Fires the start-of-playback confirmation callback; used with
    /// `manual_start_confirmation` libraries.
    pub fn confirm_start_playback(&self) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.start_playback();
        }
    }

    /// Marks a deferred track as loaded and fires metadata-updated.
    pub fn fire_metadata_updated(&self) {
        {
            let mut state = self.inner.state.lock();
            if let Some(current) = state.current.as_mut() {
                current.loaded = true;
            }
        }
        if let Some(callbacks) = self.callbacks() {
            callbacks.metadata_updated();
        }
    }

    /// Finishes loading an image and fires the image-loaded callback.
    pub fn complete_image(&self, image_id: &str) {
        self.inner.state.lock().library.loading_images.remove(image_id);
        if let Some(callbacks) = self.callbacks() {
            callbacks.image_loaded(image_id.to_string());
        }
    }

    /// Delivers a batch of silent frames as the service decoder would.
    /// Returns the number of frames the delivery callback consumed.
    pub fn deliver_pcm(&self, frames: usize) -> usize {
        let Some(callbacks) = self.callbacks() else {
            return 0;
        };
        let samples = vec![0i16; frames * usize::from(CHANNELS)];
        callbacks.music_delivery(&samples)
    }

    /// Reads the sink back-pressure counter through the callback surface.
    #[must_use]
    pub fn buffer_stats(&self) -> i64 {
        self.callbacks().map_or(0, |callbacks| callbacks.audio_buffer_stats())
    }

    /// Fires a playlist tracks-added callback.
    pub fn push_tracks_added(&self, playlist: &str, tracks: Vec<TrackMeta>, position: usize) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.playlist_tracks_added(playlist.to_string(), tracks, position);
        }
    }

    /// Fires a playlist tracks-removed callback.
    pub fn push_tracks_removed(&self, playlist: &str, positions: Vec<usize>) {
        if let Some(callbacks) = self.callbacks() {
            callbacks.playlist_tracks_removed(playlist.to_string(), positions);
        }
    }

    /// Driver calls recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.inner.state.lock().calls.clone()
    }
}

/// Feeder thread: delivers PCM while the current track plays, throttled
/// by the buffer-stats callback, and fires end-of-track when the track's
/// frame budget is spent.
fn run_feeder(inner: Arc<SimInner>) {
    enum Step {
        Deliver,
        Finish,
        Stop,
    }

    std::thread::Builder::new()
        .name("sim-session-feeder".to_string())
        .spawn(move || {
            let silence = vec![0i16; BATCH_FRAMES * usize::from(CHANNELS)];

            loop {
                let Some(callbacks) = inner.state.lock().callbacks.clone() else {
                    break;
                };

                if callbacks.audio_buffer_stats() > BACKPRESSURE_FRAMES {
                    std::thread::sleep(Duration::from_millis(20));
                    continue;
                }

                let step = {
                    let mut state = inner.state.lock();
                    match state.current.as_mut() {
                        Some(current) if current.playing => {
                            let total_frames = u64::from(current.duration_ms)
                                * u64::from(SAMPLE_RATE)
                                / 1000;
                            if current.delivered_frames >= total_frames {
                                state.feeder_running = false;
                                Step::Finish
                            } else {
                                current.delivered_frames += BATCH_FRAMES as u64;
                                Step::Deliver
                            }
                        }
                        _ => {
                            state.feeder_running = false;
                            Step::Stop
                        }
                    }
                };

                match step {
                    Step::Deliver => {
                        callbacks.music_delivery(&silence);
                    }
                    Step::Finish => {
                        callbacks.end_of_track();
                        break;
                    }
                    Step::Stop => break,
                }
            }
        })
        .expect("failed to spawn sim feeder thread");
}
