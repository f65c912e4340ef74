//! Playback orchestration engine.
//!
//! One dedicated engine thread owns the streaming-service session, the
//! track catalog, the play queue and the observer list. Every public
//! operation pushes a closure onto the engine command queue and returns;
//! result-bearing operations hand back a oneshot receiver that the engine
//! thread fulfills. Service callbacks re-enter through the same queue
//! (see [`crate::session::bridge`]), so all session state is mutated from
//! exactly one thread.

pub mod selector;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::audio::AudioSink;
use crate::catalog::{Catalog, SyncSnapshot, Track, TrackStatsStore};
use crate::error::SpotihifiResult;
use crate::events::{player_state_event, PlayerObserver, PlayerState};
use crate::session::{
    CoverResolution, ImageState, PlaylistHandle, SessionCallbacks, SessionConfig, SessionDriver,
    TrackLoad, TrackMeta,
};
use crate::sync::CommandQueue;

pub use selector::{TrackFilter, TrackSelector};

/// Bounded wait of the engine loop's queue pop; a timeout runs the idle
/// tick.
const POP_TIMEOUT: Duration = Duration::from_millis(2500);

/// Bitrate requested from the service at session creation.
const PREFERRED_BITRATE_KBPS: u32 = 320;

/// URI prefix formed around continued-playback track ids.
const TRACK_URI_PREFIX: &str = "spotify:track:";

/// Commands executed on the engine thread.
pub(crate) type EngineCommand = Box<dyn FnOnce(&mut EngineCore) + Send>;

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Output device name; `default` selects the system default.
    pub audio_device_name: String,
    /// Service-library cache/settings directory.
    pub cache_dir: PathBuf,
    /// Stats file; stats persistence is disabled when absent.
    pub track_stat_filename: Option<PathBuf>,
    /// Scrobbling credentials, both required to enable scrobbling.
    pub last_fm_username: Option<String>,
    pub last_fm_password: Option<String>,
    /// Whether the service should normalize playback volume.
    pub volume_normalization: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            audio_device_name: "default".to_string(),
            cache_dir: PathBuf::from("spotihifi_cache"),
            track_stat_filename: None,
            last_fm_username: None,
            last_fm_password: None,
            volume_normalization: false,
        }
    }
}

/// Successful `get-cover` payload.
#[derive(Debug, Clone, Serialize)]
pub struct CoverPayload {
    pub track_id: String,
    pub cover_id: String,
    pub image_format: String,
    pub image_data: String,
}

/// Failed `get-cover` outcome; maps to a JSON-RPC error with code -1.
#[derive(Debug, Clone)]
pub struct CoverError {
    pub message: String,
}

/// The cross-thread surface shared with the session callback bridge.
///
/// Exactly two pieces of state leave the engine thread: the atomic
/// `track_playing` flag read by the PCM-delivery path, and the audio-sink
/// slot read by delivery and buffer-stats.
pub struct EngineShared {
    track_playing: AtomicBool,
    sink: Mutex<Option<Arc<AudioSink>>>,
}

impl EngineShared {
    fn new() -> Self {
        Self {
            track_playing: AtomicBool::new(false),
            sink: Mutex::new(None),
        }
    }

    /// Whether a track is currently loaded and confirmed playing.
    #[must_use]
    pub fn track_playing(&self) -> bool {
        self.track_playing.load(Ordering::Acquire)
    }

    fn set_track_playing(&self, playing: bool) {
        self.track_playing.store(playing, Ordering::Release);
    }

    /// Clone of the current audio sink, if one exists.
    #[must_use]
    pub fn sink(&self) -> Option<Arc<AudioSink>> {
        self.sink.lock().clone()
    }

    fn set_sink(&self, sink: Arc<AudioSink>) {
        *self.sink.lock() = Some(sink);
    }

    fn take_sink(&self) -> Option<Arc<AudioSink>> {
        self.sink.lock().take()
    }
}

/// Track state machine driven exclusively by the engine thread.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TrackState {
    NoTrack,
    Loading { track_id: String },
    Playing { track_id: String },
    Paused { track_id: String },
}

impl TrackState {
    fn track_id(&self) -> Option<&str> {
        match self {
            Self::NoTrack => None,
            Self::Loading { track_id } | Self::Playing { track_id } | Self::Paused { track_id } => {
                Some(track_id)
            }
        }
    }
}

/// Public handle to the playback engine.
///
/// Cheap to share behind an `Arc`; dropping the last handle shuts the
/// engine down and joins its thread.
pub struct PlayerEngine {
    queue: Arc<CommandQueue<EngineCommand>>,
    shared: Arc<EngineShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlayerEngine {
    /// Connects the session driver and starts the engine thread.
    ///
    /// # Errors
    ///
    /// Session creation failures (including bitrate and
    /// volume-normalization setup) are fatal and surface here.
    pub fn start(
        mut driver: Box<dyn SessionDriver>,
        config: EngineConfig,
    ) -> SpotihifiResult<Self> {
        let queue: Arc<CommandQueue<EngineCommand>> = Arc::new(CommandQueue::new());
        let shared = Arc::new(EngineShared::new());

        let session_config = SessionConfig {
            cache_dir: config.cache_dir.clone(),
            preferred_bitrate_kbps: PREFERRED_BITRATE_KBPS,
            volume_normalization: config.volume_normalization,
        };
        driver.connect(SessionCallbacks::new(queue.clone(), shared.clone()), &session_config)?;

        let incarnation = boot_incarnation();
        tracing::debug!(incarnation, "starting playback engine");

        let worker = {
            let queue = queue.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("player-engine".to_string())
                .spawn(move || {
                    EngineCore::new(driver, config, queue, shared, incarnation).run();
                })
                .expect("failed to spawn engine thread")
        };

        Ok(Self {
            queue,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Initiates session login.
    pub fn login(&self, username: &str, password: &str) {
        let username = username.to_string();
        let password = password.to_string();
        self.push(move |core| core.session.login(&username, &password));
    }

    /// Resumes a paused track or starts the next track from the queues.
    pub fn player_play(&self) {
        self.push(EngineCore::handle_play);
    }

    /// Appends a track URI to the play queue, starting playback if idle.
    pub fn player_play_uri(&self, uri: &str) {
        let uri = uri.to_string();
        self.push(move |core| core.handle_play_uri(uri));
    }

    /// Pauses service playback if a track is loaded.
    pub fn player_pause(&self) {
        self.push(EngineCore::handle_pause);
    }

    /// Unloads the current track, bumps its skip count and advances.
    pub fn player_skip(&self) {
        self.push(EngineCore::handle_skip);
    }

    /// Unloads the current track and drops the audio sink.
    pub fn player_stop(&self) {
        self.push(EngineCore::handle_stop);
    }

    /// Continued playback over the whole catalog.
    pub fn build_track_set_all(&self) {
        self.push(|core| core.handle_build_track_set(TrackFilter::All));
    }

    /// Continued playback over one playlist.
    pub fn build_track_set_from_playlist(&self, playlist: &str) {
        let playlist = playlist.to_string();
        self.push(move |core| core.handle_build_track_set(TrackFilter::Playlist(playlist)));
    }

    /// Continued playback over unrated tracks.
    pub fn build_track_set_unrated(&self) {
        self.push(|core| core.handle_build_track_set(TrackFilter::Unrated));
    }

    /// Catalog snapshot versus the client's version counters.
    pub fn get_tracks(
        &self,
        incarnation: Option<i64>,
        transaction: Option<i64>,
    ) -> oneshot::Receiver<SyncSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.push(move |core| core.handle_get_tracks(incarnation, transaction, tx));
        rx
    }

    /// Fetches album art for a track, base64-encoded.
    pub fn get_cover(
        &self,
        track_id: &str,
        cover_id: &str,
    ) -> oneshot::Receiver<Result<CoverPayload, CoverError>> {
        let (tx, rx) = oneshot::channel();
        let track_id = track_id.to_string();
        let cover_id = cover_id.to_string();
        self.push(move |core| core.handle_get_cover(track_id, cover_id, tx));
        rx
    }

    /// Subscribes an observer; a currently playing track is replayed to
    /// it immediately.
    pub fn observer_attach(&self, observer: Arc<dyn PlayerObserver>) {
        self.push(move |core| core.handle_observer_attach(observer));
    }

    /// Unsubscribes an observer registered with
    /// [`observer_attach`](Self::observer_attach).
    pub fn observer_detach(&self, observer: &Arc<dyn PlayerObserver>) {
        let observer = observer.clone();
        self.push(move |core| core.handle_observer_detach(&observer));
    }

    /// Shuts the engine down: clears playback, saves stats when
    /// configured, stops the engine thread and joins it. Idempotent.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };

        self.push(EngineCore::handle_shutdown);
        if let Err(err) = worker.join() {
            tracing::error!(?err, "engine thread panicked");
        }
    }

    /// Whether a track is currently loaded and confirmed playing.
    #[must_use]
    pub fn track_playing(&self) -> bool {
        self.shared.track_playing()
    }

    fn push(&self, command: impl FnOnce(&mut EngineCore) + Send + 'static) {
        self.queue.push(Box::new(command));
    }
}

impl Drop for PlayerEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Waiter for a cover image that is still loading.
struct PendingCover {
    track_id: String,
    cover_id: String,
    tx: oneshot::Sender<Result<CoverPayload, CoverError>>,
}

/// Engine-thread state; never leaves the engine thread.
pub(crate) struct EngineCore {
    session: Box<dyn SessionDriver>,
    config: EngineConfig,
    queue: Arc<CommandQueue<EngineCommand>>,
    shared: Arc<EngineShared>,
    catalog: Catalog,
    stats: TrackStatsStore,
    selector: TrackSelector,
    observers: Vec<Arc<dyn PlayerObserver>>,
    play_queue: VecDeque<String>,
    track_state: TrackState,
    session_logged_in: bool,
    continued_playback: bool,
    pending_covers: HashMap<String, Vec<PendingCover>>,
    running: bool,
}

impl EngineCore {
    fn new(
        session: Box<dyn SessionDriver>,
        config: EngineConfig,
        queue: Arc<CommandQueue<EngineCommand>>,
        shared: Arc<EngineShared>,
        incarnation: i64,
    ) -> Self {
        let stats = TrackStatsStore::load(config.track_stat_filename.clone());
        Self {
            session,
            config,
            queue,
            shared,
            catalog: Catalog::new(incarnation),
            stats,
            selector: TrackSelector::new(),
            observers: Vec::new(),
            play_queue: VecDeque::new(),
            track_state: TrackState::NoTrack,
            session_logged_in: false,
            continued_playback: true,
            pending_covers: HashMap::new(),
            running: true,
        }
    }

    fn run(mut self) {
        tracing::debug!("engine thread running");

        while self.running {
            match self.queue.pop(POP_TIMEOUT) {
                Some(command) => command(&mut self),
                None => self.idle_tick(),
            }
        }

        tracing::info!("engine releasing session");
        // The driver is dropped with `self`, on the engine thread.
    }

    fn idle_tick(&mut self) {
        if self.session_logged_in && self.continued_playback {
            self.selector.refill(&self.catalog);
        }
    }

    // ─── session callbacks (via the bridge) ─────────────────────────────

    pub(crate) fn logged_in(&mut self, ok: bool) {
        if !ok {
            tracing::error!("session login failed");
            return;
        }

        tracing::info!("session logged in");
        self.session_logged_in = true;

        let starred = self.session.starred_playlist();
        self.import_playlist(starred);

        if let (Some(username), Some(password)) = (
            self.config.last_fm_username.clone(),
            self.config.last_fm_password.clone(),
        ) {
            tracing::info!("enabling last.fm scrobbling");
            self.session.set_scrobbling(&username, &password);
        }
    }

    /// Materializes a playlist once the service has finished loading it.
    ///
    /// While the playlist or any of its tracks is still loading this
    /// re-enqueues itself, yielding the engine thread until the next
    /// poll.
    pub(crate) fn import_playlist(&mut self, handle: PlaylistHandle) {
        match self.session.playlist_snapshot(handle) {
            Some(snapshot) => {
                let name = if snapshot.name.is_empty() {
                    "Starred"
                } else {
                    snapshot.name.as_str()
                };
                self.catalog.import_playlist(name, &snapshot.tracks);
            }
            None => {
                self.queue
                    .push(Box::new(move |core| core.import_playlist(handle)));
            }
        }
    }

    pub(crate) fn playlist_tracks_added(
        &mut self,
        playlist: &str,
        tracks: &[TrackMeta],
        position: usize,
    ) {
        self.catalog.playlist_tracks_added(playlist, tracks, position);
    }

    pub(crate) fn playlist_tracks_removed(&mut self, playlist: &str, positions: &[usize]) {
        self.catalog.playlist_tracks_removed(playlist, positions);
    }

    /// Runs the library event pump until its next-timeout hint becomes
    /// non-zero.
    pub(crate) fn process_session_events(&mut self) {
        loop {
            let next_timeout = self.session.process_events();
            if !next_timeout.is_zero() {
                break;
            }
        }
    }

    pub(crate) fn metadata_updated(&mut self) {
        if matches!(self.track_state, TrackState::Loading { .. })
            && self.session.current_track_loaded()
        {
            self.track_loaded();
        }
    }

    /// The service confirmed audible start of playback; only now does the
    /// state machine enter `playing` and the event go out.
    pub(crate) fn playback_started(&mut self) {
        match self.track_state.clone() {
            TrackState::Loading { track_id } | TrackState::Paused { track_id } => {
                match self.catalog.get(&track_id).cloned() {
                    Some(track) => {
                        tracing::info!(
                            title = %track.title,
                            artist = %track.artist,
                            album = %track.album,
                            "start playing"
                        );
                        self.player_state_notify(PlayerState::Playing, Some(&track));
                    }
                    None => {
                        tracing::error!(%track_id, "track not found in catalog");
                    }
                }
                self.track_state = TrackState::Playing { track_id };
            }
            TrackState::Playing { .. } => {
                tracing::debug!("playback start confirmed while already playing");
            }
            TrackState::NoTrack => {
                tracing::debug!("playback start confirmed with no track");
            }
        }
    }

    pub(crate) fn end_of_track(&mut self) {
        tracing::info!(track_id = ?self.track_state.track_id(), "end of track");

        self.session.unload();
        self.shared.set_track_playing(false);

        if let Some(track_id) = self.track_state.track_id().map(str::to_string) {
            let rating = self.stats.increase_play_count(&track_id);
            self.catalog.set_rating(&track_id, rating);
        }

        self.session.release_track();
        self.track_state = TrackState::NoTrack;

        self.play_next_from_queue();
    }

    pub(crate) fn image_loaded(&mut self, image_id: &str) {
        let Some(waiters) = self.pending_covers.remove(image_id) else {
            return;
        };

        let result = match self.session.request_image(image_id) {
            ImageState::Loaded(bytes) => Ok(bytes),
            ImageState::Failed(message) => Err(message),
            ImageState::Loading => Err("image still loading after load callback".to_string()),
        };

        for waiter in waiters {
            let reply = match &result {
                Ok(bytes) => Ok(CoverPayload {
                    track_id: waiter.track_id,
                    cover_id: waiter.cover_id,
                    image_format: "jpg".to_string(),
                    image_data: BASE64.encode(bytes),
                }),
                Err(message) => Err(CoverError {
                    message: message.clone(),
                }),
            };
            let _ = waiter.tx.send(reply);
        }
    }

    // ─── client operations ──────────────────────────────────────────────

    fn handle_play(&mut self) {
        if !self.session_logged_in {
            tracing::warn!("play before login");
            return;
        }

        match self.track_state {
            TrackState::Playing { .. } | TrackState::Paused { .. } => {
                // The `playing` event follows the service's
                // start-of-playback confirmation, not this call.
                if let Err(err) = self.session.play(true) {
                    tracing::error!(%err, "player play failed");
                }
            }
            TrackState::Loading { .. } => {
                // Playback starts once the track finishes loading.
            }
            TrackState::NoTrack => self.play_next_from_queue(),
        }
    }

    fn handle_play_uri(&mut self, uri: String) {
        self.play_queue.push_back(uri);
        if self.session_logged_in && self.track_state == TrackState::NoTrack {
            self.play_next_from_queue();
        }
    }

    fn handle_pause(&mut self) {
        if !self.session_logged_in {
            return;
        }

        if let TrackState::Playing { track_id } | TrackState::Paused { track_id } =
            self.track_state.clone()
        {
            let track = self.catalog.get(&track_id).cloned();
            self.player_state_notify(PlayerState::Paused, track.as_ref());
            if let Err(err) = self.session.play(false) {
                tracing::error!(%err, "player pause failed");
            }
            self.track_state = TrackState::Paused { track_id };
        }
    }

    fn handle_skip(&mut self) {
        if self.shared.track_playing() {
            let track_id = self.track_state.track_id().map(str::to_string);
            let track = track_id.as_deref().and_then(|id| self.catalog.get(id)).cloned();
            self.player_state_notify(PlayerState::Skip, track.as_ref());

            self.session.unload();
            self.shared.set_track_playing(false);

            if let Some(track_id) = track_id {
                let rating = self.stats.increase_skip_count(&track_id);
                self.catalog.set_rating(&track_id, rating);
            }
        }

        self.session.release_track();
        self.track_state = TrackState::NoTrack;

        self.play_next_from_queue();
    }

    fn handle_stop(&mut self) {
        if self.shared.track_playing() {
            self.player_state_notify(PlayerState::Stopped, None);
            self.session.unload();
            self.shared.set_track_playing(false);
        }

        self.session.release_track();
        self.track_state = TrackState::NoTrack;

        self.drop_sink();
    }

    fn handle_build_track_set(&mut self, filter: TrackFilter) {
        self.selector.set_filter(filter);
        self.selector.refill(&self.catalog);
    }

    fn handle_get_tracks(
        &mut self,
        incarnation: Option<i64>,
        transaction: Option<i64>,
        tx: oneshot::Sender<SyncSnapshot>,
    ) {
        tracing::info!(
            catalog_incarnation = self.catalog.incarnation(),
            client_incarnation = ?incarnation,
            client_transaction = ?transaction,
            "get tracks"
        );
        let _ = tx.send(self.catalog.sync(incarnation, transaction));
    }

    fn handle_get_cover(
        &mut self,
        track_id: String,
        cover_id: String,
        tx: oneshot::Sender<Result<CoverPayload, CoverError>>,
    ) {
        match self.session.resolve_cover(&track_id, &cover_id) {
            CoverResolution::Invalid(message) => {
                let _ = tx.send(Err(CoverError { message }));
            }
            CoverResolution::AlbumNotLoaded => {
                // The driver has kicked off an album browse; the client
                // retries once it has loaded.
                let _ = tx.send(Err(CoverError {
                    message: format!("album for cover {cover_id} not loaded yet, retry"),
                }));
            }
            CoverResolution::Image(image_id) => match self.session.request_image(&image_id) {
                ImageState::Loaded(bytes) => {
                    let _ = tx.send(Ok(CoverPayload {
                        track_id,
                        cover_id,
                        image_format: "jpg".to_string(),
                        image_data: BASE64.encode(&bytes),
                    }));
                }
                ImageState::Failed(message) => {
                    let _ = tx.send(Err(CoverError { message }));
                }
                ImageState::Loading => {
                    self.pending_covers.entry(image_id).or_default().push(PendingCover {
                        track_id,
                        cover_id,
                        tx,
                    });
                }
            },
        }
    }

    fn handle_observer_attach(&mut self, observer: Arc<dyn PlayerObserver>) {
        if let TrackState::Playing { track_id } = &self.track_state {
            if let Some(track) = self.catalog.get(track_id) {
                observer.player_state_event(player_state_event(PlayerState::Playing, Some(track)));
            }
        }
        self.observers.push(observer);
        tracing::info!(observers = self.observers.len(), "attached observer");
    }

    fn handle_observer_detach(&mut self, observer: &Arc<dyn PlayerObserver>) {
        self.observers.retain(|other| !Arc::ptr_eq(other, observer));
        tracing::info!(observers = self.observers.len(), "detached observer");
    }

    fn handle_shutdown(&mut self) {
        if self.shared.track_playing() {
            self.player_state_notify(PlayerState::Stopped, None);
            self.session.unload();
            self.shared.set_track_playing(false);
        }
        self.session.release_track();
        self.track_state = TrackState::NoTrack;

        self.stats.save();
        self.drop_sink();
        self.running = false;
    }

    // ─── track state machine ────────────────────────────────────────────

    fn play_next_from_queue(&mut self) {
        if let Some(uri) = self.play_queue.pop_front() {
            self.play_track(uri);
            return;
        }

        if self.continued_playback {
            self.selector.refill(&self.catalog);
            if let Some(track_id) = self.selector.next() {
                let uri = format!("{TRACK_URI_PREFIX}{track_id}");
                tracing::info!(%uri, "continued playback");
                self.play_track(uri);
                return;
            }
        }

        self.player_state_notify(PlayerState::Stopped, None);
        self.drop_sink();
    }

    fn play_track(&mut self, uri: String) {
        let track_id = uri.rsplit(':').next().unwrap_or(uri.as_str()).to_string();

        match self.session.load_track(&uri) {
            TrackLoad::Loaded => {
                self.track_state = TrackState::Loading { track_id };
                self.track_loaded();
            }
            TrackLoad::Loading => {
                // Wait for the metadata-updated callback.
                self.track_state = TrackState::Loading { track_id };
            }
            TrackLoad::NotATrack => {
                tracing::error!(%uri, "not a track");
                self.play_next_from_queue();
            }
            TrackLoad::Failed(message) => {
                tracing::error!(%uri, %message, "failed to load track");
                self.play_next_from_queue();
            }
        }
    }

    /// Loads the acquired track into the player and starts it.
    ///
    /// The state stays `loading` until the service's start-of-playback
    /// confirmation arrives; [`playback_started`](Self::playback_started)
    /// performs the transition and publishes `playing`.
    fn track_loaded(&mut self) {
        if self.shared.track_playing() {
            // Already loaded and started; a repeated metadata callback.
            return;
        }
        if !matches!(self.track_state, TrackState::Loading { .. }) {
            return;
        }

        // The engine, not the delivery path, owns sink creation.
        if self.shared.sink().is_none() {
            self.shared
                .set_sink(Arc::new(AudioSink::new(&self.config.audio_device_name)));
        }

        if let Err(err) = self.session.load_current() {
            tracing::error!(%err, "player load failed");
        }

        // Delivery may begin the moment the service starts playback; the
        // flag has to be up before then or the first frames are dropped.
        self.shared.set_track_playing(true);
        if let Err(err) = self.session.play(true) {
            tracing::error!(%err, "player play failed");
        }
    }

    fn drop_sink(&mut self) {
        if let Some(sink) = self.shared.take_sink() {
            sink.stop();
            // Worker join happens in the sink's Drop once the delivery
            // path lets go of any transient clone.
        }
    }

    fn player_state_notify(&self, state: PlayerState, track: Option<&Track>) {
        let event = player_state_event(state, track);
        for observer in &self.observers {
            observer.player_state_event(event.clone());
        }
    }
}

/// Process-unique incarnation token for the catalog: the boot wall clock
/// in milliseconds.
fn boot_incarnation() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TrackStatsStore;
    use crate::session::sim::{SimLibrary, SimPlaylist, SimSession, SimSessionHandle};
    use crate::session::TrackMeta;
    use serde_json::Value;
    use std::time::Instant;

    const WAIT_BUDGET: Duration = Duration::from_secs(5);

    struct RecordingObserver {
        events: Mutex<Vec<Value>>,
    }

    impl RecordingObserver {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
            })
        }

        fn events(&self) -> Vec<Value> {
            self.events.lock().clone()
        }

        /// Blocks until the nth event with this state arrived (1-based).
        fn wait_for_state(&self, state: &str, nth: usize) -> Value {
            let deadline = Instant::now() + WAIT_BUDGET;
            loop {
                let matching: Vec<Value> = self
                    .events()
                    .into_iter()
                    .filter(|event| event["state"] == state)
                    .collect();
                if matching.len() >= nth {
                    return matching[nth - 1].clone();
                }
                assert!(
                    Instant::now() < deadline,
                    "event {state} #{nth} never arrived: {:?}",
                    self.events()
                );
                std::thread::sleep(Duration::from_millis(10));
            }
        }
    }

    impl PlayerObserver for RecordingObserver {
        fn player_state_event(&self, event: Value) {
            self.events.lock().push(event);
        }
    }

    fn meta(id: &str) -> TrackMeta {
        TrackMeta {
            track_id: id.to_string(),
            title: format!("title-{id}"),
            track_number: 1,
            duration_ms: 60_000,
            artist: "artist".to_string(),
            album: "album".to_string(),
            album_id: format!("alb-{id}"),
            available: true,
        }
    }

    fn starred(ids: &[&str]) -> SimPlaylist {
        SimPlaylist {
            name: String::new(),
            tracks: ids.iter().map(|id| meta(id)).collect(),
            load_polls: 0,
        }
    }

    fn start(library: SimLibrary, config: EngineConfig) -> (PlayerEngine, SimSessionHandle) {
        let sim = SimSession::new(library);
        let handle = sim.handle();
        let engine = PlayerEngine::start(Box::new(sim), config).unwrap();
        (engine, handle)
    }

    fn login(engine: &PlayerEngine) {
        engine.login("tester", "secret");
    }

    /// Commands run FIFO, so a completed sync means everything pushed
    /// before it has been executed.
    fn barrier(engine: &PlayerEngine) -> SyncSnapshot {
        engine.get_tracks(None, None).blocking_recv().unwrap()
    }

    /// Login and imports complete asynchronously; waits until the catalog
    /// holds at least `count` tracks.
    fn wait_for_tracks(engine: &PlayerEngine, count: usize) -> SyncSnapshot {
        let deadline = Instant::now() + WAIT_BUDGET;
        loop {
            let snapshot = barrier(engine);
            if snapshot.tracks.as_deref().unwrap_or_default().len() >= count {
                return snapshot;
            }
            assert!(
                Instant::now() < deadline,
                "catalog never reached {count} tracks"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn connect_failure_is_fatal() {
        let library = SimLibrary {
            connect_error: Some("bad application key".to_string()),
            ..SimLibrary::default()
        };
        let result = PlayerEngine::start(Box::new(SimSession::new(library)), EngineConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn login_imports_starred_and_container_playlists() {
        let library = SimLibrary {
            playlists: vec![
                starred(&["a", "b"]),
                SimPlaylist {
                    name: "Roadtrip".to_string(),
                    tracks: vec![meta("b"), meta("c")],
                    // Exercise the wait-and-retry import path.
                    load_polls: 3,
                },
            ],
            ..SimLibrary::default()
        };
        let (engine, _sim) = start(library, EngineConfig::default());
        login(&engine);

        let snapshot = wait_for_tracks(&engine, 3);
        let tracks = snapshot.tracks.unwrap();
        let shared = tracks.iter().find(|t| t.track_id == "b").unwrap();
        assert!(shared.playlists.contains("Starred"));
        assert!(shared.playlists.contains("Roadtrip"));
    }

    #[test]
    fn incarnation_is_stable_within_one_engine_lifetime() {
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&["a"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        login(&engine);

        let first = barrier(&engine);
        assert!(first.tracks.is_some());
        assert_eq!(first.transaction, "0");

        let incarnation: i64 = first.incarnation.parse().unwrap();
        let second = engine
            .get_tracks(Some(incarnation), Some(0))
            .blocking_recv()
            .unwrap();
        assert_eq!(second.incarnation, first.incarnation);
        assert!(second.tracks.is_none(), "matching incarnation omits tracks");

        let third = engine
            .get_tracks(Some(incarnation + 1), Some(0))
            .blocking_recv()
            .unwrap();
        assert!(
            third.tracks.is_some(),
            "mismatched incarnation returns the full list even with a matching transaction"
        );
    }

    #[test]
    fn rejected_login_leaves_the_catalog_empty() {
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&["a"])],
                reject_login: true,
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        login(&engine);

        let snapshot = barrier(&engine);
        assert_eq!(snapshot.tracks.unwrap().len(), 0);
    }

    #[test]
    fn queued_uri_plays_and_notifies() {
        let (engine, sim) = start(
            SimLibrary {
                playlists: vec![starred(&["abc"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        wait_for_tracks(&engine, 1);

        engine.player_play_uri("spotify:track:abc");

        let event = observer.wait_for_state("playing", 1);
        assert_eq!(event["track"]["track_id"], "abc");
        assert!(engine.track_playing());

        let calls = sim.calls();
        assert!(calls.iter().any(|c| c == "load_track spotify:track:abc"));
        assert!(calls.iter().any(|c| c == "load_current"));
        assert!(calls.iter().any(|c| c == "play true"));

        engine.shutdown();
    }

    #[test]
    fn pause_then_resume_round_trip() {
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&["abc"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        wait_for_tracks(&engine, 1);

        engine.player_play_uri("spotify:track:abc");
        observer.wait_for_state("playing", 1);

        engine.player_pause();
        let paused = observer.wait_for_state("paused", 1);
        assert_eq!(paused["track"]["track_id"], "abc");

        engine.player_play();
        let resumed = observer.wait_for_state("playing", 2);
        assert_eq!(resumed["track"]["track_id"], "abc");

        engine.shutdown();
    }

    #[test]
    fn skip_emits_event_and_persists_stats() {
        let dir = tempfile::tempdir().unwrap();
        let stats_path = dir.path().join("stats.json");

        let config = EngineConfig {
            track_stat_filename: Some(stats_path.clone()),
            ..EngineConfig::default()
        };
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&["abc", "def"])],
                ..SimLibrary::default()
            },
            config,
        );
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        wait_for_tracks(&engine, 2);

        engine.player_play_uri("spotify:track:abc");
        observer.wait_for_state("playing", 1);

        engine.player_skip();
        observer.wait_for_state("skip", 1);

        engine.shutdown();

        let stats = TrackStatsStore::load(Some(stats_path));
        let stat = stats.get("abc").expect("skip must be persisted");
        assert_eq!(stat.skip_count, 1);
        assert!((stat.rating - 0.9).abs() < 1e-9);
    }

    #[test]
    fn end_of_track_bumps_play_count_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let stats_path = dir.path().join("stats.json");

        let config = EngineConfig {
            track_stat_filename: Some(stats_path.clone()),
            ..EngineConfig::default()
        };
        let (engine, sim) = start(
            SimLibrary {
                playlists: vec![starred(&["abc", "def"])],
                ..SimLibrary::default()
            },
            config,
        );
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        wait_for_tracks(&engine, 2);

        engine.player_play_uri("spotify:track:abc");
        observer.wait_for_state("playing", 1);

        sim.finish_current_track();
        // Continued playback picks the next track.
        observer.wait_for_state("playing", 2);

        engine.shutdown();

        let stats = TrackStatsStore::load(Some(stats_path));
        let stat = stats.get("abc").expect("play must be persisted");
        assert_eq!(stat.play_count, 1);
        assert!((stat.rating - 1.1).abs() < 1e-9);
    }

    #[test]
    fn empty_queues_publish_stopped() {
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&[])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        // Two barriers: the first guarantees the login command ran (which
        // enqueues the logged-in callback), the second that the callback
        // ran too.
        barrier(&engine);
        barrier(&engine);

        engine.player_play();

        let stopped = observer.wait_for_state("stopped", 1);
        assert!(stopped.get("track").is_none());
        assert!(!engine.track_playing());

        engine.shutdown();
    }

    #[test]
    fn playlist_filter_constrains_continued_playback() {
        let library = SimLibrary {
            playlists: vec![
                starred(&["t1", "t2"]),
                SimPlaylist {
                    name: "PL".to_string(),
                    tracks: vec![meta("t1")],
                    load_polls: 0,
                },
            ],
            ..SimLibrary::default()
        };
        let (engine, sim) = start(library, EngineConfig::default());
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);

        // Wait for the PL import specifically; the starred import alone
        // already accounts for both tracks.
        let deadline = Instant::now() + WAIT_BUDGET;
        loop {
            let snapshot = barrier(&engine);
            let imported = snapshot
                .tracks
                .unwrap_or_default()
                .iter()
                .any(|track| track.playlists.contains("PL"));
            if imported {
                break;
            }
            assert!(Instant::now() < deadline, "PL never imported");
            std::thread::sleep(Duration::from_millis(10));
        }

        engine.build_track_set_from_playlist("PL");
        engine.player_play();

        let first = observer.wait_for_state("playing", 1);
        assert_eq!(first["track"]["track_id"], "t1");

        sim.finish_current_track();
        let second = observer.wait_for_state("playing", 2);
        assert_eq!(
            second["track"]["track_id"], "t1",
            "only PL members may follow"
        );

        engine.shutdown();
    }

    #[test]
    fn deferred_track_load_waits_for_metadata() {
        let library = SimLibrary {
            playlists: vec![starred(&["slow"])],
            deferred_loads: ["slow".to_string()].into_iter().collect(),
            ..SimLibrary::default()
        };
        let (engine, sim) = start(library, EngineConfig::default());
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        wait_for_tracks(&engine, 1);

        engine.player_play_uri("spotify:track:slow");
        barrier(&engine);
        assert!(
            observer.events().iter().all(|e| e["state"] != "playing"),
            "nothing may play before metadata arrives"
        );

        sim.fire_metadata_updated();
        let event = observer.wait_for_state("playing", 1);
        assert_eq!(event["track"]["track_id"], "slow");

        engine.shutdown();
    }

    #[test]
    fn playing_waits_for_start_of_playback_confirmation() {
        let library = SimLibrary {
            playlists: vec![starred(&["abc"])],
            manual_start_confirmation: true,
            ..SimLibrary::default()
        };
        let (engine, sim) = start(library, EngineConfig::default());
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        wait_for_tracks(&engine, 1);

        engine.player_play_uri("spotify:track:abc");
        barrier(&engine);
        assert!(
            sim.calls().iter().any(|c| c == "play true"),
            "the engine has asked the service to play"
        );
        assert!(
            observer.events().iter().all(|e| e["state"] != "playing"),
            "no playing event before the service confirms"
        );

        sim.confirm_start_playback();
        let event = observer.wait_for_state("playing", 1);
        assert_eq!(event["track"]["track_id"], "abc");

        engine.shutdown();
    }

    #[test]
    fn observer_attach_replays_the_current_playing_track() {
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&["abc"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        let first = RecordingObserver::new();
        engine.observer_attach(first.clone());
        login(&engine);
        wait_for_tracks(&engine, 1);

        engine.player_play_uri("spotify:track:abc");
        first.wait_for_state("playing", 1);

        let late = RecordingObserver::new();
        engine.observer_attach(late.clone());

        let replay = late.wait_for_state("playing", 1);
        assert_eq!(replay["track"]["track_id"], "abc");

        engine.shutdown();
    }

    #[test]
    fn detached_observer_receives_nothing_further() {
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&["abc"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);

        engine.observer_detach(&(observer.clone() as Arc<dyn PlayerObserver>));
        barrier(&engine);

        engine.player_play_uri("spotify:track:abc");
        barrier(&engine);

        assert!(observer.events().is_empty());

        engine.shutdown();
    }

    #[test]
    fn cover_fetch_returns_base64_payload() {
        use base64::Engine as _;

        let library = SimLibrary {
            playlists: vec![starred(&["abc"])],
            covers: [(
                "alb-abc".to_string(),
                bytes::Bytes::from_static(&[0xff, 0xd8, 0xff, 0xd9]),
            )]
            .into_iter()
            .collect(),
            ..SimLibrary::default()
        };
        let (engine, _sim) = start(library, EngineConfig::default());
        login(&engine);

        let payload = engine
            .get_cover("abc", "alb-abc")
            .blocking_recv()
            .unwrap()
            .unwrap();

        assert_eq!(payload.track_id, "abc");
        assert_eq!(payload.cover_id, "alb-abc");
        assert_eq!(payload.image_format, "jpg");
        let decoded = BASE64.decode(payload.image_data.as_bytes()).unwrap();
        assert_eq!(decoded, vec![0xff, 0xd8, 0xff, 0xd9]);
    }

    #[test]
    fn cover_fetch_waits_for_the_image_load_callback() {
        let library = SimLibrary {
            playlists: vec![starred(&["abc"])],
            covers: [(
                "alb-abc".to_string(),
                bytes::Bytes::from_static(b"imagebytes"),
            )]
            .into_iter()
            .collect(),
            loading_images: ["alb-abc".to_string()].into_iter().collect(),
            ..SimLibrary::default()
        };
        let (engine, sim) = start(library, EngineConfig::default());
        login(&engine);

        let mut pending = engine.get_cover("abc", "alb-abc");
        barrier(&engine);
        assert!(
            pending.try_recv().is_err(),
            "must stay pending until the image loads"
        );

        sim.complete_image("alb-abc");
        let payload = pending.blocking_recv().unwrap().unwrap();
        assert!(!payload.image_data.is_empty());

        engine.shutdown();
    }

    #[test]
    fn cover_fetch_failures_carry_a_message() {
        let library = SimLibrary {
            playlists: vec![starred(&["abc"])],
            unloaded_albums: ["cold-album".to_string()].into_iter().collect(),
            ..SimLibrary::default()
        };
        let (engine, _sim) = start(library, EngineConfig::default());
        login(&engine);

        let err = engine
            .get_cover("abc", "nope")
            .blocking_recv()
            .unwrap()
            .unwrap_err();
        assert!(err.message.contains("nope"));

        let err = engine
            .get_cover("abc", "cold-album")
            .blocking_recv()
            .unwrap()
            .unwrap_err();
        assert!(err.message.contains("not loaded"));
    }

    #[test]
    fn pcm_delivery_is_gated_on_track_playing() {
        let (engine, sim) = start(
            SimLibrary {
                playlists: vec![starred(&["abc"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        let observer = RecordingObserver::new();
        engine.observer_attach(observer.clone());
        login(&engine);
        wait_for_tracks(&engine, 1);

        // Nothing playing: delivery is swallowed and no sink appears.
        assert_eq!(sim.deliver_pcm(512), 512);
        assert_eq!(sim.buffer_stats(), 0);

        engine.player_play_uri("spotify:track:abc");
        observer.wait_for_state("playing", 1);

        assert_eq!(sim.deliver_pcm(512), 512);
        assert!(sim.buffer_stats() > 0, "frames queue up while playing");

        engine.player_stop();
        observer.wait_for_state("stopped", 1);
        assert_eq!(sim.buffer_stats(), 0, "stop drops the sink");

        engine.shutdown();
    }

    #[test]
    fn playlist_delta_callbacks_reach_the_catalog() {
        let (engine, sim) = start(
            SimLibrary {
                playlists: vec![starred(&["a", "b"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        login(&engine);
        wait_for_tracks(&engine, 2);

        sim.push_tracks_added("Starred", vec![meta("c")], 1);
        let snapshot = barrier(&engine);
        let tracks = snapshot.tracks.unwrap();
        assert_eq!(tracks.len(), 3);
        assert!(tracks
            .iter()
            .any(|t| t.track_id == "c" && t.playlists.contains("Starred")));

        sim.push_tracks_removed("Starred", vec![0]);
        let snapshot = barrier(&engine);
        let tracks = snapshot.tracks.unwrap();
        let removed = tracks.iter().find(|t| t.track_id == "a").unwrap();
        assert!(
            removed.playlists.is_empty(),
            "removal erases membership but keeps the track"
        );

        engine.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let (engine, _sim) = start(
            SimLibrary {
                playlists: vec![starred(&["a"])],
                ..SimLibrary::default()
            },
            EngineConfig::default(),
        );
        login(&engine);
        engine.shutdown();
        engine.shutdown();
    }
}
