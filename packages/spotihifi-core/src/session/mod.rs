//! Streaming-service session contract.
//!
//! The service library is opaque to the rest of the daemon: the engine
//! owns one [`SessionDriver`] on its own thread and everything the
//! library has to say comes back through the fixed callback surface
//! ([`SessionCallbacks`]). Production deployments plug their service
//! binding in through this trait; the shipped [`sim::SimSession`] backs
//! the headless binary and the engine tests.

pub mod bridge;
pub mod sim;

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub use bridge::SessionCallbacks;

/// Opaque identifier for a service-side playlist handle.
pub type PlaylistHandle = u64;

/// Failure surfaced by a session call.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// Session creation or initial configuration failed; fatal for the
    /// engine instance.
    #[error("session creation failed: {0}")]
    Create(String),

    /// A session call returned a non-OK result.
    #[error("session call failed: {0}")]
    Call(String),
}

/// Construction-time parameters handed to the driver.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Library cache/settings directory.
    pub cache_dir: PathBuf,
    /// Preferred stream bitrate in kbit/s.
    pub preferred_bitrate_kbps: u32,
    /// Whether the library should normalize playback volume.
    pub volume_normalization: bool,
}

/// Track metadata as the service reports it during playlist loading.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackMeta {
    pub track_id: String,
    pub title: String,
    pub track_number: u32,
    pub duration_ms: u32,
    pub artist: String,
    pub album: String,
    pub album_id: String,
    /// Tracks reported unavailable never enter the catalog.
    pub available: bool,
}

/// A playlist with every track loaded.
#[derive(Debug, Clone)]
pub struct PlaylistSnapshot {
    /// Service-side name; empty for the starred list.
    pub name: String,
    pub tracks: Vec<TrackMeta>,
}

/// Outcome of asking the driver to acquire a track from a URI.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackLoad {
    /// Track handle acquired and its metadata is already loaded.
    Loaded,
    /// Track handle acquired; a `metadata_updated` callback will fire
    /// once it finishes loading.
    Loading,
    /// The URI does not name a track.
    NotATrack,
    /// Link creation or track acquisition failed.
    Failed(String),
}

/// Outcome of resolving a cover reference.
#[derive(Debug, Clone, PartialEq)]
pub enum CoverResolution {
    /// The cover resolves to a loadable image.
    Image(String),
    /// The owning album is not loaded yet; the driver has triggered an
    /// album browse and the caller should retry later.
    AlbumNotLoaded,
    /// The reference is unusable.
    Invalid(String),
}

/// State of an image requested from the service.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageState {
    Loaded(Bytes),
    /// Still loading; an `image_loaded` callback will fire.
    Loading,
    Failed(String),
}

/// The streaming-service session as the engine sees it.
///
/// Owned exclusively by the engine thread (`Send`, deliberately not
/// `Sync`). The driver may spawn internal threads of its own; anything
/// those threads need to tell us arrives through the
/// [`SessionCallbacks`] handed over in [`connect`](Self::connect).
pub trait SessionDriver: Send {
    /// Creates the underlying session and registers the callback surface.
    ///
    /// # Errors
    ///
    /// Any failure here (session creation, bitrate or volume-normalization
    /// setup) is fatal for the engine instance.
    fn connect(
        &mut self,
        callbacks: SessionCallbacks,
        config: &SessionConfig,
    ) -> Result<(), SessionError>;

    /// Initiates login; completion arrives via the `logged_in` callback.
    fn login(&mut self, username: &str, password: &str);

    /// Enables scrobbling with the given credentials.
    fn set_scrobbling(&mut self, username: &str, password: &str);

    /// Runs the library event pump once, returning its next-timeout hint.
    fn process_events(&mut self) -> Duration;

    /// Acquires the track named by `uri` as the current track.
    fn load_track(&mut self, uri: &str) -> TrackLoad;

    /// Whether the current track's metadata has finished loading.
    fn current_track_loaded(&self) -> bool;

    /// Loads the current track into the player.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Call`] on a non-OK library result.
    fn load_current(&mut self) -> Result<(), SessionError>;

    /// Starts (`true`) or pauses (`false`) playback of the loaded track.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Call`] on a non-OK library result.
    fn play(&mut self, on: bool) -> Result<(), SessionError>;

    /// Unloads the player; PCM delivery stops after this call returns.
    fn unload(&mut self);

    /// Releases the current track handle.
    fn release_track(&mut self);

    /// Handle of the user's starred playlist.
    fn starred_playlist(&mut self) -> PlaylistHandle;

    /// Snapshot of a playlist, or `None` while the playlist or any of
    /// its tracks is still loading.
    fn playlist_snapshot(&mut self, handle: PlaylistHandle) -> Option<PlaylistSnapshot>;

    /// Resolves a cover reference to an image id.
    fn resolve_cover(&mut self, track_id: &str, cover_id: &str) -> CoverResolution;

    /// Requests image bytes; `Loading` results complete through the
    /// `image_loaded` callback.
    fn request_image(&mut self, image_id: &str) -> ImageState;
}
