//! Core library for the spotihifi daemon.
//!
//! spotihifi logs into a music-streaming service, mirrors the user's
//! playlists into an in-memory catalog, plays tracks through a local
//! audio device, and takes orders from TCP clients speaking
//! length-prefixed JSON-RPC. This crate holds everything except the
//! binary's CLI/config/bootstrap glue:
//!
//! - [`engine`] - the single-threaded playback orchestration engine
//! - [`catalog`] - tracks, playlists and persistent play statistics
//! - [`audio`] - the PCM sink feeding the OS audio device
//! - [`session`] - the streaming-service driver contract and callback
//!   bridge
//! - [`rpc`] - wire framing, method dispatch and the TCP server
//! - [`events`] - player-state observer fan-out
//! - [`sync`] - the command queues serializing all worker-thread state

pub mod audio;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod events;
pub mod rpc;
pub mod session;
pub mod sync;

pub use catalog::{Catalog, SyncSnapshot, Track, TrackStat, TrackStatsStore};
pub use engine::{CoverError, CoverPayload, EngineConfig, PlayerEngine, TrackFilter};
pub use error::{SpotihifiError, SpotihifiResult};
pub use events::{PlayerObserver, PlayerState};
pub use rpc::RpcServer;
pub use session::{SessionConfig, SessionDriver};
