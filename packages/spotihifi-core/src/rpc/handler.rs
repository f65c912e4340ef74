//! JSON-RPC method dispatch onto the playback engine.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::engine::PlayerEngine;
use crate::rpc::request::RpcError;

/// Stateless method dispatcher; one per connection is fine, they all
/// share the engine handle.
#[derive(Clone)]
pub struct RpcHandler {
    engine: Arc<PlayerEngine>,
}

impl RpcHandler {
    #[must_use]
    pub fn new(engine: Arc<PlayerEngine>) -> Self {
        Self { engine }
    }

    /// Dispatches one method call.
    ///
    /// # Errors
    ///
    /// Unknown methods yield -32601, unusable params -32602, and
    /// method-level failures -1; all are answered on the wire without
    /// dropping the connection.
    pub async fn call(&self, method: &str, params: &Value) -> Result<Value, RpcError> {
        tracing::info!(method, %params, "rpc call");

        match method {
            "sync" => self.sync(params).await,
            "play" => self.play(params),
            "pause" => {
                self.engine.player_pause();
                Ok(json!("ok"))
            }
            "skip" => {
                self.engine.player_skip();
                Ok(json!("ok"))
            }
            "stop" => {
                self.engine.player_stop();
                Ok(json!("ok"))
            }
            "queue" => self.queue(params),
            "get-cover" => self.get_cover(params).await,
            _ => Err(RpcError::method_not_found()),
        }
    }

    async fn sync(&self, params: &Value) -> Result<Value, RpcError> {
        let (incarnation, transaction) = match params {
            Value::Null => (None, None),
            Value::Object(object) => (
                parse_version_field(object.get("incarnation"), "incarnation")?,
                parse_version_field(object.get("transaction"), "transaction")?,
            ),
            _ => return Err(RpcError::invalid_params("params must be an object")),
        };

        let snapshot = self
            .engine
            .get_tracks(incarnation, transaction)
            .await
            .map_err(|_| RpcError::call_failed("engine unavailable"))?;

        serde_json::to_value(snapshot).map_err(|err| RpcError::call_failed(err.to_string()))
    }

    fn play(&self, params: &Value) -> Result<Value, RpcError> {
        match params {
            Value::Null => {}
            Value::Object(object) => match object.get("playlist") {
                None => {}
                Some(Value::String(playlist)) if playlist.is_empty() => {
                    self.engine.build_track_set_all();
                }
                Some(Value::String(playlist)) => {
                    // Switching playlists abandons the current track
                    // before the new filter takes over.
                    self.engine.player_stop();
                    self.engine.build_track_set_from_playlist(playlist);
                }
                Some(_) => return Err(RpcError::invalid_params("playlist must be a string")),
            },
            _ => return Err(RpcError::invalid_params("params must be an object")),
        }

        self.engine.player_play();
        Ok(json!("ok"))
    }

    fn queue(&self, params: &Value) -> Result<Value, RpcError> {
        let uri = params
            .as_array()
            .and_then(|uris| uris.first())
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("params must be [uri]"))?;

        self.engine.player_play_uri(uri);
        Ok(json!("ok"))
    }

    async fn get_cover(&self, params: &Value) -> Result<Value, RpcError> {
        let object = params
            .as_object()
            .ok_or_else(|| RpcError::invalid_params("params must be an object"))?;
        let track_id = object
            .get("track_id")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("track_id required"))?;
        let cover_id = object
            .get("cover_id")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("cover_id required"))?;

        let outcome = self
            .engine
            .get_cover(track_id, cover_id)
            .await
            .map_err(|_| RpcError::call_failed("engine unavailable"))?;

        match outcome {
            Ok(payload) => {
                serde_json::to_value(payload).map_err(|err| RpcError::call_failed(err.to_string()))
            }
            Err(cover_error) => Err(RpcError::call_failed(cover_error.message)),
        }
    }
}

/// Parses a string-encoded version counter from sync params.
fn parse_version_field(
    value: Option<&Value>,
    field: &str,
) -> Result<Option<i64>, RpcError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| RpcError::invalid_params(format!("{field} must encode an integer"))),
        Some(_) => Err(RpcError::invalid_params(format!(
            "{field} must be a string-encoded integer"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, PlayerEngine};
    use crate::rpc::request::{INVALID_PARAMS, METHOD_NOT_FOUND};
    use crate::session::sim::{SimLibrary, SimPlaylist, SimSession};
    use crate::session::TrackMeta;

    fn meta(id: &str) -> TrackMeta {
        TrackMeta {
            track_id: id.to_string(),
            title: format!("title-{id}"),
            track_number: 1,
            duration_ms: 60_000,
            artist: "artist".to_string(),
            album: "album".to_string(),
            album_id: "alb".to_string(),
            available: true,
        }
    }

    async fn handler() -> RpcHandler {
        let library = SimLibrary {
            playlists: vec![SimPlaylist {
                name: String::new(),
                tracks: vec![meta("a"), meta("b")],
                load_polls: 0,
            }],
            ..SimLibrary::default()
        };
        let engine = Arc::new(
            PlayerEngine::start(Box::new(SimSession::new(library)), EngineConfig::default())
                .unwrap(),
        );
        engine.login("tester", "secret");

        // Login and import are asynchronous; wait until the catalog holds
        // the library before the tests make assertions about it.
        let handler = RpcHandler::new(engine);
        for _ in 0..500 {
            let snapshot = handler.call("sync", &json!({})).await.unwrap();
            if snapshot["tracks"].as_array().is_some_and(|tracks| tracks.len() == 2) {
                return handler;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("library import never completed");
    }

    #[tokio::test]
    async fn sync_returns_full_list_then_counters_only() {
        let handler = handler().await;

        let first = handler.call("sync", &json!({})).await.unwrap();
        let incarnation = first["incarnation"].as_str().unwrap().to_string();
        assert_eq!(first["transaction"], "0");
        assert_eq!(first["tracks"].as_array().unwrap().len(), 2);

        let second = handler
            .call("sync", &json!({ "incarnation": incarnation, "transaction": "0" }))
            .await
            .unwrap();
        assert!(second.get("tracks").is_none());

        // A matching transaction with the wrong incarnation still gets
        // the full list.
        let third = handler
            .call("sync", &json!({ "incarnation": "12345", "transaction": "0" }))
            .await
            .unwrap();
        assert!(third.get("tracks").is_some());
    }

    #[tokio::test]
    async fn sync_rejects_unparsable_counters() {
        let handler = handler().await;
        let err = handler
            .call("sync", &json!({ "incarnation": "not a number" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn control_methods_return_ok() {
        let handler = handler().await;
        for method in ["pause", "skip", "stop"] {
            let result = handler.call(method, &Value::Null).await.unwrap();
            assert_eq!(result, json!("ok"));
        }
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let handler = handler().await;
        let err = handler.call("rewind", &Value::Null).await.unwrap_err();
        assert_eq!(err.code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn queue_requires_a_uri_array() {
        let handler = handler().await;

        let err = handler.call("queue", &json!({})).await.unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        let ok = handler
            .call("queue", &json!(["spotify:track:a"]))
            .await
            .unwrap();
        assert_eq!(ok, json!("ok"));
    }

    #[tokio::test]
    async fn get_cover_requires_both_keys() {
        let handler = handler().await;

        let err = handler
            .call("get-cover", &json!({ "track_id": "a" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);

        let err = handler
            .call("get-cover", &json!({ "cover_id": "c" }))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn play_accepts_playlist_variants() {
        let handler = handler().await;

        assert_eq!(handler.call("play", &Value::Null).await.unwrap(), json!("ok"));
        assert_eq!(
            handler.call("play", &json!({ "playlist": "" })).await.unwrap(),
            json!("ok")
        );
        assert_eq!(
            handler
                .call("play", &json!({ "playlist": "Starred" }))
                .await
                .unwrap(),
            json!("ok")
        );

        let err = handler
            .call("play", &json!({ "playlist": 7 }))
            .await
            .unwrap_err();
        assert_eq!(err.code, INVALID_PARAMS);
    }
}
