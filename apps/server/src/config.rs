//! Daemon configuration.
//!
//! Settings come from an optional JSON configuration file
//! (`spotihifi.conf` by default) merged with CLI flags; flags win.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Keys recognized in the JSON configuration file.
#[derive(Debug, Default, Deserialize)]
pub struct FileConfig {
    pub spotify_username: Option<String>,
    pub spotify_password: Option<String>,
    pub audio_device_name: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub last_fm_username: Option<String>,
    pub last_fm_password: Option<String>,
    pub track_stat_filename: Option<PathBuf>,
    pub volume_normalization: Option<bool>,
}

impl FileConfig {
    /// Loads the configuration file; a missing file is simply empty.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read config file {}", path.display()));
            }
        };

        serde_json::from_slice(&data)
            .with_context(|| format!("config file {} must be a JSON object", path.display()))
    }
}

/// Fully resolved daemon settings.
#[derive(Debug)]
pub struct Settings {
    pub username: String,
    pub password: String,
    pub audio_device_name: String,
    pub cache_dir: PathBuf,
    pub last_fm_username: Option<String>,
    pub last_fm_password: Option<String>,
    pub track_stat_filename: Option<PathBuf>,
    pub volume_normalization: bool,
}

impl Settings {
    /// Merges CLI values with the configuration file. CLI flags take
    /// precedence; the `default` audio device name defers to the file.
    pub fn resolve(
        cli_username: Option<String>,
        cli_password: Option<String>,
        cli_audio_device: String,
        file: FileConfig,
    ) -> Self {
        let audio_device_name = if cli_audio_device == "default" {
            file.audio_device_name.unwrap_or(cli_audio_device)
        } else {
            cli_audio_device
        };

        // Scrobbling needs both halves of the credential pair.
        let (last_fm_username, last_fm_password) =
            match (file.last_fm_username, file.last_fm_password) {
                (Some(username), Some(password)) => (Some(username), Some(password)),
                _ => (None, None),
            };

        Self {
            username: cli_username.or(file.spotify_username).unwrap_or_default(),
            password: cli_password.or(file.spotify_password).unwrap_or_default(),
            audio_device_name,
            cache_dir: file
                .cache_dir
                .unwrap_or_else(|| PathBuf::from("spotihifi_cache")),
            last_fm_username,
            last_fm_password,
            track_stat_filename: file.track_stat_filename,
            volume_normalization: file.volume_normalization.unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = FileConfig::load(&dir.path().join("missing.conf")).unwrap();
        assert!(config.spotify_username.is_none());
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.conf");
        std::fs::write(&path, b"[1, 2, 3]").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn file_values_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spotihifi.conf");
        std::fs::write(
            &path,
            br#"{
                "spotify_username": "alice",
                "spotify_password": "hunter2",
                "audio_device_name": "plughw:0,0",
                "track_stat_filename": "stats.json",
                "volume_normalization": true
            }"#,
        )
        .unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.spotify_username.as_deref(), Some("alice"));
        assert_eq!(config.audio_device_name.as_deref(), Some("plughw:0,0"));
        assert_eq!(config.volume_normalization, Some(true));
    }

    #[test]
    fn cli_flags_take_precedence() {
        let file = FileConfig {
            spotify_username: Some("from-file".to_string()),
            audio_device_name: Some("file-device".to_string()),
            ..FileConfig::default()
        };

        let settings = Settings::resolve(
            Some("from-cli".to_string()),
            None,
            "cli-device".to_string(),
            file,
        );

        assert_eq!(settings.username, "from-cli");
        assert_eq!(settings.audio_device_name, "cli-device");
    }

    #[test]
    fn default_device_defers_to_the_file() {
        let file = FileConfig {
            audio_device_name: Some("plughw:1,0".to_string()),
            ..FileConfig::default()
        };
        let settings = Settings::resolve(None, None, "default".to_string(), file);
        assert_eq!(settings.audio_device_name, "plughw:1,0");

        let settings = Settings::resolve(None, None, "default".to_string(), FileConfig::default());
        assert_eq!(settings.audio_device_name, "default");
    }

    #[test]
    fn scrobbling_requires_both_credentials() {
        let file = FileConfig {
            last_fm_username: Some("alice".to_string()),
            ..FileConfig::default()
        };
        let settings = Settings::resolve(None, None, "default".to_string(), file);
        assert!(settings.last_fm_username.is_none());
        assert!(settings.last_fm_password.is_none());
    }
}
