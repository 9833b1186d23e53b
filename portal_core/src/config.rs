use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "portal";
const APP_NAME: &str = "portal_drop";
const CONFIG_FILE: &str = "config.json";

/// Default rendezvous relay address.
pub const DEFAULT_RELAY_ADDR: &str = "ws://localhost:3000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalConfig {
    /// Websocket address of the rendezvous relay.
    pub relay_addr: String,
    /// Where arriving files land when no save dialog is wired up.
    pub download_path: PathBuf,
}

impl Default for PortalConfig {
    fn default() -> Self {
        let relay_addr =
            std::env::var("PORTAL_RELAY").unwrap_or_else(|_| DEFAULT_RELAY_ADDR.to_string());

        // Fixed download path: ~/portal_drop (works on both Windows and Linux)
        let download_path = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("portal_drop");

        Self {
            relay_addr,
            download_path,
        }
    }
}

impl PortalConfig {
    /// Get the config file path
    fn get_config_path() -> Option<PathBuf> {
        if let Ok(test_path) = std::env::var("PORTAL_TEST_CONFIG_DIR") {
            return Some(PathBuf::from(test_path).join(CONFIG_FILE));
        }

        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return Self::default(),
        };

        match fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => Self::default(),
        }
    }

    /// Save config to disk
    pub fn save(&self) {
        let path = match Self::get_config_path() {
            Some(p) => p,
            None => return,
        };

        if let Some(parent) = path.parent() {
            let _ = fs::create_dir_all(parent);
        }

        if let Ok(json) = serde_json::to_string_pretty(self) {
            let _ = fs::write(path, json);
        }
    }
}
