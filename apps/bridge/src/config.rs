use std::{collections::HashMap, fs};

use anyhow::{bail, Result};

#[derive(Debug, Clone)]
pub struct Settings {
    pub http_bind: String,
    pub spotify_client_id: String,
    pub spotify_client_secret: String,
    pub spotify_redirect_uri: String,
    pub cortex_url: String,
    pub cortex_client_id: String,
    pub cortex_client_secret: String,
    pub profile_name: String,
    pub headset_id: Option<String>,
    pub dispatch_cooldown_ms: Option<u64>,
    pub step_deadline_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_bind: "127.0.0.1:5000".into(),
            spotify_client_id: String::new(),
            spotify_client_secret: String::new(),
            spotify_redirect_uri: "http://127.0.0.1:5000/callback".into(),
            cortex_url: "wss://localhost:6868".into(),
            cortex_client_id: String::new(),
            cortex_client_secret: String::new(),
            profile_name: String::new(),
            headset_id: None,
            dispatch_cooldown_ms: None,
            step_deadline_secs: None,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("bridge.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("http_bind") {
                settings.http_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("cortex_url") {
                settings.cortex_url = v.clone();
            }
            if let Some(v) = file_cfg.get("profile_name") {
                settings.profile_name = v.clone();
            }
            if let Some(v) = file_cfg.get("headset_id") {
                settings.headset_id = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("spotify_redirect_uri") {
                settings.spotify_redirect_uri = v.clone();
            }
        }
    }

    if let Ok(v) = std::env::var("BRIDGE_BIND") {
        settings.http_bind = v;
    }

    if let Ok(v) = std::env::var("SPOTIFY_CLIENT_ID") {
        settings.spotify_client_id = v;
    }
    if let Ok(v) = std::env::var("SPOTIFY_CLIENT_SECRET") {
        settings.spotify_client_secret = v;
    }
    if let Ok(v) = std::env::var("SPOTIFY_REDIRECT_URI") {
        settings.spotify_redirect_uri = v;
    }

    if let Ok(v) = std::env::var("CORTEX_URL") {
        settings.cortex_url = v;
    }
    if let Ok(v) = std::env::var("CLIENT_ID") {
        settings.cortex_client_id = v;
    }
    if let Ok(v) = std::env::var("CLIENT_SECRET") {
        settings.cortex_client_secret = v;
    }

    if let Ok(v) = std::env::var("PROFILE_NAME") {
        settings.profile_name = v;
    }
    if let Ok(v) = std::env::var("HEADSET_ID") {
        if !v.is_empty() {
            settings.headset_id = Some(v);
        }
    }

    if let Ok(v) = std::env::var("DISPATCH_COOLDOWN_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.dispatch_cooldown_ms = Some(parsed);
        }
    }
    if let Ok(v) = std::env::var("STEP_DEADLINE_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.step_deadline_secs = Some(parsed);
        }
    }

    settings
}

/// Refuses to boot without the credentials both sides of the bridge need.
pub fn require_settings(settings: &Settings) -> Result<()> {
    let mut missing = Vec::new();
    if settings.spotify_client_id.is_empty() || settings.spotify_client_secret.is_empty() {
        missing.push("SPOTIFY_CLIENT_ID / SPOTIFY_CLIENT_SECRET");
    }
    if settings.cortex_client_id.is_empty() || settings.cortex_client_secret.is_empty() {
        missing.push("CLIENT_ID / CLIENT_SECRET");
    }
    if settings.profile_name.is_empty() {
        missing.push("PROFILE_NAME");
    }
    if !missing.is_empty() {
        bail!("missing required configuration: {}", missing.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_settings() -> Settings {
        Settings {
            spotify_client_id: "spotify-id".into(),
            spotify_client_secret: "spotify-secret".into(),
            cortex_client_id: "cortex-id".into(),
            cortex_client_secret: "cortex-secret".into(),
            profile_name: "clyde0513".into(),
            ..Settings::default()
        }
    }

    #[test]
    fn complete_settings_pass_validation() {
        require_settings(&complete_settings()).expect("valid");
    }

    #[test]
    fn missing_profile_name_fails_validation() {
        let mut settings = complete_settings();
        settings.profile_name.clear();
        let err = require_settings(&settings).expect_err("must fail");
        assert!(err.to_string().contains("PROFILE_NAME"));
    }

    #[test]
    fn missing_credentials_are_reported_together() {
        let err = require_settings(&Settings::default()).expect_err("must fail");
        let message = err.to_string();
        assert!(message.contains("SPOTIFY_CLIENT_ID"));
        assert!(message.contains("CLIENT_ID / CLIENT_SECRET"));
        assert!(message.contains("PROFILE_NAME"));
    }
}
