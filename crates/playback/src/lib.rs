use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://api.spotify.com/v1/";

#[derive(Debug, Error)]
pub enum PlaybackError {
    #[error("playback backend unavailable")]
    Unavailable,
    #[error("playback request rejected with status {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("playback transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid playback api url: {0}")]
    Url(#[from] url::ParseError),
}

/// External capability the dispatcher invokes per recognized command. The
/// caller supplies the bearer token on every call; this crate holds none.
#[async_trait]
pub trait PlaybackControl: Send + Sync {
    async fn pause(&self, token: &str) -> Result<(), PlaybackError>;
    async fn resume(&self, token: &str) -> Result<(), PlaybackError>;
}

pub struct MissingPlayback;

#[async_trait]
impl PlaybackControl for MissingPlayback {
    async fn pause(&self, _token: &str) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unavailable)
    }

    async fn resume(&self, _token: &str) -> Result<(), PlaybackError> {
        Err(PlaybackError::Unavailable)
    }
}

/// Spotify player endpoints. Pause and resume are idempotent PUTs; the API
/// answers 200 or 204 on success.
pub struct SpotifyPlayback {
    http: Client,
    api_base: Url,
}

impl SpotifyPlayback {
    pub fn new() -> Result<Self, PlaybackError> {
        Self::with_api_base(DEFAULT_API_BASE)
    }

    pub fn with_api_base(api_base: &str) -> Result<Self, PlaybackError> {
        Ok(Self {
            http: Client::new(),
            api_base: Url::parse(api_base)?,
        })
    }

    async fn put(&self, path: &str, token: &str) -> Result<(), PlaybackError> {
        let url = self.api_base.join(path)?;
        debug!(%url, "playback request");
        let response = self.http.put(url).bearer_auth(token).send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(()),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PlaybackError::Http { status, body })
            }
        }
    }
}

#[async_trait]
impl PlaybackControl for SpotifyPlayback {
    async fn pause(&self, token: &str) -> Result<(), PlaybackError> {
        self.put("me/player/pause", token).await
    }

    async fn resume(&self, token: &str) -> Result<(), PlaybackError> {
        self.put("me/player/play", token).await
    }
}
