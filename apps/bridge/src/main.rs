use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::get,
    Router,
};
use clap::Parser;
use controller_core::{ActionDispatcher, AuthorizationGate, SessionController};
use cortex_integration::{CortexLinkOptions, WsDeviceLink};
use playback::{PlaybackControl, SpotifyPlayback};
use serde::Deserialize;
use shared::domain::{HeadsetId, ProfileName};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

mod config;

use config::{load_settings, require_settings, Settings};

const SPOTIFY_AUTH_URL: &str = "https://accounts.spotify.com/authorize";
const SPOTIFY_TOKEN_URL: &str = "https://accounts.spotify.com/api/token";
const SPOTIFY_SCOPES: &str = "user-read-email user-modify-playback-state user-read-playback-state";
const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the HTTP bind address from settings.
    #[arg(long)]
    bind: Option<String>,
}

#[derive(Clone)]
struct AppState {
    settings: Settings,
    gate: Arc<AuthorizationGate>,
    playback: Arc<dyn PlaybackControl>,
    http: reqwest::Client,
    session_started: Arc<Mutex<bool>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let args = Args::parse();
    let mut settings = load_settings();
    if let Some(bind) = args.bind {
        settings.http_bind = bind;
    }
    require_settings(&settings)?;

    let gate = AuthorizationGate::new();
    let playback: Arc<dyn PlaybackControl> = Arc::new(SpotifyPlayback::new()?);

    let state = AppState {
        settings: settings.clone(),
        gate,
        playback,
        http: reqwest::Client::new(),
        session_started: Arc::new(Mutex::new(false)),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/login", get(login))
        .route("/callback", get(callback))
        .route("/pause", get(manual_pause))
        .route("/resume", get(manual_resume))
        .with_state(state);

    let addr: SocketAddr = settings
        .http_bind
        .parse()
        .context("invalid http bind address")?;
    info!(%addr, profile = %settings.profile_name, "bridge listening; log in at /login");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "Mind-command playback bridge<br>\
         <a href='/login'>Login with Spotify</a><br>\
         Configured headset profile: <b>{}</b>",
        state.settings.profile_name
    ))
}

async fn login(State(state): State<AppState>) -> Redirect {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("client_id", &state.settings.spotify_client_id)
        .append_pair("response_type", "code")
        .append_pair("scope", SPOTIFY_SCOPES)
        .append_pair("redirect_uri", &state.settings.spotify_redirect_uri)
        .append_pair("show_dialog", "true")
        .finish();
    Redirect::temporary(&format!("{SPOTIFY_AUTH_URL}?{query}"))
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

async fn callback(State(state): State<AppState>, Query(query): Query<CallbackQuery>) -> Response {
    if let Some(error) = query.error {
        return (StatusCode::BAD_REQUEST, format!("login rejected: {error}")).into_response();
    }
    let Some(code) = query.code else {
        return (
            StatusCode::BAD_REQUEST,
            "missing 'code' in callback".to_string(),
        )
            .into_response();
    };

    let token = match exchange_code(&state, &code).await {
        Ok(token) => token,
        Err(err) => {
            error!(%err, "spotify code exchange failed");
            return (
                StatusCode::BAD_GATEWAY,
                format!("token exchange failed: {err}"),
            )
                .into_response();
        }
    };

    state.gate.set_token(token).await;
    info!("spotify token stored; command dispatch enabled");

    // Start the headset session only once a token exists, so recognized
    // commands can act immediately.
    if let Err(err) = start_session(&state).await {
        error!(%err, "failed to start headset session");
        return (
            StatusCode::BAD_GATEWAY,
            format!("headset session failed: {err}"),
        )
            .into_response();
    }

    Redirect::temporary("/").into_response()
}

async fn exchange_code(state: &AppState, code: &str) -> Result<String> {
    let response = state
        .http
        .post(SPOTIFY_TOKEN_URL)
        .form(&[
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", state.settings.spotify_redirect_uri.as_str()),
            ("client_id", state.settings.spotify_client_id.as_str()),
            ("client_secret", state.settings.spotify_client_secret.as_str()),
        ])
        .send()
        .await?
        .error_for_status()?;
    let body: TokenResponse = response.json().await?;
    Ok(body.access_token)
}

async fn start_session(state: &AppState) -> Result<()> {
    let mut started = state.session_started.lock().await;
    if *started {
        info!("headset session already started");
        return Ok(());
    }

    let (notifications_tx, notifications_rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
    let link = WsDeviceLink::connect(
        CortexLinkOptions {
            url: state.settings.cortex_url.clone(),
            client_id: state.settings.cortex_client_id.clone(),
            client_secret: state.settings.cortex_client_secret.clone(),
        },
        notifications_tx,
    )
    .await
    .context("failed to connect to the device service")?;

    let mut dispatcher =
        ActionDispatcher::new(Arc::clone(&state.gate), Arc::clone(&state.playback));
    if let Some(cooldown_ms) = state.settings.dispatch_cooldown_ms {
        dispatcher = dispatcher.with_cooldown(Duration::from_millis(cooldown_ms));
    }

    let controller = SessionController::new_with_step_deadline(
        ProfileName::new(state.settings.profile_name.clone()),
        state.settings.headset_id.clone().map(HeadsetId::new),
        link,
        dispatcher,
        state.settings.step_deadline_secs.map(Duration::from_secs),
    )?;

    controller.start().await?;
    tokio::spawn(Arc::clone(&controller).run(notifications_rx));
    *started = true;
    info!("headset session started");
    Ok(())
}

async fn manual_pause(State(state): State<AppState>) -> Response {
    let Some(token) = state.gate.current_token().await else {
        return Redirect::temporary("/login").into_response();
    };
    match state.playback.pause(&token).await {
        Ok(()) => "Playback paused.".into_response(),
        Err(err) => {
            warn!(%err, "manual pause failed");
            (StatusCode::BAD_GATEWAY, format!("pause failed: {err}")).into_response()
        }
    }
}

async fn manual_resume(State(state): State<AppState>) -> Response {
    let Some(token) = state.gate.current_token().await else {
        return Redirect::temporary("/login").into_response();
    };
    match state.playback.resume(&token).await {
        Ok(()) => "Playback resumed.".into_response(),
        Err(err) => {
            warn!(%err, "manual resume failed");
            (StatusCode::BAD_GATEWAY, format!("resume failed: {err}")).into_response()
        }
    }
}
