use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use shared::{
    domain::{CommandEvent, HeadsetId, MentalCommand, ProfileName},
    error::DeviceError,
    protocol::{DeviceCommand, DeviceNotification},
};
use thiserror::Error;
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("device link unavailable")]
    Unavailable,
    #[error("device session handshake has not completed")]
    HandshakeIncomplete,
    #[error("device socket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Fire-and-forget command channel to the device. Completions come back as
/// notifications on the session's channel, never as return values.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    async fn issue(&self, command: DeviceCommand) -> Result<(), LinkError>;
}

pub struct MissingDeviceLink;

#[async_trait]
impl DeviceLink for MissingDeviceLink {
    async fn issue(&self, _command: DeviceCommand) -> Result<(), LinkError> {
        Err(LinkError::Unavailable)
    }
}

#[derive(Debug, Clone)]
pub struct CortexLinkOptions {
    /// Websocket endpoint of the device service, e.g. `wss://localhost:6868`.
    pub url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Completion kind expected for an in-flight JSON-RPC request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
    Authorize,
    CreateSession,
    QueryProfiles,
    SetupProfile(ProfileAction),
    Subscribe,
    ActiveAction,
    GetSensitivity,
    SetSensitivity,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProfileAction {
    Create,
    Load,
    Unload,
    Save,
}

impl ProfileAction {
    fn as_str(&self) -> &'static str {
        match self {
            ProfileAction::Create => "create",
            ProfileAction::Load => "load",
            ProfileAction::Unload => "unload",
            ProfileAction::Save => "save",
        }
    }
}

struct HandshakeState {
    next_request_id: u64,
    cortex_token: Option<String>,
    session_id: Option<String>,
    headset: Option<HeadsetId>,
}

struct LinkShared {
    options: CortexLinkOptions,
    writer: Mutex<WsSink>,
    pending: Mutex<HashMap<u64, PendingKind>>,
    handshake: Mutex<HandshakeState>,
}

/// JSON-RPC websocket transport to a Cortex-style device service. The
/// reader task translates responses and stream samples into
/// [`DeviceNotification`]s pushed to the session's channel; the channel
/// closes when the socket does.
pub struct WsDeviceLink {
    shared: Arc<LinkShared>,
}

impl WsDeviceLink {
    pub async fn connect(
        options: CortexLinkOptions,
        notifications: mpsc::Sender<DeviceNotification>,
    ) -> Result<Arc<Self>, LinkError> {
        let (socket, _) = connect_async(options.url.as_str()).await?;
        let (writer, reader) = socket.split();
        let shared = Arc::new(LinkShared {
            options,
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            handshake: Mutex::new(HandshakeState {
                next_request_id: 0,
                cortex_token: None,
                session_id: None,
                headset: None,
            }),
        });
        tokio::spawn(read_loop(Arc::clone(&shared), reader, notifications));
        Ok(Arc::new(Self { shared }))
    }
}

#[async_trait]
impl DeviceLink for WsDeviceLink {
    async fn issue(&self, command: DeviceCommand) -> Result<(), LinkError> {
        let shared = &self.shared;
        match command {
            DeviceCommand::OpenSession { profile, headset } => {
                {
                    let mut handshake = shared.handshake.lock().await;
                    handshake.headset = headset;
                }
                debug!(profile = %profile, "authorizing with device service");
                send_request(
                    shared,
                    "authorize",
                    json!({
                        "clientId": shared.options.client_id,
                        "clientSecret": shared.options.client_secret,
                    }),
                    PendingKind::Authorize,
                )
                .await
            }
            DeviceCommand::QueryProfiles => {
                let token = cortex_token(shared).await?;
                send_request(
                    shared,
                    "queryProfile",
                    json!({"cortexToken": token}),
                    PendingKind::QueryProfiles,
                )
                .await
            }
            DeviceCommand::CreateProfile { profile } => {
                setup_profile(shared, &profile, ProfileAction::Create).await
            }
            DeviceCommand::LoadProfile { profile } => {
                setup_profile(shared, &profile, ProfileAction::Load).await
            }
            DeviceCommand::UnloadProfile { profile } => {
                setup_profile(shared, &profile, ProfileAction::Unload).await
            }
            DeviceCommand::SaveProfile { profile } => {
                setup_profile(shared, &profile, ProfileAction::Save).await
            }
            DeviceCommand::Subscribe { streams } => {
                let (token, session_id) = session_handles(shared).await?;
                let streams: Vec<&str> = streams.iter().map(|stream| stream.as_str()).collect();
                send_request(
                    shared,
                    "subscribe",
                    json!({
                        "cortexToken": token,
                        "session": session_id,
                        "streams": streams,
                    }),
                    PendingKind::Subscribe,
                )
                .await
            }
            DeviceCommand::GetActiveAction { profile } => {
                let token = cortex_token(shared).await?;
                send_request(
                    shared,
                    "mentalCommandActiveAction",
                    json!({
                        "cortexToken": token,
                        "status": "get",
                        "profile": profile.as_str(),
                    }),
                    PendingKind::ActiveAction,
                )
                .await
            }
            DeviceCommand::GetSensitivity { profile } => {
                let token = cortex_token(shared).await?;
                send_request(
                    shared,
                    "mentalCommandActionSensitivity",
                    json!({
                        "cortexToken": token,
                        "status": "get",
                        "profile": profile.as_str(),
                    }),
                    PendingKind::GetSensitivity,
                )
                .await
            }
            DeviceCommand::SetSensitivity { profile, values } => {
                let token = cortex_token(shared).await?;
                send_request(
                    shared,
                    "mentalCommandActionSensitivity",
                    json!({
                        "cortexToken": token,
                        "status": "set",
                        "profile": profile.as_str(),
                        "values": values.values(),
                    }),
                    PendingKind::SetSensitivity,
                )
                .await
            }
            DeviceCommand::Disconnect => {
                let headset = { shared.handshake.lock().await.headset.clone() };
                let mut params = json!({"command": "disconnect"});
                if let Some(headset) = headset {
                    params["headset"] = Value::String(headset.0);
                }
                send_request(shared, "controlDevice", params, PendingKind::Disconnect).await
            }
        }
    }
}

async fn cortex_token(shared: &LinkShared) -> Result<String, LinkError> {
    shared
        .handshake
        .lock()
        .await
        .cortex_token
        .clone()
        .ok_or(LinkError::HandshakeIncomplete)
}

async fn session_handles(shared: &LinkShared) -> Result<(String, String), LinkError> {
    let handshake = shared.handshake.lock().await;
    match (&handshake.cortex_token, &handshake.session_id) {
        (Some(token), Some(session_id)) => Ok((token.clone(), session_id.clone())),
        _ => Err(LinkError::HandshakeIncomplete),
    }
}

async fn setup_profile(
    shared: &LinkShared,
    profile: &ProfileName,
    action: ProfileAction,
) -> Result<(), LinkError> {
    let token = cortex_token(shared).await?;
    let headset = { shared.handshake.lock().await.headset.clone() };
    let mut params = json!({
        "cortexToken": token,
        "profile": profile.as_str(),
        "status": action.as_str(),
    });
    if let Some(headset) = headset {
        params["headset"] = Value::String(headset.0);
    }
    send_request(
        shared,
        "setupProfile",
        params,
        PendingKind::SetupProfile(action),
    )
    .await
}

async fn send_request(
    shared: &LinkShared,
    method: &str,
    params: Value,
    kind: PendingKind,
) -> Result<(), LinkError> {
    let id = {
        let mut handshake = shared.handshake.lock().await;
        handshake.next_request_id += 1;
        handshake.next_request_id
    };
    shared.pending.lock().await.insert(id, kind);

    let frame = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    });
    debug!(%method, request_id = id, "sending device request");
    let mut writer = shared.writer.lock().await;
    writer.send(Message::Text(frame.to_string())).await?;
    Ok(())
}

async fn read_loop(
    shared: Arc<LinkShared>,
    mut reader: WsSource,
    notifications: mpsc::Sender<DeviceNotification>,
) {
    while let Some(frame) = reader.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "device socket receive failed");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let value: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "skipping malformed device frame");
                continue;
            }
        };
        if let Some(notification) = translate_frame(&shared, value).await {
            if notifications.send(notification).await.is_err() {
                // Session consumer is gone; nothing left to deliver to.
                break;
            }
        }
    }
    debug!("device socket reader finished");
}

/// Maps one inbound frame to a notification, driving the authorize →
/// createSession handshake internally so callers only ever see
/// `SessionCreated`.
async fn translate_frame(shared: &Arc<LinkShared>, value: Value) -> Option<DeviceNotification> {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let Some(kind) = shared.pending.lock().await.remove(&id) else {
            warn!(request_id = id, "completion with no outstanding request");
            return None;
        };

        if let Some(error) = value.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or_default();
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown device error")
                .to_string();
            return Some(DeviceNotification::Error(DeviceError::new(code, message)));
        }

        let result = value.get("result").cloned().unwrap_or(Value::Null);
        return translate_completion(shared, kind, result).await;
    }

    if value.get("com").is_some() {
        return decode_com_sample(&value).map(DeviceNotification::CommandDetected);
    }

    if let Some(warning) = value.get("warning") {
        info!(%warning, "device warning");
    }
    None
}

async fn translate_completion(
    shared: &Arc<LinkShared>,
    kind: PendingKind,
    result: Value,
) -> Option<DeviceNotification> {
    match kind {
        PendingKind::Authorize => {
            let token = result
                .get("cortexToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            let headset = {
                let mut handshake = shared.handshake.lock().await;
                handshake.cortex_token = token;
                handshake.headset.clone()
            };
            let mut params = json!({"status": "open"});
            if let Ok(token) = cortex_token(shared).await {
                params["cortexToken"] = Value::String(token);
            }
            if let Some(headset) = headset {
                params["headset"] = Value::String(headset.0);
            }
            if let Err(err) =
                send_request(shared, "createSession", params, PendingKind::CreateSession).await
            {
                warn!(%err, "failed to open device session after authorize");
            }
            None
        }
        PendingKind::CreateSession => {
            let session_id = result.get("id").and_then(Value::as_str).map(str::to_string);
            shared.handshake.lock().await.session_id = session_id;
            Some(DeviceNotification::SessionCreated)
        }
        PendingKind::QueryProfiles => Some(DeviceNotification::ProfileQueryDone {
            profiles: profile_names(&result),
        }),
        PendingKind::SetupProfile(ProfileAction::Create)
        | PendingKind::SetupProfile(ProfileAction::Load) => {
            Some(DeviceNotification::LoadUnloadDone { is_loaded: true })
        }
        PendingKind::SetupProfile(ProfileAction::Unload) => {
            Some(DeviceNotification::LoadUnloadDone { is_loaded: false })
        }
        PendingKind::SetupProfile(ProfileAction::Save) => Some(DeviceNotification::SaveProfileDone),
        PendingKind::Subscribe => {
            info!("command stream subscription acknowledged");
            None
        }
        PendingKind::ActiveAction => Some(DeviceNotification::ActiveActionDone { data: result }),
        PendingKind::GetSensitivity | PendingKind::SetSensitivity => {
            Some(DeviceNotification::SensitivityDone { data: result })
        }
        PendingKind::Disconnect => {
            info!("headset disconnect acknowledged");
            None
        }
    }
}

/// Profile query results are a list of `{ "name": ... }` objects.
fn profile_names(result: &Value) -> Vec<String> {
    result
        .as_array()
        .map(|profiles| {
            profiles
                .iter()
                .filter_map(|profile| profile.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Stream samples arrive as `{"com": [action, power], "time": epoch_secs}`.
fn decode_com_sample(value: &Value) -> Option<CommandEvent> {
    let sample = value.get("com")?.as_array()?;
    let action = MentalCommand::from_wire(sample.first()?.as_str()?);
    let power = sample.get(1)?.as_f64()?;
    let time = value
        .get("time")
        .and_then(Value::as_f64)
        .map(epoch_to_datetime)
        .unwrap_or_else(Utc::now);
    Some(CommandEvent {
        action,
        power,
        time,
    })
}

fn epoch_to_datetime(epoch_secs: f64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt((epoch_secs * 1000.0) as i64)
        .single()
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use shared::domain::MentalCommand;

    use super::*;

    #[test]
    fn com_samples_decode_action_power_and_time() {
        let event = decode_com_sample(&json!({
            "com": ["lift", 0.87],
            "time": 1700000000.25,
            "sid": "s-1",
        }))
        .expect("sample decodes");
        assert_eq!(event.action, MentalCommand::Lift);
        assert_eq!(event.power, 0.87);
        assert_eq!(event.time.timestamp_millis(), 1_700_000_000_250);
    }

    #[test]
    fn untrained_com_actions_decode_as_unknown() {
        let event = decode_com_sample(&json!({"com": ["wink", 0.4]})).expect("sample decodes");
        assert_eq!(event.action, MentalCommand::Unknown);
    }

    #[test]
    fn malformed_com_samples_are_dropped() {
        assert!(decode_com_sample(&json!({"com": "lift"})).is_none());
        assert!(decode_com_sample(&json!({"com": []})).is_none());
        assert!(decode_com_sample(&json!({"com": ["lift"]})).is_none());
    }

    #[test]
    fn profile_names_come_from_name_fields() {
        let names = profile_names(&json!([
            {"name": "clyde0513", "uuid": "u-1"},
            {"name": "guest"},
            {"uuid": "nameless"},
        ]));
        assert_eq!(names, vec!["clyde0513".to_string(), "guest".to_string()]);
    }

    #[test]
    fn profile_names_default_to_empty_for_non_arrays() {
        assert!(profile_names(&json!({"unexpected": true})).is_empty());
    }
}
