use std::{sync::Arc, time::Duration};

use cortex_integration::{DeviceLink, LinkError};
use playback::PlaybackControl;
use shared::{
    domain::{CommandEvent, HeadsetId, MentalCommand, ProfileName, SensitivityVector, StreamKind},
    error::DeviceError,
    protocol::{sensitivity_vector_payload, DeviceCommand, DeviceNotification},
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex, RwLock},
    time::{timeout, Instant},
};
use tracing::{debug, info, warn};

/// Confidence a classified command must exceed (strictly) before it is
/// allowed to trigger a playback call.
pub const COMMAND_POWER_THRESHOLD: f64 = 0.5;

/// Per-channel gains written to every loaded profile. Tuned against one
/// trained profile; the vector read back from the device is ignored on
/// purpose (see DESIGN.md).
pub const CALIBRATION_TARGET: [f64; 4] = [6.0, 1.0, 1.0, 1.0];

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Decides the gains to write after reading a profile's sensitivity back.
/// Pure; the current policy overwrites with the fixed target regardless of
/// what was observed.
pub fn next_calibration_vector(_observed: &SensitivityVector) -> SensitivityVector {
    SensitivityVector(CALIBRATION_TARGET)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    SessionOpen,
    ProfileListed,
    ProfileCreating,
    ProfileLoading,
    ProfileLoaded,
    SensitivityQueried,
    SensitivityApplying,
    Streaming,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("profile name cannot be empty")]
    EmptyProfileName,
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Holds the playback token handed over by the login flow. One value for
/// the whole process; a new login replaces it atomically.
#[derive(Default)]
pub struct AuthorizationGate {
    token: RwLock<Option<String>>,
}

impl AuthorizationGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
        info!("authorization token replaced");
    }

    pub async fn current_token(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn is_authorized(&self) -> bool {
        self.token.read().await.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackAction {
    Pause,
    Resume,
}

/// What the dispatcher did with one command event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No token yet; expected before login completes, not an error.
    Unauthorized,
    /// Neutral, below threshold, or unmapped action.
    Ignored,
    /// Suppressed by the dispatch cooldown.
    Throttled,
    Invoked(PlaybackAction),
    /// Capability call failed; logged, never retried.
    Failed(PlaybackAction),
}

/// Maps recognized commands to playback calls. At most one external call
/// per event; failures never feed back into controller state.
pub struct ActionDispatcher {
    gate: Arc<AuthorizationGate>,
    playback: Arc<dyn PlaybackControl>,
    cooldown: Option<Duration>,
    last_dispatch: Mutex<Option<Instant>>,
}

impl ActionDispatcher {
    pub fn new(gate: Arc<AuthorizationGate>, playback: Arc<dyn PlaybackControl>) -> Self {
        Self {
            gate,
            playback,
            cooldown: None,
            last_dispatch: Mutex::new(None),
        }
    }

    /// Minimum spacing between external calls. Disabled by default.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    pub async fn on_command_event(&self, event: &CommandEvent) -> DispatchOutcome {
        debug!(action = ?event.action, power = event.power, "command event");

        let Some(token) = self.gate.current_token().await else {
            info!("no playback token yet; skipping command");
            return DispatchOutcome::Unauthorized;
        };

        let action = match event.action {
            MentalCommand::Lift if event.power > COMMAND_POWER_THRESHOLD => PlaybackAction::Pause,
            MentalCommand::Drop if event.power > COMMAND_POWER_THRESHOLD => PlaybackAction::Resume,
            MentalCommand::Neutral => {
                debug!("neutral command, no playback action");
                return DispatchOutcome::Ignored;
            }
            _ => return DispatchOutcome::Ignored,
        };

        if let Some(cooldown) = self.cooldown {
            let mut last = self.last_dispatch.lock().await;
            if let Some(at) = *last {
                if at.elapsed() < cooldown {
                    debug!(?action, "playback dispatch suppressed by cooldown");
                    return DispatchOutcome::Throttled;
                }
            }
            *last = Some(Instant::now());
        }

        let result = match action {
            PlaybackAction::Pause => self.playback.pause(&token).await,
            PlaybackAction::Resume => self.playback.resume(&token).await,
        };

        match result {
            Ok(()) => {
                info!(?action, power = event.power, "playback command dispatched");
                DispatchOutcome::Invoked(action)
            }
            Err(err) => {
                warn!(?action, %err, "playback command failed");
                DispatchOutcome::Failed(action)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum ControllerEvent {
    PhaseChanged(SessionPhase),
    ProfileUnloaded {
        profile: ProfileName,
    },
    CalibrationApplied {
        observed: SensitivityVector,
        applied: SensitivityVector,
    },
    StepDeadlineExceeded {
        phase: SessionPhase,
    },
    Disconnected {
        error: DeviceError,
    },
}

struct ControllerState {
    phase: SessionPhase,
    profile: ProfileName,
    headset: Option<HeadsetId>,
}

/// Drives one device session through the profile lifecycle and into the
/// streaming state. Every transition is triggered by a device notification;
/// each lifecycle command is issued exactly once, because the device
/// delivers at most one completion per issued command and a duplicate could
/// desynchronize device-side profile locks.
pub struct SessionController {
    link: Arc<dyn DeviceLink>,
    dispatcher: ActionDispatcher,
    events: broadcast::Sender<ControllerEvent>,
    inner: Mutex<ControllerState>,
    step_deadline: Option<Duration>,
}

impl SessionController {
    pub fn new_with_dependencies(
        profile: ProfileName,
        headset: Option<HeadsetId>,
        link: Arc<dyn DeviceLink>,
        dispatcher: ActionDispatcher,
    ) -> Result<Arc<Self>, ControllerError> {
        Self::new_with_step_deadline(profile, headset, link, dispatcher, None)
    }

    pub fn new_with_step_deadline(
        profile: ProfileName,
        headset: Option<HeadsetId>,
        link: Arc<dyn DeviceLink>,
        dispatcher: ActionDispatcher,
        step_deadline: Option<Duration>,
    ) -> Result<Arc<Self>, ControllerError> {
        if profile.as_str().is_empty() {
            return Err(ControllerError::EmptyProfileName);
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            link,
            dispatcher,
            events,
            inner: Mutex::new(ControllerState {
                phase: SessionPhase::Idle,
                profile,
                headset,
            }),
            step_deadline,
        }))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.inner.lock().await.phase
    }

    /// Issues the session-open command. The controller stays in `Idle`
    /// until the device answers with a session-created notification.
    pub async fn start(&self) -> Result<(), ControllerError> {
        let (profile, headset) = {
            let inner = self.inner.lock().await;
            (inner.profile.clone(), inner.headset.clone())
        };
        info!(profile = %profile, "opening device session");
        self.link
            .issue(DeviceCommand::OpenSession { profile, headset })
            .await?;
        Ok(())
    }

    /// Drives the session as the sole consumer of the notification channel.
    /// Returns when the channel closes or the session reaches
    /// `Disconnected`.
    pub async fn run(self: Arc<Self>, mut notifications: mpsc::Receiver<DeviceNotification>) {
        loop {
            let phase = self.phase().await;
            if phase == SessionPhase::Disconnected {
                break;
            }

            let awaiting_step = phase != SessionPhase::Streaming;
            let next = match (self.step_deadline, awaiting_step) {
                (Some(deadline), true) => match timeout(deadline, notifications.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(?phase, "no device notification within step deadline");
                        let _ = self
                            .events
                            .send(ControllerEvent::StepDeadlineExceeded { phase });
                        continue;
                    }
                },
                _ => notifications.recv().await,
            };

            let Some(notification) = next else {
                break;
            };

            if let Err(err) = self.handle(notification).await {
                warn!(%err, "failed to issue device command");
            }
        }
        info!("session controller finished");
    }

    /// Single entry point for every device notification. A notification
    /// that does not match the current phase has no outstanding command
    /// behind it and is dropped.
    pub async fn handle(&self, notification: DeviceNotification) -> Result<(), ControllerError> {
        let phase = self.phase().await;

        if phase == SessionPhase::Disconnected {
            debug!("session disconnected; dropping notification");
            return Ok(());
        }

        match notification {
            DeviceNotification::Error(error) => self.on_device_error(error).await,
            DeviceNotification::SessionCreated if phase == SessionPhase::Idle => {
                self.set_phase(SessionPhase::SessionOpen).await;
                self.link.issue(DeviceCommand::QueryProfiles).await?;
                Ok(())
            }
            DeviceNotification::ProfileQueryDone { profiles }
                if phase == SessionPhase::SessionOpen =>
            {
                self.set_phase(SessionPhase::ProfileListed).await;
                let profile = self.profile().await;
                if profiles.iter().any(|name| name == profile.as_str()) {
                    info!(profile = %profile, "profile known to device; loading");
                    self.set_phase(SessionPhase::ProfileLoading).await;
                    self.link.issue(DeviceCommand::LoadProfile { profile }).await?;
                } else {
                    info!(profile = %profile, "profile not found on device; creating");
                    self.set_phase(SessionPhase::ProfileCreating).await;
                    self.link
                        .issue(DeviceCommand::CreateProfile { profile })
                        .await?;
                }
                Ok(())
            }
            DeviceNotification::LoadUnloadDone { is_loaded }
                if matches!(
                    phase,
                    SessionPhase::ProfileCreating | SessionPhase::ProfileLoading
                ) =>
            {
                if is_loaded {
                    self.set_phase(SessionPhase::ProfileLoaded).await;
                    let profile = self.profile().await;
                    self.link
                        .issue(DeviceCommand::GetActiveAction { profile })
                        .await?;
                } else {
                    // Informational, not terminal: the profile reference is
                    // gone but the session stays up.
                    let profile = {
                        let mut inner = self.inner.lock().await;
                        std::mem::replace(&mut inner.profile, ProfileName(String::new()))
                    };
                    info!(profile = %profile, "profile unloaded");
                    let _ = self.events.send(ControllerEvent::ProfileUnloaded { profile });
                }
                Ok(())
            }
            DeviceNotification::ActiveActionDone { data }
                if phase == SessionPhase::ProfileLoaded =>
            {
                debug!(%data, "active actions for profile");
                self.set_phase(SessionPhase::SensitivityQueried).await;
                let profile = self.profile().await;
                self.link
                    .issue(DeviceCommand::GetSensitivity { profile })
                    .await?;
                Ok(())
            }
            DeviceNotification::SensitivityDone { data }
                if phase == SessionPhase::SensitivityQueried =>
            {
                let profile = self.profile().await;
                match sensitivity_vector_payload(&data) {
                    Some(observed) => {
                        let applied = next_calibration_vector(&observed);
                        info!(?observed, ?applied, "overwriting profile sensitivity");
                        self.set_phase(SessionPhase::SensitivityApplying).await;
                        let _ = self
                            .events
                            .send(ControllerEvent::CalibrationApplied { observed, applied });
                        self.link
                            .issue(DeviceCommand::SetSensitivity {
                                profile,
                                values: applied,
                            })
                            .await?;
                    }
                    None => {
                        warn!(%data, "sensitivity payload is not a vector; saving profile as-is");
                        self.link.issue(DeviceCommand::SaveProfile { profile }).await?;
                    }
                }
                Ok(())
            }
            DeviceNotification::SensitivityDone { data }
                if phase == SessionPhase::SensitivityApplying =>
            {
                if sensitivity_vector_payload(&data).is_some() {
                    // Read-back of the vector we just wrote; the set
                    // acknowledgement is still outstanding.
                    debug!("sensitivity read-back while awaiting set acknowledgement");
                    return Ok(());
                }
                let profile = self.profile().await;
                self.link.issue(DeviceCommand::SaveProfile { profile }).await?;
                Ok(())
            }
            DeviceNotification::SaveProfileDone
                if matches!(
                    phase,
                    SessionPhase::SensitivityQueried | SessionPhase::SensitivityApplying
                ) =>
            {
                let profile = self.profile().await;
                info!(profile = %profile, "profile saved; subscribing to command stream");
                self.link
                    .issue(DeviceCommand::Subscribe {
                        streams: vec![StreamKind::Com],
                    })
                    .await?;
                self.set_phase(SessionPhase::Streaming).await;
                Ok(())
            }
            DeviceNotification::CommandDetected(event) if phase == SessionPhase::Streaming => {
                self.dispatcher.on_command_event(&event).await;
                Ok(())
            }
            other => {
                warn!(
                    notification = ?other,
                    ?phase,
                    "notification with no outstanding command; ignoring"
                );
                Ok(())
            }
        }
    }

    async fn on_device_error(&self, error: DeviceError) -> Result<(), ControllerError> {
        if error.is_profile_access_conflict() {
            warn!(
                code = error.code,
                message = %error.message,
                "profile access conflict; disconnecting headset"
            );
            self.link.issue(DeviceCommand::Disconnect).await?;
            self.set_phase(SessionPhase::Disconnected).await;
            let _ = self.events.send(ControllerEvent::Disconnected { error });
        } else {
            warn!(code = error.code, message = %error.message, "device error (non-fatal)");
        }
        Ok(())
    }

    async fn set_phase(&self, phase: SessionPhase) {
        let previous = {
            let mut inner = self.inner.lock().await;
            std::mem::replace(&mut inner.phase, phase)
        };
        if previous != phase {
            debug!(?previous, ?phase, "phase transition");
            let _ = self.events.send(ControllerEvent::PhaseChanged(phase));
        }
    }

    async fn profile(&self) -> ProfileName {
        self.inner.lock().await.profile.clone()
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
