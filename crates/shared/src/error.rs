use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Device-signaled code for a profile that is locked by another session.
pub const ERR_PROFILE_ACCESS_DENIED: i64 = -32046;

/// An error notification delivered by the device. Most codes are
/// informational; only a profile-access conflict is terminal for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("device error {code}: {message}")]
pub struct DeviceError {
    pub code: i64,
    pub message: String,
}

impl DeviceError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn is_profile_access_conflict(&self) -> bool {
        self.code == ERR_PROFILE_ACCESS_DENIED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_access_denied_is_a_conflict() {
        assert!(DeviceError::new(ERR_PROFILE_ACCESS_DENIED, "profile in use")
            .is_profile_access_conflict());
        assert!(!DeviceError::new(-32000, "headset not found").is_profile_access_conflict());
    }
}
