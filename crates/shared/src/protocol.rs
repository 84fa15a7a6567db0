use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    domain::{CommandEvent, HeadsetId, ProfileName, SensitivityVector, StreamKind},
    error::DeviceError,
};

/// Commands the session controller issues to the device. All of these are
/// fire-and-forget; completion arrives later as a [`DeviceNotification`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DeviceCommand {
    OpenSession {
        profile: ProfileName,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headset: Option<HeadsetId>,
    },
    QueryProfiles,
    CreateProfile {
        profile: ProfileName,
    },
    LoadProfile {
        profile: ProfileName,
    },
    UnloadProfile {
        profile: ProfileName,
    },
    SaveProfile {
        profile: ProfileName,
    },
    Subscribe {
        streams: Vec<StreamKind>,
    },
    GetActiveAction {
        profile: ProfileName,
    },
    GetSensitivity {
        profile: ProfileName,
    },
    SetSensitivity {
        profile: ProfileName,
        values: SensitivityVector,
    },
    Disconnect,
}

/// Asynchronous notifications delivered by the device. At most one
/// completion notification arrives per issued command; ordering across
/// notification kinds is not guaranteed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum DeviceNotification {
    SessionCreated,
    ProfileQueryDone {
        profiles: Vec<String>,
    },
    LoadUnloadDone {
        is_loaded: bool,
    },
    SaveProfileDone,
    CommandDetected(CommandEvent),
    ActiveActionDone {
        data: Value,
    },
    /// Payload is the sensitivity vector on a successful read-back, or an
    /// arbitrary acknowledgement value after a set.
    SensitivityDone {
        data: Value,
    },
    Error(DeviceError),
}

/// Decodes a sensitivity-done payload into a vector, if it is one.
pub fn sensitivity_vector_payload(data: &Value) -> Option<SensitivityVector> {
    let values: Vec<f64> = data
        .as_array()?
        .iter()
        .map(Value::as_f64)
        .collect::<Option<Vec<_>>>()?;
    SensitivityVector::try_from(values.as_slice()).ok()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn commands_serialize_with_snake_case_tags() {
        let encoded = serde_json::to_value(&DeviceCommand::QueryProfiles).expect("encode");
        assert_eq!(encoded, json!({"type": "query_profiles"}));

        let encoded = serde_json::to_value(&DeviceCommand::SetSensitivity {
            profile: ProfileName::new("clyde0513"),
            values: SensitivityVector([6.0, 1.0, 1.0, 1.0]),
        })
        .expect("encode");
        assert_eq!(
            encoded,
            json!({
                "type": "set_sensitivity",
                "payload": {"profile": "clyde0513", "values": [6.0, 1.0, 1.0, 1.0]}
            })
        );
    }

    #[test]
    fn notification_round_trips_through_json() {
        let original = DeviceNotification::ProfileQueryDone {
            profiles: vec!["clyde0513".into(), "guest".into()],
        };
        let encoded = serde_json::to_string(&original).expect("encode");
        let decoded: DeviceNotification = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, original);
    }

    #[test]
    fn vector_payload_requires_a_numeric_array_of_four() {
        assert_eq!(
            sensitivity_vector_payload(&json!([6, 1, 1, 1])),
            Some(SensitivityVector([6.0, 1.0, 1.0, 1.0]))
        );
        assert_eq!(sensitivity_vector_payload(&json!("success")), None);
        assert_eq!(sensitivity_vector_payload(&json!([1, 2, 3])), None);
        assert_eq!(sensitivity_vector_payload(&json!([1, 2, "x", 4])), None);
    }
}
