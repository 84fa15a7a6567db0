use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_newtype!(ProfileName);
name_newtype!(HeadsetId);

/// Number of trained action channels a profile carries sensitivity gains for.
pub const SENSITIVITY_CHANNELS: usize = 4;

/// Per-action-channel calibration gains. Arity is fixed by construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensitivityVector(pub [f64; SENSITIVITY_CHANNELS]);

impl SensitivityVector {
    pub fn values(&self) -> [f64; SENSITIVITY_CHANNELS] {
        self.0
    }
}

#[derive(Debug, Error)]
#[error("sensitivity vector must have exactly {expected} values, got {actual}")]
pub struct SensitivityArityError {
    pub expected: usize,
    pub actual: usize,
}

impl TryFrom<&[f64]> for SensitivityVector {
    type Error = SensitivityArityError;

    fn try_from(values: &[f64]) -> Result<Self, Self::Error> {
        let values: [f64; SENSITIVITY_CHANNELS] =
            values.try_into().map_err(|_| SensitivityArityError {
                expected: SENSITIVITY_CHANNELS,
                actual: values.len(),
            })?;
        Ok(Self(values))
    }
}

/// Discrete intents the classification stream can emit. The wire vocabulary
/// is open; anything outside the trained set decodes as `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MentalCommand {
    Neutral,
    Lift,
    Drop,
    Push,
    Pull,
    Left,
    Right,
    Unknown,
}

impl MentalCommand {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "neutral" => MentalCommand::Neutral,
            "lift" => MentalCommand::Lift,
            "drop" => MentalCommand::Drop,
            "push" => MentalCommand::Push,
            "pull" => MentalCommand::Pull,
            "left" => MentalCommand::Left,
            "right" => MentalCommand::Right,
            _ => MentalCommand::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MentalCommand::Neutral => "neutral",
            MentalCommand::Lift => "lift",
            MentalCommand::Drop => "drop",
            MentalCommand::Push => "push",
            MentalCommand::Pull => "pull",
            MentalCommand::Left => "left",
            MentalCommand::Right => "right",
            MentalCommand::Unknown => "unknown",
        }
    }
}

impl Serialize for MentalCommand {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MentalCommand {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(MentalCommand::from_wire(&value))
    }
}

/// One classified command sample. Consumed immediately, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    pub action: MentalCommand,
    pub power: f64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Mental command stream.
    Com,
    /// Facial expression stream.
    Fac,
    /// Performance metrics stream.
    Met,
    /// Motion stream.
    Mot,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Com => "com",
            StreamKind::Fac => "fac",
            StreamKind::Met => "met",
            StreamKind::Mot => "mot",
        }
    }
}
