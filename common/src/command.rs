use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("requête illisible: {0}")]
    Malformed(String),
    #[error("champ 'vitesse' manquant")]
    MissingSpeed,
    #[error("'vitesse' doit être un entier entre 0 et 100")]
    InvalidSpeed,
    #[error("'ventilateur_index' ne correspond à aucun ventilateur")]
    InvalidChannel,
}

/// Remote clients send numeric fields either as JSON numbers or as quoted
/// strings. Everything downstream of the parse boundary only sees `i64`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i64),
    Text(String),
}

impl IntOrString {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Text(text) => text.trim().parse().ok(),
        }
    }
}

/// Accepted shape of the remote speed-change payload.
#[derive(Debug, Deserialize)]
pub struct SpeedRequest {
    #[serde(default)]
    pub vitesse: Option<IntOrString>,
    #[serde(default)]
    pub filtre_id: Option<IntOrString>,
    #[serde(default)]
    pub ventilateur_index: Option<IntOrString>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTarget {
    All,
    Channel(usize),
}

/// Canonical, fully validated speed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeedCommand {
    pub percent: u8,
    pub target: CommandTarget,
    pub filtre_id: Option<i64>,
}

/// Parses and validates a remote JSON payload. An unparseable body is
/// rejected before any field is looked at; `ventilateur_index` is 0-based.
pub fn parse_remote(body: &[u8], channel_count: usize) -> Result<SpeedCommand, CommandError> {
    let request: SpeedRequest =
        serde_json::from_slice(body).map_err(|err| CommandError::Malformed(err.to_string()))?;

    let percent = request
        .vitesse
        .as_ref()
        .ok_or(CommandError::MissingSpeed)?
        .as_i64()
        .ok_or(CommandError::InvalidSpeed)?;

    let index = match request.ventilateur_index.as_ref() {
        Some(raw) => Some(raw.as_i64().ok_or(CommandError::InvalidChannel)?),
        None => None,
    };

    // filtre_id is echoed metadata; an uncoercible value is dropped rather
    // than rejected.
    let filtre_id = request.filtre_id.as_ref().and_then(IntOrString::as_i64);

    validate(percent, index, false, filtre_id, channel_count)
}

/// Parses and validates the local form submission: `speed` alone targets
/// every channel, `fan` (1-based) + `speed` targets one.
pub fn parse_local(
    fan: Option<&str>,
    speed: Option<&str>,
    channel_count: usize,
) -> Result<SpeedCommand, CommandError> {
    let percent = speed
        .ok_or(CommandError::MissingSpeed)?
        .trim()
        .parse::<i64>()
        .map_err(|_| CommandError::InvalidSpeed)?;

    let index = match fan {
        Some(raw) => Some(
            raw.trim()
                .parse::<i64>()
                .map_err(|_| CommandError::InvalidChannel)?,
        ),
        None => None,
    };

    validate(percent, index, true, None, channel_count)
}

/// Shared validation for both origins. `one_based` applies the external
/// 1-based convention adjustment before the channel is checked.
fn validate(
    percent: i64,
    index: Option<i64>,
    one_based: bool,
    filtre_id: Option<i64>,
    channel_count: usize,
) -> Result<SpeedCommand, CommandError> {
    if !(0..=100).contains(&percent) {
        return Err(CommandError::InvalidSpeed);
    }

    let target = match index {
        None => CommandTarget::All,
        Some(raw) => {
            let adjusted = if one_based { raw - 1 } else { raw };
            if adjusted < 0 || adjusted as usize >= channel_count {
                return Err(CommandError::InvalidChannel);
            }
            CommandTarget::Channel(adjusted as usize)
        }
    };

    Ok(SpeedCommand {
        percent: percent as u8,
        target,
        filtre_id,
    })
}

/// Wire response for both origins: HTTP 200 with `status: "success"`, or
/// HTTP 400 with `status: "error"` and nothing mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResponse {
    pub status: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vitesse: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ventilateur_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filtre_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
}

impl CommandResponse {
    pub fn success(command: &SpeedCommand, rpm: Option<u32>) -> Self {
        let ventilateur_index = match command.target {
            CommandTarget::All => None,
            CommandTarget::Channel(index) => Some(index),
        };

        Self {
            status: "success",
            message: "Vitesse mise à jour".to_string(),
            vitesse: Some(command.percent),
            ventilateur_index,
            filtre_id: command.filtre_id,
            rpm,
        }
    }

    pub fn error(err: &CommandError) -> Self {
        Self {
            status: "error",
            message: err.to_string(),
            vitesse: None,
            ventilateur_index: None,
            filtre_id: None,
            rpm: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_integer_fields_resolve_to_channel() {
        let command = parse_remote(br#"{"vitesse": 70, "ventilateur_index": 1}"#, 3).unwrap();

        assert_eq!(command.percent, 70);
        assert_eq!(command.target, CommandTarget::Channel(1));
    }

    #[test]
    fn remote_string_fields_are_coerced() {
        let command =
            parse_remote(br#"{"vitesse": "70", "ventilateur_index": "2", "filtre_id": "12"}"#, 3)
                .unwrap();

        assert_eq!(command.percent, 70);
        assert_eq!(command.target, CommandTarget::Channel(2));
        assert_eq!(command.filtre_id, Some(12));
    }

    #[test]
    fn remote_without_index_targets_all_channels() {
        let command = parse_remote(br#"{"vitesse": 40}"#, 3).unwrap();
        assert_eq!(command.target, CommandTarget::All);
    }

    #[test]
    fn remote_out_of_range_speed_is_rejected() {
        let err = parse_remote(br#"{"vitesse": 150}"#, 3).unwrap_err();
        assert_eq!(err, CommandError::InvalidSpeed);
    }

    #[test]
    fn remote_missing_speed_is_rejected() {
        let err = parse_remote(br#"{"ventilateur_index": 1}"#, 3).unwrap_err();
        assert_eq!(err, CommandError::MissingSpeed);
    }

    #[test]
    fn remote_unknown_channel_is_rejected() {
        let err = parse_remote(br#"{"vitesse": 50, "ventilateur_index": 3}"#, 3).unwrap_err();
        assert_eq!(err, CommandError::InvalidChannel);

        let err = parse_remote(br#"{"vitesse": 50, "ventilateur_index": -1}"#, 3).unwrap_err();
        assert_eq!(err, CommandError::InvalidChannel);
    }

    #[test]
    fn malformed_payload_is_rejected_before_field_validation() {
        let err = parse_remote(b"pas du json", 3).unwrap_err();
        assert!(matches!(err, CommandError::Malformed(_)));
    }

    #[test]
    fn non_numeric_speed_text_is_rejected() {
        let err = parse_remote(br#"{"vitesse": "vite"}"#, 3).unwrap_err();
        assert_eq!(err, CommandError::InvalidSpeed);
    }

    #[test]
    fn local_form_adjusts_one_based_index() {
        let command = parse_local(Some("1"), Some("80"), 3).unwrap();
        assert_eq!(command.target, CommandTarget::Channel(0));
        assert_eq!(command.percent, 80);
    }

    #[test]
    fn local_form_rejects_fan_zero() {
        let err = parse_local(Some("0"), Some("80"), 3).unwrap_err();
        assert_eq!(err, CommandError::InvalidChannel);
    }

    #[test]
    fn local_form_without_fan_targets_all() {
        let command = parse_local(None, Some("55"), 3).unwrap();
        assert_eq!(command.target, CommandTarget::All);
    }

    #[test]
    fn local_form_requires_speed() {
        let err = parse_local(Some("1"), None, 3).unwrap_err();
        assert_eq!(err, CommandError::MissingSpeed);
    }

    #[test]
    fn success_response_echoes_fields() {
        let command = parse_remote(br#"{"vitesse": 70, "ventilateur_index": 1}"#, 3).unwrap();
        let response = CommandResponse::success(&command, Some(1_200));

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["vitesse"], 70);
        assert_eq!(value["ventilateur_index"], 1);
        assert_eq!(value["rpm"], 1_200);
        assert!(value.get("filtre_id").is_none());
    }

    #[test]
    fn error_response_carries_the_reason() {
        let response = CommandResponse::error(&CommandError::InvalidSpeed);
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["status"], "error");
        assert!(value.get("vitesse").is_none());
    }
}
