use std::collections::BTreeMap;

use imgforge_core::BuildResult;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    Decode(String),
    #[error("frame missing \"type\" field")]
    MissingType,
}

/// Messages the host sends to the guest.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "host_ready")]
    HostReady,
    #[serde(rename = "secrets_response")]
    SecretsResponse { secrets: BTreeMap<String, String> },
}

/// Messages the guest sends to the host. `Unknown` carries the raw type
/// string so the host loop can log and skip it rather than fail (spec §6:
/// "unknown types are logged and skipped ... a warning, not a failure").
#[derive(Debug, Clone)]
pub enum GuestMessage {
    GetSecrets { secret_ids: Vec<String> },
    Log { log: String },
    BuildResult { result: Box<BuildResult> },
    Unknown(String),
}

/// Serialize a host message as one newline-delimited JSON frame.
pub fn encode(message: &HostMessage) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(message).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Parse one line of the guest-to-host stream. Unrecognised fields are
/// ignored; an unrecognised `type` yields [`GuestMessage::Unknown`] rather
/// than an error, matching the wire contract in spec §6.
pub fn decode_guest_message(line: &str) -> Result<GuestMessage, ProtocolError> {
    let value: serde_json::Value =
        serde_json::from_str(line.trim_end()).map_err(|e| ProtocolError::Decode(e.to_string()))?;
    let ty = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?;

    match ty {
        "get_secrets" => {
            let secret_ids = value
                .get("secret_ids")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(|e: serde_json::Error| ProtocolError::Decode(e.to_string()))?
                .unwrap_or_default();
            Ok(GuestMessage::GetSecrets { secret_ids })
        }
        "log" => {
            let log = value
                .get("log")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Ok(GuestMessage::Log { log })
        }
        "build_result" => {
            let result_value = value
                .get("result")
                .cloned()
                .ok_or_else(|| ProtocolError::Decode("build_result missing \"result\"".to_string()))?;
            let result: BuildResult = serde_json::from_value(result_value)
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
            Ok(GuestMessage::BuildResult { result: Box::new(result) })
        }
        other => Ok(GuestMessage::Unknown(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_host_ready() {
        let line = encode(&HostMessage::HostReady).unwrap();
        assert_eq!(line, "{\"type\":\"host_ready\"}\n");
    }

    #[test]
    fn test_encode_secrets_response() {
        let mut secrets = BTreeMap::new();
        secrets.insert("a".to_string(), "1".to_string());
        let line = encode(&HostMessage::SecretsResponse { secrets }).unwrap();
        assert!(line.contains("\"secrets_response\""));
        assert!(line.contains("\"a\":\"1\""));
    }

    #[test]
    fn test_decode_get_secrets() {
        let msg = decode_guest_message(
            r#"{"type":"get_secrets","secret_ids":["a","b","missing"]}"#,
        )
        .unwrap();
        match msg {
            GuestMessage::GetSecrets { secret_ids } => {
                assert_eq!(secret_ids, vec!["a", "b", "missing"]);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_decode_build_result() {
        let msg = decode_guest_message(
            r#"{"type":"build_result","result":{"success":true,"image_digest":"sha256:deadbeef","logs":"","provenance":{},"duration_ms":42}}"#,
        )
        .unwrap();
        match msg {
            GuestMessage::BuildResult { result } => {
                assert!(result.success);
                assert_eq!(result.image_digest.as_deref(), Some("sha256:deadbeef"));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_not_an_error() {
        let msg = decode_guest_message(r#"{"type":"future_feature","foo":1}"#).unwrap();
        assert!(matches!(msg, GuestMessage::Unknown(t) if t == "future_feature"));
    }

    #[test]
    fn test_decode_missing_type_errors() {
        assert!(matches!(
            decode_guest_message(r#"{"foo":1}"#).unwrap_err(),
            ProtocolError::MissingType
        ));
    }

    #[test]
    fn test_decode_invalid_json_errors() {
        assert!(matches!(
            decode_guest_message("not json").unwrap_err(),
            ProtocolError::Decode(_)
        ));
    }

    #[test]
    fn test_decode_unknown_fields_ignored() {
        let msg = decode_guest_message(r#"{"type":"log","log":"hi","extra_field":123}"#).unwrap();
        assert!(matches!(msg, GuestMessage::Log { log } if log == "hi"));
    }
}
