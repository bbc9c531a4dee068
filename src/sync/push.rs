//! Pub/Sub push notification decoding.

use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::{alphabet, Engine};

// Push payloads arrive standard-alphabet but padding varies by publisher.
const PUSH_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// The envelope Gmail publishes on new mailbox activity.
#[derive(Debug, Clone, PartialEq)]
pub struct PushNotification {
    pub email_address: String,
    pub history_id: String,
}

/// Decode the base64 `message.data` field of a Pub/Sub push. Anything
/// malformed or incomplete decodes to `None`; pushes are advisory and the
/// cursor diff does the real work.
pub fn decode_push_payload(data_b64: &str) -> Option<PushNotification> {
    let raw = PUSH_B64.decode(data_b64.trim()).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&raw).ok()?;

    let email_address = value.get("emailAddress")?.as_str()?.to_string();
    let history_id = match value.get("historyId")? {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        _ => return None,
    };

    Some(PushNotification {
        email_address,
        history_id,
    })
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    use super::{decode_push_payload, PushNotification};

    #[test]
    fn decodes_well_formed_payload() {
        let payload = STANDARD
            .encode(r#"{"emailAddress":"user@example.com","historyId":"12345"}"#);
        assert_eq!(
            decode_push_payload(&payload),
            Some(PushNotification {
                email_address: "user@example.com".to_string(),
                history_id: "12345".to_string(),
            })
        );
    }

    #[test]
    fn numeric_history_id_is_accepted() {
        let payload =
            STANDARD.encode(r#"{"emailAddress":"user@example.com","historyId":12345}"#);
        let decoded = decode_push_payload(&payload).expect("decoded");
        assert_eq!(decoded.history_id, "12345");
    }

    #[test]
    fn malformed_payloads_decode_to_none() {
        assert_eq!(decode_push_payload("not base64 at all!!!"), None);

        let not_json = STANDARD.encode("plain text");
        assert_eq!(decode_push_payload(&not_json), None);

        let missing_field = STANDARD.encode(r#"{"historyId":"12345"}"#);
        assert_eq!(decode_push_payload(&missing_field), None);
    }

    #[test]
    fn unpadded_payloads_decode() {
        let mut payload = STANDARD
            .encode(r#"{"emailAddress":"a@b.com","historyId":"7"}"#);
        while payload.ends_with('=') {
            payload.pop();
        }
        assert!(decode_push_payload(&payload).is_some());
    }
}
