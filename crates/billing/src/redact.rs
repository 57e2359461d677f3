//! Payload redaction and string sanitization
//!
//! Runs before persistence, not at read time: the event store may be
//! replicated and its rows end up in logs and admin views.

use serde_json::Value;

/// Replacement for values under sensitive keys.
pub const REDACTED_MARKER: &str = "[REDACTED]";

/// Words that mark a field as sensitive. Matched against whole words of the
/// key, not substrings: `pan` must hit `card_pan` but never `plan`,
/// `company`, or `expand`, all of which appear on routine billing payloads.
const SENSITIVE_WORDS: &[&str] = &[
    "cardnumber",
    "pan",
    "cvc",
    "cvv",
    "secret",
    "token",
    "password",
    "authorization",
    "apikey",
    "ssn",
];

/// Word pairs matched against consecutive words of the key, covering the
/// separated spellings (`card_number`, `api_key`, `accountNumber`).
const SENSITIVE_WORD_PAIRS: &[(&str, &str)] = &[
    ("card", "number"),
    ("api", "key"),
    ("account", "number"),
];

/// Split a key into lowercase words on separators and camelCase humps:
/// `client_secret` and `AccessToken` both yield two words.
fn key_words(key: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower && !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            current.push(c.to_ascii_lowercase());
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_lower = false;
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

pub fn is_sensitive_key(key: &str) -> bool {
    let words = key_words(key);
    if words
        .iter()
        .any(|word| SENSITIVE_WORDS.contains(&word.as_str()))
    {
        return true;
    }
    SENSITIVE_WORD_PAIRS.iter().any(|(first, second)| {
        words
            .windows(2)
            .any(|pair| pair[0] == *first && pair[1] == *second)
    })
}

/// Walk the payload recursively and replace any value whose key matches the
/// sensitive-field heuristic with the redaction marker.
pub fn redact_payload(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *entry = Value::String(REDACTED_MARKER.to_string());
                } else {
                    redact_payload(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items.iter_mut() {
                redact_payload(item);
            }
        }
        _ => {}
    }
}

const MAX_EVENT_TYPE_LEN: usize = 128;

/// Sanitize a third-party event type string before storage. The stored
/// value must be safe to echo into any rendering surface, so everything
/// outside a conservative character set is dropped.
pub fn sanitize_event_type(raw: &str) -> String {
    let mut sanitized: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ':'))
        .take(MAX_EVENT_TYPE_LEN)
        .collect();
    if sanitized.is_empty() {
        sanitized = "unknown".to_string();
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_top_level_keys_redacted() {
        let mut payload = json!({
            "card_number": "4242424242424242",
            "cvc": "123",
            "amount": 999,
        });
        redact_payload(&mut payload);
        assert_eq!(payload["card_number"], REDACTED_MARKER);
        assert_eq!(payload["cvc"], REDACTED_MARKER);
        assert_eq!(payload["amount"], 999);
    }

    #[test]
    fn test_nested_and_array_keys_redacted() {
        let mut payload = json!({
            "data": {
                "object": {
                    "payment_method": {
                        "card_number": "4242",
                        "exp_month": 12,
                    },
                    "client_secret": "cs_live_abc",
                },
            },
            "attempts": [
                { "api_key": "sk_live_xyz", "outcome": "declined" },
            ],
        });
        redact_payload(&mut payload);
        assert_eq!(
            payload["data"]["object"]["payment_method"]["card_number"],
            REDACTED_MARKER
        );
        assert_eq!(payload["data"]["object"]["client_secret"], REDACTED_MARKER);
        assert_eq!(payload["attempts"][0]["api_key"], REDACTED_MARKER);
        assert_eq!(payload["attempts"][0]["outcome"], "declined");
        assert_eq!(payload["data"]["object"]["payment_method"]["exp_month"], 12);
    }

    #[test]
    fn test_benign_billing_keys_survive() {
        // Keys that merely contain a sensitive word as a substring are the
        // bulk of real subscription payloads and must pass through intact.
        let mut payload = json!({
            "plan": "pro",
            "company": "acme",
            "expand": ["latest_invoice"],
            "span_id": "abc",
        });
        redact_payload(&mut payload);
        assert_eq!(payload["plan"], "pro");
        assert_eq!(payload["company"], "acme");
        assert_eq!(payload["expand"][0], "latest_invoice");
        assert_eq!(payload["span_id"], "abc");
    }

    #[test]
    fn test_pan_matches_as_whole_word_only() {
        let mut payload = json!({
            "pan": "4242424242424242",
            "card_pan": "4242424242424242",
            "cardPan": "4242424242424242",
        });
        redact_payload(&mut payload);
        assert_eq!(payload["pan"], REDACTED_MARKER);
        assert_eq!(payload["card_pan"], REDACTED_MARKER);
        assert_eq!(payload["cardPan"], REDACTED_MARKER);
    }

    #[test]
    fn test_key_matching_is_case_insensitive() {
        let mut payload = json!({ "Password": "hunter2", "AccessToken": "tok" });
        redact_payload(&mut payload);
        assert_eq!(payload["Password"], REDACTED_MARKER);
        assert_eq!(payload["AccessToken"], REDACTED_MARKER);
    }

    #[test]
    fn test_sanitize_strips_html() {
        assert_eq!(
            sanitize_event_type("<script>alert(1)</script>invoice.paid"),
            "scriptalert1scriptinvoice.paid"
        );
        assert_eq!(sanitize_event_type("invoice.paid"), "invoice.paid");
        assert_eq!(sanitize_event_type("<b></b>"), "bb");
        assert_eq!(sanitize_event_type("<>"), "unknown");
    }

    #[test]
    fn test_sanitize_bounds_length() {
        let long = "a".repeat(1000);
        assert_eq!(sanitize_event_type(&long).len(), 128);
    }
}
