use serde_json::Value;

pub const REDACTED: &str = "[REDACTED]";

const SENSITIVE_TERMS: &[&str] = &[
    "password",
    "passwd",
    "token",
    "secret",
    "email",
    "phone",
    "authorization",
    "apikey",
    "credential",
    "cookie",
];

/// Replace sensitive keys and values anywhere inside `value`.
pub fn redact_json_value(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, val) in map.iter_mut() {
                if is_sensitive_key(key) {
                    *val = Value::String(REDACTED.to_owned());
                } else {
                    redact_json_value(val);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact_json_value),
        Value::String(text) if is_sensitive_value(text) => *text = REDACTED.to_owned(),
        _ => {}
    }
}

/// Key names are compared with separators and case folded away, so
/// `api_key`, `API-Key` and `apiKey` all match.
pub fn is_sensitive_key(key: &str) -> bool {
    let folded = fold(key);
    SENSITIVE_TERMS.iter().any(|term| folded.contains(term))
}

/// String values are redacted when they mention a sensitive term or carry a
/// credential-shaped payload (bearer token, email address).
pub fn is_sensitive_value(text: &str) -> bool {
    if text.trim_start().starts_with("Bearer ") || looks_like_email(text) {
        return true;
    }
    is_sensitive_key(text)
}

fn fold(input: &str) -> String {
    input
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect()
}

fn looks_like_email(text: &str) -> bool {
    let Some((local, domain)) = text.trim().split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !local.contains(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn redacts_sensitive_keys_recursively() {
        let mut props = json!({
            "screen": "ladder",
            "user": { "Email": "a@b.io", "apiKey": "k", "profile": { "phone_number": "1" } },
            "attempts": [{ "refresh_token": "r" }, { "ok": true }],
        });
        redact_json_value(&mut props);

        assert_eq!(
            props,
            json!({
                "screen": "ladder",
                "user": {
                    "Email": REDACTED,
                    "apiKey": REDACTED,
                    "profile": { "phone_number": REDACTED }
                },
                "attempts": [{ "refresh_token": REDACTED }, { "ok": true }],
            })
        );
    }

    #[test]
    fn redacts_sensitive_string_values() {
        let mut props = json!({
            "note": "reset password please",
            "header": "Bearer abc.def",
            "contact": "player@club.example",
            "team": "Smash Bros",
        });
        redact_json_value(&mut props);

        assert_eq!(props["note"], REDACTED);
        assert_eq!(props["header"], REDACTED);
        assert_eq!(props["contact"], REDACTED);
        assert_eq!(props["team"], "Smash Bros");
    }

    #[test]
    fn plain_at_signs_are_not_emails() {
        assert!(!looks_like_email("@home"));
        assert!(!looks_like_email("court @ 7pm"));
        assert!(looks_like_email("x@y.z"));
    }
}
