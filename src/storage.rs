//! Connection-secret storage for the hosted table store.
//!
//! Secrets live in the OS credential store (DPAPI on Windows, Keychain on
//! macOS, Secret Service on Linux via the `keyring` crate). Environment
//! variables take precedence on read so headless deployments can skip the
//! keyring entirely.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde_json::Value;
use tracing::warn;

use crate::errors::StartupError;

const SERVICE_NAME: &str = "eggdesk";

// Credential keys
pub const KEY_STORE_URL: &str = "store_url";
pub const KEY_STORE_ANON_KEY: &str = "store_anon_key";

// Environment overrides
pub const ENV_STORE_URL: &str = "EGGDESK_STORE_URL";
pub const ENV_STORE_ANON_KEY: &str = "EGGDESK_STORE_ANON_KEY";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[KEY_STORE_URL, KEY_STORE_ANON_KEY];

/// Resolved connection secrets for the hosted store.
#[derive(Debug, Clone)]
pub struct Connection {
    pub store_url: String,
    pub anon_key: String,
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

fn env_override(key: &str) -> Option<String> {
    let var = match key {
        KEY_STORE_URL => ENV_STORE_URL,
        KEY_STORE_ANON_KEY => ENV_STORE_ANON_KEY,
        _ => return None,
    };
    std::env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Retrieve a single credential. Environment wins over keyring; returns
/// `None` when neither has a value (or the platform reports "not found").
pub fn get_credential(key: &str) -> Option<String> {
    if let Some(value) = env_override(key) {
        return Some(value);
    }
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential. Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

/// Remove every stored credential ("disconnect from store").
pub fn clear_credentials() -> Result<(), String> {
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the store URL:
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_store_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /rest/v1 (pasted from a REST endpoint URL)
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - 8);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Decode an onboarding connection string: raw JSON or url-safe base64 JSON
/// `{ "url": ..., "key": ... }`.
pub fn decode_connection_string(raw: &str) -> Option<(String, String)> {
    let payload = decode_connection_string_payload(raw)?;
    let url = payload
        .get("url")
        .and_then(Value::as_str)
        .map(normalize_store_url)
        .filter(|s| !s.is_empty())?;
    let key = payload
        .get("key")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())?;
    Some((url, key))
}

/// Store both secrets from a pasted connection string.
pub fn apply_connection_string(raw: &str) -> Result<(), String> {
    let (url, key) =
        decode_connection_string(raw).ok_or_else(|| "Invalid connection string".to_string())?;
    set_credential(KEY_STORE_URL, &url)?;
    set_credential(KEY_STORE_ANON_KEY, &key)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The app is considered configured when both connection secrets exist.
pub fn is_configured() -> bool {
    has_credential(KEY_STORE_URL) && has_credential(KEY_STORE_ANON_KEY)
}

/// Load the connection secrets, failing fast when either is missing.
/// Bootstrap refuses to continue without them.
pub fn load_connection() -> Result<Connection, StartupError> {
    let store_url = get_credential(KEY_STORE_URL)
        .map(|u| normalize_store_url(&u))
        .ok_or(StartupError::MissingSecret(KEY_STORE_URL))?;
    let anon_key = get_credential(KEY_STORE_ANON_KEY)
        .ok_or(StartupError::MissingSecret(KEY_STORE_ANON_KEY))?;
    Ok(Connection {
        store_url,
        anon_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_normalize_store_url() {
        assert_eq!(
            normalize_store_url("myfarm.example.co"),
            "https://myfarm.example.co"
        );
        assert_eq!(
            normalize_store_url("localhost:54321"),
            "http://localhost:54321"
        );
        assert_eq!(
            normalize_store_url("https://myfarm.example.co/rest/v1/"),
            "https://myfarm.example.co"
        );
        assert_eq!(
            normalize_store_url("https://myfarm.example.co///"),
            "https://myfarm.example.co"
        );
    }

    #[test]
    fn test_decode_connection_string_json_and_base64() {
        let json = r#"{ "url": "myfarm.example.co", "key": "anon-123" }"#;
        let (url, key) = decode_connection_string(json).expect("json form");
        assert_eq!(url, "https://myfarm.example.co");
        assert_eq!(key, "anon-123");

        let encoded = BASE64_STANDARD.encode(json.as_bytes());
        let (url2, key2) = decode_connection_string(&encoded).expect("base64 form");
        assert_eq!(url2, url);
        assert_eq!(key2, key);

        assert!(decode_connection_string("not a connection string").is_none());
    }

    #[test]
    #[serial]
    fn test_env_override_wins_and_load_connection_fails_fast() {
        std::env::set_var(ENV_STORE_URL, "env.example.co/rest/v1");
        std::env::set_var(ENV_STORE_ANON_KEY, "env-key");

        let conn = load_connection().expect("configured via env");
        assert_eq!(conn.store_url, "https://env.example.co");
        assert_eq!(conn.anon_key, "env-key");
        assert!(is_configured());

        std::env::remove_var(ENV_STORE_URL);
        std::env::remove_var(ENV_STORE_ANON_KEY);
    }
}
