//! Page scripts used by the session.
//!
//! Callback-style `__tcfapi` commands are wrapped in promises that settle
//! with `null` when the CMP never calls back, so an awaited evaluation
//! cannot hang on a broken CMP.

use crate::consent::record::MAX_CMP_FIELD;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Storage keys the reference CMP implementation reads on load.
pub const CONSENT_KEYS: [&str; 2] = ["euconsent-v2", "eupubconsent-v2"];

/// How long a wrapped `__tcfapi` call may take to call back, in ms.
const CALLBACK_TIMEOUT_MS: u32 = 2000;

pub const API_DEFINED: &str = "typeof window.__tcfapi === 'function'";

/// Resolves to the ping return object, or `null`.
pub fn ping() -> String {
    tcfapi_promise("ping", "(ping) => resolve(ping || null)")
}

/// Resolves to `{ tcString, eventStatus }`, or `null`.
pub fn tc_data() -> String {
    tcfapi_promise(
        "getTCData",
        "(data, success) => resolve(success && data \
         ? { tcString: data.tcString, eventStatus: data.eventStatus } : null)",
    )
}

fn tcfapi_promise(command: &str, callback: &str) -> String {
    format!(
        "new Promise((resolve) => {{\n\
         \x20 if (typeof window.__tcfapi !== 'function') {{ resolve(null); return; }}\n\
         \x20 setTimeout(() => resolve(null), {timeout});\n\
         \x20 try {{ window.__tcfapi('{command}', 2, {callback}); }} catch (e) {{ resolve(null); }}\n\
         }})",
        timeout = CALLBACK_TIMEOUT_MS,
    )
}

/// Writes `tc_string` into the consent cookies and local-storage keys.
pub fn inject_consent(tc_string: &str) -> String {
    // A JSON string literal is a valid JS string literal.
    let literal = serde_json::Value::String(tc_string.to_string()).to_string();
    let mut script = format!("(() => {{\n  const tc = {literal};\n");
    for key in CONSENT_KEYS {
        script.push_str(&format!("  document.cookie = '{key}=' + tc + '; path=/';\n"));
    }
    for key in CONSENT_KEYS {
        script.push_str(&format!("  localStorage.setItem('{key}', tc);\n"));
    }
    script.push_str("  return true;\n})()");
    script
}

/// Decode one field on its own; a value of the wrong type reads as absent.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// A CMP identity field; values wider than 12 bits read as absent.
fn lenient_id<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient::<D, u16>(deserializer)?.filter(|id| *id <= MAX_CMP_FIELD))
}

/// Ping fields the session reads. Each field is decoded independently.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingReturn {
    #[serde(default, deserialize_with = "lenient_id")]
    pub cmp_id: Option<u16>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub cmp_version: Option<u16>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub gvl_version: Option<u16>,
    #[serde(default, deserialize_with = "lenient")]
    pub display_status: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcDataReturn {
    #[serde(default, deserialize_with = "lenient")]
    pub tc_string: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub event_status: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injection_quotes_string() {
        let script = inject_consent("CQ'x\"y");
        assert!(script.contains(r#"const tc = "CQ'x\"y";"#));
        assert_eq!(script.matches("document.cookie").count(), 2);
        assert!(script.contains("localStorage.setItem('eupubconsent-v2', tc)"));
    }

    #[test]
    fn test_promise_wrappers_guard_missing_api() {
        for script in [ping(), tc_data()] {
            assert!(script.starts_with("new Promise"));
            assert!(script.contains("typeof window.__tcfapi !== 'function'"));
            assert!(script.contains("setTimeout"));
        }
        assert!(tc_data().contains("'getTCData', 2"));
    }

    #[test]
    fn test_ping_decodes_partial_objects() {
        let ping: PingReturn =
            serde_json::from_value(serde_json::json!({ "cmpId": 28, "gvlVersion": null }))
                .unwrap();
        assert_eq!(ping.cmp_id, Some(28));
        assert_eq!(ping.cmp_version, None);
        assert_eq!(ping.gvl_version, None);
    }

    #[test]
    fn test_ping_bad_field_keeps_the_others() {
        let ping: PingReturn = serde_json::from_value(serde_json::json!({
            "cmpId": 10,
            "cmpVersion": "2.1",
            "gvlVersion": 150,
            "displayStatus": "hidden",
        }))
        .unwrap();
        assert_eq!(ping.cmp_id, Some(10));
        assert_eq!(ping.cmp_version, None);
        assert_eq!(ping.gvl_version, Some(150));
        assert_eq!(ping.display_status.as_deref(), Some("hidden"));
    }

    #[test]
    fn test_ping_ids_wider_than_12_bits_are_absent() {
        let ping: PingReturn = serde_json::from_value(serde_json::json!({
            "cmpId": 4095,
            "cmpVersion": 4096,
            "gvlVersion": -3,
        }))
        .unwrap();
        assert_eq!(ping.cmp_id, Some(4095));
        assert_eq!(ping.cmp_version, None);
        assert_eq!(ping.gvl_version, None);
    }

    #[test]
    fn test_tc_data_non_string_fields_are_absent() {
        let tc_data: TcDataReturn = serde_json::from_value(serde_json::json!({
            "tcString": 17,
            "eventStatus": "tcloaded",
        }))
        .unwrap();
        assert_eq!(tc_data.tc_string, None);
        assert_eq!(tc_data.event_status.as_deref(), Some("tcloaded"));
    }
}
