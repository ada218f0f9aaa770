//! RFC 8785 canonical JSON. Manifest hashes, signatures, section files and
//! restored record bodies all go through here.

use anyhow::{Context, Result};
use serde::Serialize;

pub fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_jcs::to_vec(value).context("failed to serialize canonical json")
}

pub fn to_string<T: Serialize>(value: &T) -> Result<String> {
    serde_jcs::to_string(value).context("failed to serialize canonical json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keys_sorted_arrays_kept() {
        let alert = json!({
            "severity": "high",
            "alert_id": "a1",
            "tags": ["lateral", "exfil"],
            "score": 1.0
        });
        assert_eq!(
            to_string(&alert).unwrap(),
            r#"{"alert_id":"a1","score":1,"severity":"high","tags":["lateral","exfil"]}"#
        );
    }
}
