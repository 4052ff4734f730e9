//! Binary buffers travel as base64 strings inside the JSON envelope.
//!
//! Used as `#[serde(default, with = "crate::buffers")]`.

use base64::prelude::*;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub fn serialize<S>(buffers: &[Bytes], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    buffers
        .iter()
        .map(|buf| BASE64_STANDARD.encode(buf))
        .collect::<Vec<_>>()
        .serialize(serializer)
}

/// `null` and a missing field both decode to no buffers.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Bytes>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded = Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default();
    encoded
        .into_iter()
        .map(|s| {
            BASE64_STANDARD
                .decode(s.as_bytes())
                .map(Bytes::from)
                .map_err(serde::de::Error::custom)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Frame {
        #[serde(default, with = "crate::buffers")]
        buffers: Vec<Bytes>,
    }

    #[test]
    fn test_buffers_are_base64_on_the_wire() {
        let frame = Frame {
            buffers: vec![Bytes::from_static(b"\x00\x01plot")],
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["buffers"][0], "AAFwbG90");
    }

    #[test]
    fn test_null_and_missing_buffers_are_empty() {
        let null: Frame = serde_json::from_str(r#"{"buffers": null}"#).unwrap();
        let missing: Frame = serde_json::from_str("{}").unwrap();
        assert!(null.buffers.is_empty());
        assert!(missing.buffers.is_empty());
    }

    #[test]
    fn test_invalid_base64_is_rejected() {
        let result = serde_json::from_str::<Frame>(r#"{"buffers": ["not base64!"]}"#);
        assert!(result.is_err());
    }
}
