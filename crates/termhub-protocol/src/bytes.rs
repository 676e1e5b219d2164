//! Byte-payload serialization helper.

/// Serde adapter encoding `Vec<u8>` as a base64 string.
///
/// Terminal input/output is an opaque byte stream and frequently not valid
/// UTF-8; encoding it keeps the JSON wire form compact and lossless.
/// Usage: `#[serde(with = "termhub_protocol::base64_bytes")]`.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
