//! Serde helpers for services that send numbers as strings

use serde::{Deserialize, Deserializer};

/// Deserialize a `u64` from either a JSON number or a numeric string.
///
/// ACS sends `expires_in` as `"86399"` and SharePoint's verbose OData sends
/// file `Length` the same way.
pub fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(u64),
        Text(String),
    }

    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
