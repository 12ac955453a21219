use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

/// Storage tag marking a JSON object as an encoded Binary value.
pub const BINARY_TAG: &str = "__neosqlite_binary__";

pub const SUBTYPE_GENERIC: u8 = 0;
pub const SUBTYPE_FUNCTION: u8 = 1;
pub const SUBTYPE_UUID: u8 = 4;
pub const SUBTYPE_MD5: u8 = 5;
pub const SUBTYPE_USER_DEFINED: u8 = 128;

/// Tagged byte string with an 8-bit subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    data: Vec<u8>,
    subtype: u8,
}

impl Binary {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            subtype: SUBTYPE_GENERIC,
        }
    }

    pub fn with_subtype(data: impl Into<Vec<u8>>, subtype: u8) -> Self {
        Self {
            data: data.into(),
            subtype,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn subtype(&self) -> u8 {
        self.subtype
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Tagged-object storage encoding with a base64 payload.
    pub fn to_value(&self) -> Value {
        json!({
            BINARY_TAG: true,
            "data": BASE64.encode(&self.data),
            "subtype": self.subtype,
        })
    }

    pub fn from_value(v: &Value) -> Result<Self> {
        let obj = v
            .as_object()
            .filter(|o| o.get(BINARY_TAG).and_then(Value::as_bool) == Some(true))
            .ok_or_else(|| Error::MalformedDocument("not a Binary value".into()))?;
        let payload = obj
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedDocument("Binary missing data".into()))?;
        let subtype = obj
            .get("subtype")
            .and_then(Value::as_u64)
            .filter(|n| *n <= u8::MAX as u64)
            .ok_or_else(|| Error::MalformedDocument("Binary subtype out of range".into()))?;
        let data = BASE64
            .decode(payload)
            .map_err(|e| Error::MalformedDocument(format!("Binary payload: {e}")))?;
        Ok(Self {
            data,
            subtype: subtype as u8,
        })
    }
}

impl From<Vec<u8>> for Binary {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

pub fn is_binary_value(v: &Value) -> bool {
    v.as_object()
        .is_some_and(|o| o.get(BINARY_TAG).and_then(Value::as_bool) == Some(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_round_trip() {
        let bin = Binary::with_subtype(vec![0u8, 1, 2, 255], SUBTYPE_USER_DEFINED);
        let v = bin.to_value();
        assert!(is_binary_value(&v));
        assert_eq!(Binary::from_value(&v).unwrap(), bin);
    }

    #[test]
    fn rejects_out_of_range_subtype() {
        let v = json!({ BINARY_TAG: true, "data": "AA==", "subtype": 300 });
        assert!(Binary::from_value(&v).is_err());
    }
}
