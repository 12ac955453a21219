use crate::error::{Error, Result};
use rand::RngCore;
use serde_json::{Value, json};
use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Storage tag marking a JSON object as an encoded ObjectId.
pub const OBJECTID_TAG: &str = "__neosqlite_objectid__";

static COUNTER: AtomicU32 = AtomicU32::new(0);
static PROCESS_RANDOM: OnceLock<[u8; 5]> = OnceLock::new();

fn process_random() -> &'static [u8; 5] {
    PROCESS_RANDOM.get_or_init(|| {
        let mut bytes = [0u8; 5];
        rand::thread_rng().fill_bytes(&mut bytes);
        COUNTER.store(rand::thread_rng().next_u32() & 0x00ff_ffff, Ordering::SeqCst);
        bytes
    })
}

/// 12-byte document identifier: 4-byte big-endian seconds since epoch,
/// 5-byte per-process random component, 3-byte incrementing counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 12]);

impl ObjectId {
    pub fn new() -> Self {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let random = process_random();
        let count = COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00ff_ffff;

        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(random);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 12] {
        self.0
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::MalformedQuery(format!("invalid ObjectId: {s:?}")));
        }
        let mut bytes = [0u8; 12];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).expect("ascii hex");
            bytes[i] = u8::from_str_radix(hex, 16).expect("ascii hex");
        }
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Seconds-since-epoch encoded in the leading 4 bytes.
    pub fn timestamp(&self) -> i64 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]) as i64
    }

    /// Tagged-object storage encoding.
    pub fn to_value(&self) -> Value {
        json!({ OBJECTID_TAG: true, "id": self.to_hex() })
    }

    pub fn from_value(v: &Value) -> Option<Self> {
        let hex = objectid_hex(v)?;
        Self::parse_str(hex).ok()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hex payload of an encoded ObjectId, if `v` carries the storage tag.
pub fn objectid_hex(v: &Value) -> Option<&str> {
    let obj = v.as_object()?;
    if obj.get(OBJECTID_TAG)?.as_bool() != Some(true) {
        return None;
    }
    obj.get("id")?.as_str()
}

pub fn is_objectid_value(v: &Value) -> bool {
    objectid_hex(v).is_some()
}

/// True for a 24-character hex string, the textual ObjectId form.
pub fn is_hex24(s: &str) -> bool {
    s.len() == 24 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Validate the tagged encoding of every ObjectId nested in `v`.
pub fn validate_objectids(v: &Value) -> Result<()> {
    match v {
        Value::Object(map) => {
            if map.contains_key(OBJECTID_TAG) && objectid_hex(v).is_none() {
                return Err(Error::MalformedDocument(
                    "invalid ObjectId encoding".into(),
                ));
            }
            for item in map.values() {
                validate_objectids(item)?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                validate_objectids(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Normalise a user-supplied `_id` value into its stored representation.
///
/// Hex-24 strings and tagged objects both normalise to the tagged form so
/// identifier-type mistakes in filters and inserts still line up.
pub fn normalize_id_value(v: &Value) -> Value {
    match v {
        Value::String(s) if is_hex24(s) => json!({ OBJECTID_TAG: true, "id": s.to_lowercase() }),
        other => other.clone(),
    }
}

pub fn id_values_equal(a: &Value, b: &Value) -> bool {
    match (objectid_hex(a), objectid_hex(b)) {
        (Some(ha), Some(hb)) => ha.eq_ignore_ascii_case(hb),
        (Some(h), None) => b.as_str().is_some_and(|s| s.eq_ignore_ascii_case(h)),
        (None, Some(h)) => a.as_str().is_some_and(|s| s.eq_ignore_ascii_case(h)),
        (None, None) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_ordered() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_hex().len(), 24);
        assert!(a.timestamp() > 0);
    }

    #[test]
    fn hex_round_trip() {
        let oid = ObjectId::new();
        let parsed = ObjectId::parse_str(&oid.to_hex()).unwrap();
        assert_eq!(oid, parsed);
    }

    #[test]
    fn tagged_value_round_trip() {
        let oid = ObjectId::new();
        let v = oid.to_value();
        assert!(is_objectid_value(&v));
        assert_eq!(ObjectId::from_value(&v), Some(oid));
    }

    #[test]
    fn hex_string_and_tagged_form_compare_equal() {
        let oid = ObjectId::new();
        let tagged = oid.to_value();
        let hex = Value::String(oid.to_hex());
        assert!(id_values_equal(&tagged, &hex));
    }
}
