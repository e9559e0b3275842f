//! Seeds are 64-bit and must survive JSON consumers that clamp integers to
//! f64 precision, so they serialize as strings but deserialize from either
//! form.

use serde::de::Error;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&value.to_string())
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SeedRepr {
        Text(String),
        Numeric(u64),
    }

    match SeedRepr::deserialize(deserializer)? {
        SeedRepr::Text(raw) => raw
            .parse::<u64>()
            .map_err(|err| D::Error::custom(format!("invalid u64 string {raw:?}: {err}"))),
        SeedRepr::Numeric(value) => Ok(value),
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
    struct Wrapper {
        #[serde(with = "super")]
        seed: u64,
    }

    #[test]
    fn serializes_as_string() {
        let encoded = serde_json::to_string(&Wrapper { seed: u64::MAX }).expect("serialize");
        assert_eq!(encoded, r#"{"seed":"18446744073709551615"}"#);
    }

    #[test]
    fn deserialize_accepts_string_and_number() {
        let from_string: Wrapper = serde_json::from_str(r#"{"seed":"2026"}"#).expect("string seed");
        let from_number: Wrapper = serde_json::from_str(r#"{"seed":2026}"#).expect("numeric seed");
        assert_eq!(from_string, from_number);
    }

    #[test]
    fn rejects_non_numeric_string() {
        let parsed: Result<Wrapper, _> = serde_json::from_str(r#"{"seed":"not-a-seed"}"#);
        assert!(parsed.is_err());
    }
}
