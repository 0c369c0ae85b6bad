//! Boolean flag parsing for environment and config values.
//!
//! Recognized spellings are `true/1/yes` and `false/0/no`, case-insensitive.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Parse a boolean flag. Returns `None` for unrecognized spellings.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Raw shapes a flag may arrive in (TOML bool, parsed env int, or text).
#[derive(Deserialize)]
#[serde(untagged)]
enum FlagRepr {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl FlagRepr {
    fn resolve(self) -> Result<bool, String> {
        match self {
            FlagRepr::Bool(b) => Ok(b),
            FlagRepr::Int(1) => Ok(true),
            FlagRepr::Int(0) => Ok(false),
            FlagRepr::Int(n) => Err(format!("unrecognized boolean value '{}'", n)),
            FlagRepr::Text(s) => {
                parse_flag(&s).ok_or_else(|| format!("unrecognized boolean value '{}'", s))
            }
        }
    }
}

/// Strict flag deserializer: unrecognized spellings are an error.
pub fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    FlagRepr::deserialize(deserializer)?
        .resolve()
        .map_err(D::Error::custom)
}

/// Lenient optional flag: unrecognized spellings collapse to `None`.
pub fn deserialize_optional_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<FlagRepr>::deserialize(deserializer)?.and_then(|repr| repr.resolve().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recognized_spellings() {
        for v in ["true", "TRUE", "1", "yes", "Yes", " true "] {
            assert_eq!(parse_flag(v), Some(true), "{v}");
        }
        for v in ["false", "False", "0", "no", "NO"] {
            assert_eq!(parse_flag(v), Some(false), "{v}");
        }
    }

    #[test]
    fn test_unrecognized_spellings() {
        assert_eq!(parse_flag("on"), None);
        assert_eq!(parse_flag(""), None);
        assert_eq!(parse_flag("maybe"), None);
    }

    #[derive(Deserialize)]
    struct Probe {
        #[serde(deserialize_with = "deserialize_flag")]
        strict: bool,
        #[serde(default, deserialize_with = "deserialize_optional_flag")]
        lenient: Option<bool>,
    }

    #[test]
    fn test_serde_helpers() {
        let p: Probe = serde_json::from_str(r#"{"strict": "yes", "lenient": "whatever"}"#).unwrap();
        assert!(p.strict);
        assert_eq!(p.lenient, None);

        let p: Probe = serde_json::from_str(r#"{"strict": 0, "lenient": "NO"}"#).unwrap();
        assert!(!p.strict);
        assert_eq!(p.lenient, Some(false));

        let p: Probe = serde_json::from_str(r#"{"strict": true}"#).unwrap();
        assert_eq!(p.lenient, None);

        assert!(serde_json::from_str::<Probe>(r#"{"strict": "perhaps"}"#).is_err());
    }
}
