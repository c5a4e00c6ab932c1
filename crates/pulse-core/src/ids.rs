use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an identifier issued by the source platform.
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

branded_id!(RecordId, "rec");
branded_id!(ResponderId, "usr");
branded_id!(DeadLetterId, "dlq");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_id_has_prefix() {
        let id = RecordId::new();
        assert!(id.as_str().starts_with("rec_"), "got: {id}");
    }

    #[test]
    fn responder_id_has_prefix() {
        let id = ResponderId::new();
        assert!(id.as_str().starts_with("usr_"), "got: {id}");
    }

    #[test]
    fn dead_letter_id_has_prefix() {
        let id = DeadLetterId::new();
        assert!(id.as_str().starts_with("dlq_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = RecordId::new();
        let b = RecordId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_preserves_platform_id() {
        let id = RecordId::from_raw("00Q5f000001abcEAC");
        assert_eq!(id.as_str(), "00Q5f000001abcEAC");
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = RecordId::new();
        let s = id.to_string();
        let parsed: RecordId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let id = ResponderId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: ResponderId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }
}
