//! Opaque identifiers
//!
//! Job ids name a directory under the worker's working dir, so every
//! identifier is restricted to a filesystem-safe alphabet.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::ParseError;

const MAX_ID_LEN: usize = 255;

fn validate(raw: &str) -> Result<(), ParseError> {
    let valid = !raw.is_empty()
        && raw.len() <= MAX_ID_LEN
        && raw != "."
        && raw != ".."
        && raw
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));

    if valid {
        Ok(())
    } else {
        Err(ParseError::Identifier(raw.to_string()))
    }
}

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            /// Parses and validates an identifier
            pub fn parse(raw: impl Into<String>) -> Result<Self, ParseError> {
                let raw = raw.into();
                validate(&raw)?;
                Ok(Self(raw))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = ParseError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::parse(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

identifier!(
    /// Identifier of a job
    JobId
);

identifier!(
    /// Identifier of a storage entry (and of its blob)
    StorageId
);

impl StorageId {
    /// Generates a fresh random storage id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_ids() {
        assert_eq!(JobId::parse("job-1").unwrap().as_str(), "job-1");
        assert!(JobId::parse("4f1c2a9e-5d0b-4c61-9a57-0f3c3e1d2b7a").is_ok());
        assert!(StorageId::parse("out_2.v1").is_ok());
    }

    #[test]
    fn test_rejects_path_like_ids() {
        for raw in ["", ".", "..", "../etc", "a/b", "a b", "job\n"] {
            assert!(JobId::parse(raw).is_err(), "{raw:?} should be rejected");
        }
        assert!(JobId::parse("x".repeat(256)).is_err());
    }

    #[test]
    fn test_generated_storage_ids_are_valid_and_distinct() {
        let a = StorageId::generate();
        let b = StorageId::generate();
        assert_ne!(a, b);
        assert!(StorageId::parse(a.as_str()).is_ok());
    }

    #[test]
    fn test_serde_validates() {
        let id: JobId = serde_json::from_str("\"job-1\"").unwrap();
        assert_eq!(id.as_str(), "job-1");
        assert!(serde_json::from_str::<JobId>("\"../x\"").is_err());
    }
}
