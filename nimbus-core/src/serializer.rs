//! Command payload serialization.
//!
//! Every control message is a serde value type; the [`Serializer`] chooses
//! the binary format the cluster runs with. Postcard is the default for its
//! compact deterministic output; CBOR is available for debugging captures
//! with external tooling. The chosen format travels with the configuration,
//! so controller and workers always agree.

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::config::{self, Config};

/// Shorthand for payload types that can cross the command bus.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// A binary serialization format for command payloads.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Serialize `value` in this format.
    pub fn to_bytes<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
            Self::Cbor => {
                let mut result = Vec::new();
                ciborium::into_writer(value, &mut result)?;
                Ok(result)
            }
        }
    }

    /// Deserialize a value of type `T` from `bytes`.
    pub fn from_bytes<T: for<'a> Deserialize<'a>>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Payload {
        id: u64,
        name: String,
    }

    #[test]
    fn round_trips_in_both_formats() {
        let payload = Payload {
            id: 42,
            name: "pressure-left".into(),
        };
        for serializer in [Serializer::Postcard, Serializer::Cbor] {
            let bytes = serializer.to_bytes(&payload).unwrap();
            let back: Payload = serializer.from_bytes(&bytes).unwrap();
            assert_eq!(back, payload);
        }
    }

    #[test]
    fn postcard_is_deterministic() {
        let payload = Payload {
            id: 7,
            name: "levelset".into(),
        };
        let a = Serializer::Postcard.to_bytes(&payload).unwrap();
        let b = Serializer::Postcard.to_bytes(&payload).unwrap();
        assert_eq!(a, b);
    }
}
