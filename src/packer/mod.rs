//! Message-encoding pipeline.
//!
//! A [`Packer`] is the ordered composition of a serializer, a compressor,
//! and a byte encoder; it turns a JSON value into the transport string
//! carried in a task envelope's `body` field, and back.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde_json::Value;

use crate::error::{Result, TaskwireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Json,
    Yaml,
}

impl Serializer {
    /// MIME type advertised in the task envelope's `content-type`.
    pub fn content_type(&self) -> &'static str {
        match self {
            Serializer::Json => "application/json",
            Serializer::Yaml => "application/x-yaml",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Identity,
    Zlib,
    Gzip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoder {
    Plaintext,
    Base64,
}

impl Encoder {
    /// Value advertised in the task envelope's `body_encoding`.
    pub fn body_encoding(&self) -> &'static str {
        match self {
            Encoder::Plaintext => "utf-8",
            Encoder::Base64 => "base64",
        }
    }
}

/// Serializer, compressor, and encoder composition.
///
/// The default pipeline is JSON, uncompressed, base64-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packer {
    serializer: Serializer,
    compressor: Compressor,
    encoder: Encoder,
}

impl Default for Packer {
    fn default() -> Self {
        Self::new(Serializer::Json, Compressor::Identity, Encoder::Base64)
    }
}

impl Packer {
    pub fn new(serializer: Serializer, compressor: Compressor, encoder: Encoder) -> Self {
        Self {
            serializer,
            compressor,
            encoder,
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    pub fn encoder(&self) -> Encoder {
        self.encoder
    }

    /// Serializes, compresses, and encodes `value` into a transport string.
    ///
    /// Plaintext encoding requires the identity compressor: compressed
    /// bytes are not UTF-8 and must ride base64.
    pub fn pack(&self, value: &Value) -> Result<String> {
        let serialized = match self.serializer {
            Serializer::Json => serde_json::to_vec(value)?,
            Serializer::Yaml => serde_yaml::to_string(value)?.into_bytes(),
        };

        let compressed = match self.compressor {
            Compressor::Identity => serialized,
            Compressor::Zlib => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&serialized)?;
                encoder.finish()?
            }
            Compressor::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(&serialized)?;
                encoder.finish()?
            }
        };

        match self.encoder {
            Encoder::Plaintext => {
                if self.compressor != Compressor::Identity {
                    return Err(TaskwireError::Serialization(
                        "plaintext encoding requires the identity compressor".into(),
                    ));
                }
                Ok(String::from_utf8(compressed)?)
            }
            Encoder::Base64 => Ok(BASE64.encode(&compressed)),
        }
    }

    /// Inverse of [`pack`](Self::pack).
    pub fn unpack(&self, packed: &str) -> Result<Value> {
        let encoded = match self.encoder {
            Encoder::Plaintext => packed.as_bytes().to_vec(),
            Encoder::Base64 => BASE64.decode(packed)?,
        };

        let serialized = match self.compressor {
            Compressor::Identity => encoded,
            Compressor::Zlib => {
                let mut decoded = Vec::new();
                ZlibDecoder::new(encoded.as_slice()).read_to_end(&mut decoded)?;
                decoded
            }
            Compressor::Gzip => {
                let mut decoded = Vec::new();
                GzDecoder::new(encoded.as_slice()).read_to_end(&mut decoded)?;
                decoded
            }
        };

        match self.serializer {
            Serializer::Json => Ok(serde_json::from_slice(&serialized)?),
            Serializer::Yaml => Ok(serde_yaml::from_slice(&serialized)?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> Value {
        json!({
            "arr": [0, 5, 10],
            "num": 15,
            "obj": { "bar": 10, "foo": 5 },
            "str": "foo",
        })
    }

    #[test]
    fn every_supported_combination_round_trips() {
        let serializers = [Serializer::Json, Serializer::Yaml];
        let compressors = [Compressor::Identity, Compressor::Zlib, Compressor::Gzip];
        let encoders = [Encoder::Plaintext, Encoder::Base64];

        let value = fixture();
        for serializer in serializers {
            for compressor in compressors {
                for encoder in encoders {
                    if encoder == Encoder::Plaintext && compressor != Compressor::Identity {
                        continue;
                    }
                    let packer = Packer::new(serializer, compressor, encoder);
                    let packed = packer.pack(&value).unwrap();
                    assert_eq!(
                        packer.unpack(&packed).unwrap(),
                        value,
                        "{serializer:?}/{compressor:?}/{encoder:?}"
                    );
                }
            }
        }
    }

    #[test]
    fn default_packer_is_base64_of_the_json_text() {
        let value = fixture();
        let packed = Packer::default().pack(&value).unwrap();
        let expected = BASE64.encode(serde_json::to_vec(&value).unwrap());
        assert_eq!(packed, expected);
    }

    #[test]
    fn plaintext_refuses_compressed_bytes() {
        let packer = Packer::new(Serializer::Json, Compressor::Zlib, Encoder::Plaintext);
        assert!(matches!(
            packer.pack(&fixture()),
            Err(TaskwireError::Serialization(_))
        ));
    }

    #[test]
    fn corrupt_base64_fails_to_unpack() {
        let packer = Packer::default();
        assert!(packer.unpack("not//valid==base64!").is_err());
    }
}
