//! Document codecs.
//!
//! The byte layout is whatever serde produces for [`Document`]: JSON text
//! for [`TextWire`], bincode for [`BinaryWire`]. Both ends of a connection
//! must use the same codec.

use bytes::Bytes;
use kvtree_core_store::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::Document;

/// Encodes and decodes whole documents.
pub trait WireCodec: Send + Sync + std::fmt::Debug {
    fn encode(&self, document: &Document) -> Result<Bytes>;

    fn decode(&self, bytes: &[u8]) -> Result<Document>;

    fn name(&self) -> &'static str;
}

/// Human-readable JSON documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextWire;

impl WireCodec for TextWire {
    fn encode(&self, document: &Document) -> Result<Bytes> {
        let bytes = serde_json::to_vec(document).map_err(|e| Error::Codec {
            message: e.to_string(),
        })?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec {
            message: e.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "text"
    }
}

/// Compact bincode documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryWire;

impl WireCodec for BinaryWire {
    fn encode(&self, document: &Document) -> Result<Bytes> {
        let bytes = bincode::serialize(document).map_err(|e| Error::Codec {
            message: e.to_string(),
        })?;
        Ok(Bytes::from(bytes))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Document> {
        bincode::deserialize(bytes).map_err(|e| Error::Codec {
            message: e.to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "binary"
    }
}

/// Selects a codec by name in configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireType {
    Text,
    #[default]
    Binary,
}

impl WireType {
    pub fn codec(&self) -> std::sync::Arc<dyn WireCodec> {
        match self {
            WireType::Text => std::sync::Arc::new(TextWire),
            WireType::Binary => std::sync::Arc::new(BinaryWire),
        }
    }
}
