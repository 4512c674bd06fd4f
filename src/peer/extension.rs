use super::error::PeerError;
use super::metadata::MetadataMessage;
use crate::bencode::{decode, encode, Dict, Value};
use bytes::Bytes;
use std::collections::BTreeMap;

pub const EXTENSION_HANDSHAKE_ID: u8 = 0;

/// The id we ask peers to use when they send us ut_metadata messages.
pub const UT_METADATA_ID: u8 = 1;

pub const UT_METADATA: &str = "ut_metadata";

/// The BEP-10 extension handshake dictionary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtensionHandshake {
    /// Extension name to the id the sender wants to receive it under.
    pub extensions: BTreeMap<String, u8>,
    pub client: Option<String>,
    pub reqq: Option<i64>,
    pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own handshake: ut_metadata under [`UT_METADATA_ID`], plus the
    /// metadata size once we have the info dictionary.
    pub fn local(client: &str, reqq: usize, metadata_size: Option<usize>) -> Self {
        let mut hs = Self::new();
        hs.extensions.insert(UT_METADATA.to_string(), UT_METADATA_ID);
        hs.client = Some(client.to_string());
        hs.reqq = Some(reqq as i64);
        hs.metadata_size = metadata_size.map(|s| s as i64);
        hs
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut dict = Dict::new();

        let m: Dict = self
            .extensions
            .iter()
            .map(|(name, id)| {
                (
                    Bytes::copy_from_slice(name.as_bytes()),
                    Value::Integer(*id as i64),
                )
            })
            .collect();
        dict.insert("m", Value::Dict(m));

        if let Some(size) = self.metadata_size {
            dict.insert("metadata_size", Value::Integer(size));
        }

        if let Some(reqq) = self.reqq {
            dict.insert("reqq", Value::Integer(reqq));
        }

        if let Some(ref client) = self.client {
            dict.insert("v", Value::string(client));
        }

        Ok(Bytes::from(encode(&Value::Dict(dict))?))
    }

    pub fn decode(data: &[u8]) -> Result<Self, PeerError> {
        let value = decode(data)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::Extension("expected dict".into()))?;

        let mut hs = Self::new();

        if let Some(m) = dict.get(b"m").and_then(Value::as_dict) {
            for (key, val) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(key), val.as_integer()) else {
                    continue;
                };
                // Id 0 means the sender disabled the extension.
                match u8::try_from(id) {
                    Ok(0) | Err(_) => {}
                    Ok(id) => {
                        hs.extensions.insert(name.to_string(), id);
                    }
                }
            }
        }

        hs.client = dict.get(b"v").and_then(Value::as_str).map(String::from);
        hs.reqq = dict.get(b"reqq").and_then(Value::as_integer);
        hs.metadata_size = dict
            .get(b"metadata_size")
            .and_then(Value::as_integer)
            .filter(|&size| size > 0);

        Ok(hs)
    }

    pub fn get_extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }

    /// The id to put on ut_metadata messages sent to this peer, if it
    /// supports the extension.
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.get_extension_id(UT_METADATA)
    }
}

/// A decoded Extended (id 20) message addressed to us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionMessage {
    Handshake(ExtensionHandshake),
    Metadata(MetadataMessage),
    /// A sub-message for an extension we never advertised.
    Unknown { id: u8, payload: Bytes },
}

impl ExtensionMessage {
    pub fn decode(id: u8, payload: &[u8]) -> Result<Self, PeerError> {
        match id {
            EXTENSION_HANDSHAKE_ID => Ok(ExtensionMessage::Handshake(
                ExtensionHandshake::decode(payload)?,
            )),
            UT_METADATA_ID => Ok(ExtensionMessage::Metadata(MetadataMessage::decode(
                payload,
            )?)),
            _ => Ok(ExtensionMessage::Unknown {
                id,
                payload: Bytes::copy_from_slice(payload),
            }),
        }
    }
}
