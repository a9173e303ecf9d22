//! Wire messages exchanged by the placement protocol.
//!
//! Every message carries the protocol round it belongs to. Envelopes are
//! JSON on the wire; index payloads are already compact binary and travel
//! as hex strings inside the JSON.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::{Count, NodeId};

/// Key representation → observed access count.
pub type KeyCounts = HashMap<String, Count>;

/// Demand a node reports to one key owner for one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DemandReportMessage {
    pub round: u64,
    pub key_counts: KeyCounts,
}

impl DemandReportMessage {
    pub fn new(round: u64, key_counts: KeyCounts) -> Self {
        Self { round, key_counts }
    }

    /// A report with no demand, sent so the receiver can count the sender.
    pub fn empty(round: u64) -> Self {
        Self::new(round, KeyCounts::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnouncePhase {
    /// Carries a freshly trained relocation index.
    Setting,
    /// Tells the coordinator that every index has been installed.
    Ack,
}

/// Relocation index broadcast, or the ack that follows installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexAnnounceMessage {
    pub round: u64,
    pub phase: AnnouncePhase,
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<u8>,
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub classifier: Vec<u8>,
}

impl IndexAnnounceMessage {
    pub fn setting(round: u64, filter: Vec<u8>, classifier: Vec<u8>) -> Self {
        Self {
            round,
            phase: AnnouncePhase::Setting,
            filter,
            classifier,
        }
    }

    pub fn ack(round: u64) -> Self {
        Self {
            round,
            phase: AnnouncePhase::Ack,
            filter: Vec::new(),
            classifier: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    DemandReport(DemandReportMessage),
    IndexAnnounce(IndexAnnounceMessage),
}

impl Message {
    pub fn round(&self) -> u64 {
        match self {
            Message::DemandReport(m) => m.round,
            Message::IndexAnnounce(m) => m.round,
        }
    }
}

/// A message together with the node that sent it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: NodeId,
    pub message: Message,
}

impl Envelope {
    pub fn new(from: NodeId, message: Message) -> Self {
        Self { from, message }
    }

    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CoreError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| CoreError::Decode(e.to_string()))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T, S>(bytes: T, serializer: S) -> Result<S::Ok, S::Error>
    where
        T: AsRef<[u8]>,
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}
