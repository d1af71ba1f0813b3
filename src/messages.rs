// Copyright 2021 The Ostraka Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Wire messages gossiped between nodes.
//!
//! Every payload carries a structural sanity check mapped to
//! `InvalidMessage` and a short fingerprint for logging.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use crate::{
    block::Block,
    consensus::{Hrs, Proposal, Vote},
    crypto::Hash,
    encoding::{Canonical, CodecError, TagReader, TagWriter},
    error::{Error, Result},
    helpers::Height,
    transaction::Tx,
};

const TAG_PAYLOAD_TYPE: u8 = 1;
const TAG_PAYLOAD: u8 = 2;
const TAG_BLOCK_HEIGHT: u8 = 2;
const TAG_BLOCK: u8 = 3;

/// Discriminant of a wire message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadType {
    /// A consensus vote.
    Vote = 1,
    /// A block proposal.
    Proposal = 2,
    /// A committed block at a height.
    Block = 3,
    /// A batch of transactions.
    Txs = 4,
    /// A request for transactions by ID.
    TxsReq = 5,
    /// The sender's position in the protocol.
    HeartBeat = 6,
}

impl PayloadType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Vote),
            2 => Some(Self::Proposal),
            3 => Some(Self::Block),
            4 => Some(Self::Txs),
            5 => Some(Self::TxsReq),
            6 => Some(Self::HeartBeat),
            _ => None,
        }
    }
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Vote => "vote",
            Self::Proposal => "proposal",
            Self::Block => "block",
            Self::Txs => "txs",
            Self::TxsReq => "txs-req",
            Self::HeartBeat => "heart-beat",
        };
        f.write_str(name)
    }
}

/// A message exchanged over the gossip network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum Message {
    /// A consensus vote.
    Vote(Vote),
    /// A block proposal.
    Proposal(Proposal),
    /// A committed block.
    Block {
        /// Height the block was committed at.
        height: Height,
        /// The committed block.
        block: Block,
    },
    /// A batch of transactions, sent on acceptance or as a reply to
    /// `TxsReq`.
    Txs(Vec<Tx>),
    /// A request for the transactions with the given IDs.
    TxsReq(Vec<Hash>),
    /// The sender's height, round and step.
    HeartBeat(Hrs),
}

impl Message {
    /// Returns the payload discriminant.
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::Vote(_) => PayloadType::Vote,
            Self::Proposal(_) => PayloadType::Proposal,
            Self::Block { .. } => PayloadType::Block,
            Self::Txs(_) => PayloadType::Txs,
            Self::TxsReq(_) => PayloadType::TxsReq,
            Self::HeartBeat(_) => PayloadType::HeartBeat,
        }
    }

    /// Checks the structural validity of the payload.
    pub fn sanity_check(&self) -> Result<()> {
        let invalid = |err: Error| Error::InvalidMessage(err.to_string());
        match self {
            Self::Vote(vote) => vote.sanity_check().map_err(invalid),
            Self::Proposal(proposal) => proposal.sanity_check().map_err(invalid),
            Self::Block { height, block } => {
                if *height == Height::zero() {
                    return Err(Error::InvalidMessage("block height is zero".into()));
                }
                block.sanity_check().map_err(invalid)
            }
            Self::Txs(txs) => {
                if txs.is_empty() {
                    return Err(Error::InvalidMessage("empty transaction batch".into()));
                }
                for trx in txs {
                    trx.sanity_check().map_err(invalid)?;
                }
                Ok(())
            }
            Self::TxsReq(ids) => {
                if ids.is_empty() {
                    return Err(Error::InvalidMessage("empty transaction request".into()));
                }
                for id in ids {
                    id.sanity_check()
                        .map_err(|err| Error::InvalidMessage(err.to_string()))?;
                }
                Ok(())
            }
            Self::HeartBeat(hrs) => {
                if hrs.height == Height::zero() {
                    return Err(Error::InvalidMessage("heart beat height is zero".into()));
                }
                Ok(())
            }
        }
    }

    /// Returns the JSON form of the message for operator inspection. The
    /// JSON form is never hashed or signed.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Returns a short identifier for logging.
    pub fn fingerprint(&self) -> String {
        match self {
            Self::Vote(vote) => format!("vote {}", vote.fingerprint()),
            Self::Proposal(proposal) => format!("proposal {}", proposal.fingerprint()),
            Self::Block { height, block } => {
                format!("block {{{} {}}}", height, block.hash().fingerprint())
            }
            Self::Txs(txs) => format!("txs {{{}}}", txs.len()),
            Self::TxsReq(ids) => format!("txs-req {{{}}}", ids.len()),
            Self::HeartBeat(hrs) => format!("heart-beat {{{}}}", hrs),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl Canonical for Message {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u8(TAG_PAYLOAD_TYPE, self.payload_type() as u8);
        match self {
            Self::Vote(vote) => writer.write_bytes(TAG_PAYLOAD, &vote.to_bytes()),
            Self::Proposal(proposal) => writer.write_bytes(TAG_PAYLOAD, &proposal.to_bytes()),
            Self::Block { height, block } => {
                writer.write_u64(TAG_BLOCK_HEIGHT, height.0);
                writer.write_bytes(TAG_BLOCK, &block.to_bytes());
            }
            Self::Txs(txs) => {
                writer.write_seq(TAG_PAYLOAD, txs.len() as u32);
                for trx in txs {
                    writer.write_nested(&trx.to_bytes());
                }
            }
            Self::TxsReq(ids) => {
                writer.write_seq(TAG_PAYLOAD, ids.len() as u32);
                for id in ids {
                    writer.write_nested(id.as_ref());
                }
            }
            Self::HeartBeat(hrs) => {
                let mut nested = TagWriter::new();
                hrs.encode_into(&mut nested);
                writer.write_bytes(TAG_PAYLOAD, &nested.into_bytes());
            }
        }
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let payload_type = PayloadType::from_u8(reader.read_u8(TAG_PAYLOAD_TYPE)?)
            .ok_or_else(|| CodecError::Malformed("unknown payload type".into()))?;
        let message = match payload_type {
            PayloadType::Vote => {
                let payload = reader.read_bytes(TAG_PAYLOAD)?;
                Self::Vote(Vote::from_bytes(&payload)?)
            }
            PayloadType::Proposal => {
                let payload = reader.read_bytes(TAG_PAYLOAD)?;
                Self::Proposal(Proposal::from_bytes(&payload)?)
            }
            PayloadType::Block => {
                let height = Height(reader.read_u64(TAG_BLOCK_HEIGHT)?);
                let payload = reader.read_bytes(TAG_BLOCK)?;
                Self::Block {
                    height,
                    block: Block::from_bytes(&payload)?,
                }
            }
            PayloadType::Txs => {
                let count = reader.read_seq(TAG_PAYLOAD)?;
                let mut txs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let nested = reader.read_nested()?;
                    txs.push(Tx::from_bytes(nested)?);
                }
                Self::Txs(txs)
            }
            PayloadType::TxsReq => {
                let count = reader.read_seq(TAG_PAYLOAD)?;
                let mut ids = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let nested = reader.read_nested()?;
                    ids.push(
                        Hash::from_slice(nested)
                            .ok_or_else(|| CodecError::Malformed("transaction id".into()))?,
                    );
                }
                Self::TxsReq(ids)
            }
            PayloadType::HeartBeat => {
                let payload = reader.read_bytes(TAG_PAYLOAD)?;
                let mut nested = TagReader::new(&payload);
                let hrs = Hrs::decode_from(&mut nested)?;
                nested.finish()?;
                Self::HeartBeat(hrs)
            }
        };
        reader.finish()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        consensus::Step,
        helpers::Round,
    };

    #[test]
    fn heart_beat_round_trip() {
        let message = Message::HeartBeat(Hrs::new(Height(5), Round(1), Step::Prevote));
        let bytes = message.to_bytes();
        let restored = Message::from_bytes(&bytes).unwrap();
        assert_eq!(restored, message);
        assert_eq!(restored.to_bytes(), bytes);
        assert!(message.sanity_check().is_ok());
    }

    #[test]
    fn txs_req_round_trip() {
        let ids = vec![Hash::calc(b"a"), Hash::calc(b"b")];
        let message = Message::TxsReq(ids);
        let restored = Message::from_bytes(&message.to_bytes()).unwrap();
        assert_eq!(restored, message);
        assert_eq!(message.payload_type(), PayloadType::TxsReq);
    }

    #[test]
    fn sanity_rejects_empty_batches() {
        assert!(Message::Txs(vec![]).sanity_check().is_err());
        assert!(Message::TxsReq(vec![]).sanity_check().is_err());
        assert!(Message::TxsReq(vec![Hash::undef()]).sanity_check().is_err());

        let stale = Message::HeartBeat(Hrs::new(Height(0), Round(0), Step::NewHeight));
        assert!(matches!(
            stale.sanity_check(),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn fingerprints_are_short() {
        let message = Message::HeartBeat(Hrs::new(Height(2), Round(0), Step::Commit));
        assert_eq!(message.fingerprint(), "heart-beat {2/0/commit}");
    }
}
