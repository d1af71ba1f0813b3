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

//! Blocks, headers and commit records.
//!
//! A block's identity is the hash of its canonical header encoding; the
//! body (transaction-ID list and transactions) is bound to the header
//! through the `tx_ids_hash` field.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};

use crate::{
    crypto::{Address, Hash},
    encoding::{Canonical, CodecError, TagReader, TagWriter},
    error::{Error, Result},
    helpers::Round,
    transaction::Tx,
};

/// Version of the block format produced by this node.
pub const BLOCK_VERSION: u32 = 1;

const TAG_VERSION: u8 = 1;
const TAG_UNIX_TIME: u8 = 2;
const TAG_PREV_BLOCK_HASH: u8 = 3;
const TAG_STATE_HASH: u8 = 4;
const TAG_TX_IDS_HASH: u8 = 5;
const TAG_PREV_RECEIPTS_HASH: u8 = 6;
const TAG_PREV_COMMIT_HASH: u8 = 7;
const TAG_COMMITTERS_HASH: u8 = 8;
const TAG_PROPOSER_ADDRESS: u8 = 9;

const TAG_HEADER: u8 = 1;
const TAG_TX_IDS: u8 = 2;
const TAG_TXS: u8 = 3;

const TAG_COMMIT_ROUND: u8 = 1;
const TAG_COMMITTERS: u8 = 2;

const TAG_COMMITTER_ADDRESS: u8 = 1;
const TAG_COMMITTER_SIGNED: u8 = 2;

/// Canonical summary of a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    version: u32,
    unix_time: i64,
    prev_block_hash: Hash,
    state_hash: Hash,
    tx_ids_hash: Hash,
    prev_receipts_hash: Hash,
    prev_commit_hash: Hash,
    committers_hash: Hash,
    proposer_address: Address,
}

impl Header {
    /// Creates a header. Genesis headers pass undefined previous hashes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        version: u32,
        time: DateTime<Utc>,
        prev_block_hash: Hash,
        state_hash: Hash,
        tx_ids_hash: Hash,
        prev_receipts_hash: Hash,
        prev_commit_hash: Hash,
        committers_hash: Hash,
        proposer_address: Address,
    ) -> Self {
        Self {
            version,
            unix_time: time.timestamp(),
            prev_block_hash,
            state_hash,
            tx_ids_hash,
            prev_receipts_hash,
            prev_commit_hash,
            committers_hash,
            proposer_address,
        }
    }

    /// Returns the block format version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the block time as a unix timestamp.
    pub fn unix_time(&self) -> i64 {
        self.unix_time
    }

    /// Returns the block time.
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.unix_time, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Returns the hash of the previous block.
    pub fn prev_block_hash(&self) -> Hash {
        self.prev_block_hash
    }

    /// Returns the hash of the state this block results in.
    pub fn state_hash(&self) -> Hash {
        self.state_hash
    }

    /// Returns the hash of the transaction-ID list.
    pub fn tx_ids_hash(&self) -> Hash {
        self.tx_ids_hash
    }

    /// Returns the hash of the previous block's receipts.
    pub fn prev_receipts_hash(&self) -> Hash {
        self.prev_receipts_hash
    }

    /// Returns the hash of the previous block's commit.
    pub fn prev_commit_hash(&self) -> Hash {
        self.prev_commit_hash
    }

    /// Returns the hash of the committer set.
    pub fn committers_hash(&self) -> Hash {
        self.committers_hash
    }

    /// Returns the proposer address.
    pub fn proposer_address(&self) -> Address {
        self.proposer_address
    }

    /// Checks whether this is a genesis header.
    pub fn is_genesis(&self) -> bool {
        self.prev_commit_hash.is_undef()
    }

    /// Checks the structural validity of the header.
    ///
    /// The state, transaction-ID and committer hashes and the proposer
    /// address must always be defined. An undefined previous-commit hash
    /// marks a genesis header, in which case the previous-block and
    /// previous-receipts hashes must be undefined too; otherwise all three
    /// must be defined.
    pub fn sanity_check(&self) -> Result<()> {
        let invalid = |err: anyhow::Error| Error::InvalidBlock(err.to_string());
        self.state_hash.sanity_check().map_err(invalid)?;
        self.tx_ids_hash.sanity_check().map_err(invalid)?;
        self.committers_hash.sanity_check().map_err(invalid)?;
        self.proposer_address.sanity_check().map_err(invalid)?;

        if self.prev_commit_hash.is_undef() {
            if !self.prev_block_hash.is_undef() || !self.prev_receipts_hash.is_undef() {
                return Err(Error::InvalidBlock("invalid genesis block hash".into()));
            }
        } else {
            self.prev_block_hash.sanity_check().map_err(invalid)?;
            self.prev_receipts_hash.sanity_check().map_err(invalid)?;
        }
        Ok(())
    }

    /// Returns the hash of the canonical header encoding.
    pub fn hash(&self) -> Hash {
        Hash::calc(&self.to_bytes())
    }
}

impl Canonical for Header {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u32(TAG_VERSION, self.version);
        writer.write_i64(TAG_UNIX_TIME, self.unix_time);
        self.prev_block_hash
            .encode_into(&mut writer, TAG_PREV_BLOCK_HASH);
        self.state_hash.encode_into(&mut writer, TAG_STATE_HASH);
        self.tx_ids_hash.encode_into(&mut writer, TAG_TX_IDS_HASH);
        self.prev_receipts_hash
            .encode_into(&mut writer, TAG_PREV_RECEIPTS_HASH);
        self.prev_commit_hash
            .encode_into(&mut writer, TAG_PREV_COMMIT_HASH);
        self.committers_hash
            .encode_into(&mut writer, TAG_COMMITTERS_HASH);
        self.proposer_address
            .encode_into(&mut writer, TAG_PROPOSER_ADDRESS);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let header = Self {
            version: reader.read_u32(TAG_VERSION)?,
            unix_time: reader.read_i64(TAG_UNIX_TIME)?,
            prev_block_hash: Hash::decode_from(&mut reader, TAG_PREV_BLOCK_HASH)?,
            state_hash: Hash::decode_from(&mut reader, TAG_STATE_HASH)?,
            tx_ids_hash: Hash::decode_from(&mut reader, TAG_TX_IDS_HASH)?,
            prev_receipts_hash: Hash::decode_from(&mut reader, TAG_PREV_RECEIPTS_HASH)?,
            prev_commit_hash: Hash::decode_from(&mut reader, TAG_PREV_COMMIT_HASH)?,
            committers_hash: Hash::decode_from(&mut reader, TAG_COMMITTERS_HASH)?,
            proposer_address: Address::decode_from(&mut reader, TAG_PROPOSER_ADDRESS)?,
        };
        reader.finish()?;
        Ok(header)
    }
}

/// A committee member's participation in a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committer {
    /// Member address.
    pub address: Address,
    /// Whether the member's precommit is part of the commit.
    pub signed: bool,
}

impl Committer {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        self.address.encode_into(&mut writer, TAG_COMMITTER_ADDRESS);
        writer.write_bool(TAG_COMMITTER_SIGNED, self.signed);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let committer = Self {
            address: Address::decode_from(&mut reader, TAG_COMMITTER_ADDRESS)?,
            signed: reader.read_bool(TAG_COMMITTER_SIGNED)?,
        };
        reader.finish()?;
        Ok(committer)
    }
}

/// The commit that decided a block: the round and the committee members
/// whose precommits formed the quorum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    round: Round,
    committers: Vec<Committer>,
}

impl Commit {
    /// Creates a commit record.
    pub fn new(round: Round, committers: Vec<Committer>) -> Self {
        Self { round, committers }
    }

    /// Returns the round the block was decided in.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Returns the committee members with their participation flags.
    pub fn committers(&self) -> &[Committer] {
        &self.committers
    }

    /// Returns the addresses whose precommits are part of the commit.
    pub fn signers(&self) -> Vec<Address> {
        self.committers
            .iter()
            .filter(|committer| committer.signed)
            .map(|committer| committer.address)
            .collect()
    }

    /// Returns the hash of the canonical commit encoding.
    pub fn hash(&self) -> Hash {
        Hash::calc(&self.to_bytes())
    }
}

impl Canonical for Commit {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u32(TAG_COMMIT_ROUND, self.round.0);
        writer.write_seq(TAG_COMMITTERS, self.committers.len() as u32);
        for committer in &self.committers {
            writer.write_nested(&committer.to_bytes());
        }
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let round = Round(reader.read_u32(TAG_COMMIT_ROUND)?);
        let count = reader.read_seq(TAG_COMMITTERS)?;
        let mut committers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let nested = reader.read_nested()?;
            committers.push(Committer::from_bytes(nested)?);
        }
        reader.finish()?;
        Ok(Self { round, committers })
    }
}

/// Returns the digest of an ordered transaction-ID list.
pub fn tx_ids_hash(ids: &[Hash]) -> Hash {
    let mut writer = TagWriter::new();
    writer.write_seq(1, ids.len() as u32);
    for id in ids {
        writer.write_nested(id.as_ref());
    }
    Hash::calc(&writer.into_bytes())
}

/// A block: header plus body (transaction-ID list and transactions).
///
/// The transactions may be absent when the block traveled without its body;
/// the commit path fetches them through the pool before applying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    header: Header,
    tx_ids: Vec<Hash>,
    txs: Vec<Tx>,
}

impl Block {
    /// Creates a block from a header and its body.
    pub fn new(header: Header, tx_ids: Vec<Hash>, txs: Vec<Tx>) -> Self {
        Self {
            header,
            tx_ids,
            txs,
        }
    }

    /// Returns the header.
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the transaction-ID list.
    pub fn tx_ids(&self) -> &[Hash] {
        &self.tx_ids
    }

    /// Returns the transactions carried with the block.
    pub fn txs(&self) -> &[Tx] {
        &self.txs
    }

    /// Replaces the carried transactions, e.g. after fetching them through
    /// the pool.
    pub fn set_txs(&mut self, txs: Vec<Tx>) {
        self.txs = txs;
    }

    /// Returns the block hash: the hash of the canonical header encoding.
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Checks the structural validity of the block.
    pub fn sanity_check(&self) -> Result<()> {
        self.header.sanity_check()?;
        if self.header.tx_ids_hash() != tx_ids_hash(&self.tx_ids) {
            return Err(Error::InvalidBlock(
                "transaction ids do not match the header".into(),
            ));
        }
        if !self.txs.is_empty() {
            if self.txs.len() != self.tx_ids.len() {
                return Err(Error::InvalidBlock(
                    "transaction list does not match the id list".into(),
                ));
            }
            for (trx, id) in self.txs.iter().zip(&self.tx_ids) {
                if trx.id() != *id {
                    return Err(Error::InvalidBlock(format!(
                        "transaction {} does not match its id",
                        trx.fingerprint()
                    )));
                }
            }
        }
        Ok(())
    }
}

impl Canonical for Block {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_bytes(TAG_HEADER, &self.header.to_bytes());
        writer.write_seq(TAG_TX_IDS, self.tx_ids.len() as u32);
        for id in &self.tx_ids {
            writer.write_nested(id.as_ref());
        }
        writer.write_seq(TAG_TXS, self.txs.len() as u32);
        for trx in &self.txs {
            writer.write_nested(&trx.to_bytes());
        }
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let header_bytes = reader.read_bytes(TAG_HEADER)?;
        let header = Header::from_bytes(&header_bytes)?;

        let id_count = reader.read_seq(TAG_TX_IDS)?;
        let mut tx_ids = Vec::with_capacity(id_count as usize);
        for _ in 0..id_count {
            let nested = reader.read_nested()?;
            tx_ids.push(
                Hash::from_slice(nested)
                    .ok_or_else(|| CodecError::Malformed("transaction id".into()))?,
            );
        }

        let tx_count = reader.read_seq(TAG_TXS)?;
        let mut txs = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let nested = reader.read_nested()?;
            txs.push(Tx::from_bytes(nested)?);
        }

        reader.finish()?;
        Ok(Self {
            header,
            tx_ids,
            txs,
        })
    }
}
