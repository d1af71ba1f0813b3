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

//! Transaction receipts.

use serde_derive::{Deserialize, Serialize};

use crate::{
    crypto::Hash,
    encoding::{Canonical, CodecError, TagReader, TagWriter},
    error::{Error, Result},
};

const TAG_STATUS: u8 = 1;
const TAG_TX_ID: u8 = 2;
const TAG_BLOCK_HASH: u8 = 3;

/// Outcome of a transaction execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    /// The transaction was applied.
    Ok = 0,
    /// The transaction was rejected.
    Failed = 1,
}

impl Status {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Receipt binding a transaction to the block that carried it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    status: Status,
    tx_id: Hash,
    block_hash: Hash,
}

impl Receipt {
    /// Creates a receipt.
    pub fn new(status: Status, tx_id: Hash, block_hash: Hash) -> Self {
        Self {
            status,
            tx_id,
            block_hash,
        }
    }

    /// Returns the execution status.
    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns the transaction ID.
    pub fn tx_id(&self) -> Hash {
        self.tx_id
    }

    /// Returns the hash of the carrying block.
    pub fn block_hash(&self) -> Hash {
        self.block_hash
    }

    /// Returns the hash of the canonical receipt encoding.
    pub fn hash(&self) -> Hash {
        Hash::calc(&self.to_bytes())
    }

    /// Checks the structural validity of the receipt.
    ///
    /// A non-`Ok` status is treated as invalid here: committed blocks carry
    /// receipts only for applied transactions.
    pub fn sanity_check(&self) -> Result<()> {
        if self.status != Status::Ok {
            return Err(Error::InvalidTx("invalid receipt status".into()));
        }
        self.block_hash
            .sanity_check()
            .map_err(|err| Error::InvalidTx(format!("invalid block hash: {}", err)))?;
        self.tx_id
            .sanity_check()
            .map_err(|err| Error::InvalidTx(format!("invalid transaction id: {}", err)))?;
        Ok(())
    }
}

impl Canonical for Receipt {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u8(TAG_STATUS, self.status as u8);
        self.tx_id.encode_into(&mut writer, TAG_TX_ID);
        self.block_hash.encode_into(&mut writer, TAG_BLOCK_HASH);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let status = Status::from_u8(reader.read_u8(TAG_STATUS)?)
            .ok_or_else(|| CodecError::Malformed("unknown receipt status".into()))?;
        let receipt = Self {
            status,
            tx_id: Hash::decode_from(&mut reader, TAG_TX_ID)?,
            block_hash: Hash::decode_from(&mut reader, TAG_BLOCK_HASH)?,
        };
        reader.finish()?;
        Ok(receipt)
    }
}

/// Returns the digest of an ordered receipt list.
pub fn receipts_hash(receipts: &[Receipt]) -> Hash {
    let mut writer = TagWriter::new();
    writer.write_seq(1, receipts.len() as u32);
    for receipt in receipts {
        writer.write_nested(&receipt.to_bytes());
    }
    Hash::calc(&writer.into_bytes())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn sample() -> Receipt {
        Receipt::new(Status::Ok, Hash::calc(b"tx"), Hash::calc(b"block"))
    }

    #[test]
    fn canonical_round_trip() {
        let receipt = sample();
        let bytes = receipt.to_bytes();
        let restored = Receipt::from_bytes(&bytes).unwrap();
        assert_eq!(restored, receipt);
        assert_eq!(restored.hash(), receipt.hash());
    }

    #[test]
    fn sanity_rejects_failed_status() {
        assert!(sample().sanity_check().is_ok());

        let failed = Receipt::new(Status::Failed, Hash::calc(b"tx"), Hash::calc(b"block"));
        assert!(failed.sanity_check().is_err());

        let undef = Receipt::new(Status::Ok, Hash::undef(), Hash::calc(b"block"));
        assert!(undef.sanity_check().is_err());
    }

    #[test]
    fn receipt_list_hash_is_order_sensitive() {
        let first = sample();
        let second = Receipt::new(Status::Ok, Hash::calc(b"tx2"), Hash::calc(b"block"));
        let forward = receipts_hash(&[first.clone(), second.clone()]);
        let backward = receipts_hash(&[second, first]);
        assert_ne!(forward, backward);
    }
}
