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

//! Signed votes and block proposals.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use crate::{
    block::Block,
    crypto::{Address, Hash, PublicKey, Signature},
    encoding::{Canonical, CodecError, TagReader, TagWriter},
    error::{Error, Result},
    helpers::{Height, Round},
};

const TAG_VOTE_TYPE: u8 = 1;
const TAG_HEIGHT: u8 = 2;
const TAG_ROUND: u8 = 3;
const TAG_BLOCK_HASH: u8 = 4;
const TAG_SIGNER: u8 = 5;
const TAG_SIGNATURE: u8 = 6;

const TAG_PROPOSAL_HEIGHT: u8 = 1;
const TAG_PROPOSAL_ROUND: u8 = 2;
const TAG_PROPOSAL_BLOCK: u8 = 3;
const TAG_PROPOSAL_SIGNATURE: u8 = 4;

/// Kind of a consensus vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    /// First voting stage of a round.
    Prevote = 1,
    /// Second voting stage of a round.
    Precommit = 2,
}

impl VoteType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Prevote),
            2 => Some(Self::Precommit),
            _ => None,
        }
    }
}

impl fmt::Display for VoteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prevote => f.write_str("prevote"),
            Self::Precommit => f.write_str("precommit"),
        }
    }
}

/// A validator's signed vote for one (height, round, kind).
///
/// The block hash is the undefined hash when the validator votes for "no
/// block" in the round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    vote_type: VoteType,
    height: Height,
    round: Round,
    block_hash: Hash,
    signer: Address,
    signature: Option<Signature>,
}

impl Vote {
    /// Creates an unsigned vote.
    pub fn new(
        vote_type: VoteType,
        height: Height,
        round: Round,
        block_hash: Hash,
        signer: Address,
    ) -> Self {
        Self {
            vote_type,
            height,
            round,
            block_hash,
            signer,
            signature: None,
        }
    }

    /// Returns the vote kind.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Returns the vote height.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Returns the vote round.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Returns the voted block hash, possibly undefined.
    pub fn block_hash(&self) -> Hash {
        self.block_hash
    }

    /// Returns the voter address.
    pub fn signer(&self) -> Address {
        self.signer
    }

    /// Returns the signature, if attached.
    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    /// Attaches the signature over the sign-bytes.
    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    /// Returns the canonical encoding with the signature separated out.
    pub fn sign_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u8(TAG_VOTE_TYPE, self.vote_type as u8);
        writer.write_u64(TAG_HEIGHT, self.height.0);
        writer.write_u32(TAG_ROUND, self.round.0);
        self.block_hash.encode_into(&mut writer, TAG_BLOCK_HASH);
        self.signer.encode_into(&mut writer, TAG_SIGNER);
        writer.into_bytes()
    }

    /// Returns the hash identifying the vote. The signature is excluded, so
    /// re-signed copies of one vote share an identity.
    pub fn hash(&self) -> Hash {
        Hash::calc(&self.sign_bytes())
    }

    /// Verifies the signature against the voter's public key.
    pub fn verify(&self, public_key: &PublicKey) -> Result<()> {
        if public_key.address() != self.signer {
            return Err(Error::InvalidVote(
                "public key does not belong to the voter".into(),
            ));
        }
        let signature = self
            .signature
            .ok_or_else(|| Error::InvalidVote("no signature".into()))?;
        if !public_key.verify(&self.sign_bytes(), &signature) {
            return Err(Error::InvalidVote("invalid signature".into()));
        }
        Ok(())
    }

    /// Checks the structural validity of the vote.
    pub fn sanity_check(&self) -> Result<()> {
        if self.height == Height::zero() {
            return Err(Error::InvalidVote("height is zero".into()));
        }
        self.signer
            .sanity_check()
            .map_err(|err| Error::InvalidVote(format!("invalid voter: {}", err)))?;
        if self.signature.is_none() {
            return Err(Error::InvalidVote("no signature".into()));
        }
        Ok(())
    }

    /// Returns a short identifier for logging.
    pub fn fingerprint(&self) -> String {
        format!(
            "{{{}/{}/{} {}}}",
            self.height,
            self.round,
            self.vote_type,
            self.block_hash.fingerprint()
        )
    }
}

impl Canonical for Vote {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u8(TAG_VOTE_TYPE, self.vote_type as u8);
        writer.write_u64(TAG_HEIGHT, self.height.0);
        writer.write_u32(TAG_ROUND, self.round.0);
        self.block_hash.encode_into(&mut writer, TAG_BLOCK_HASH);
        self.signer.encode_into(&mut writer, TAG_SIGNER);
        writer.write_bool(TAG_SIGNATURE, self.signature.is_some());
        if let Some(signature) = &self.signature {
            signature.encode_into(&mut writer, TAG_SIGNATURE);
        }
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let vote_type = VoteType::from_u8(reader.read_u8(TAG_VOTE_TYPE)?)
            .ok_or_else(|| CodecError::Malformed("unknown vote type".into()))?;
        let height = Height(reader.read_u64(TAG_HEIGHT)?);
        let round = Round(reader.read_u32(TAG_ROUND)?);
        let block_hash = Hash::decode_from(&mut reader, TAG_BLOCK_HASH)?;
        let signer = Address::decode_from(&mut reader, TAG_SIGNER)?;
        let signature = if reader.read_bool(TAG_SIGNATURE)? {
            Some(Signature::decode_from(&mut reader, TAG_SIGNATURE)?)
        } else {
            None
        };
        reader.finish()?;
        Ok(Self {
            vote_type,
            height,
            round,
            block_hash,
            signer,
            signature,
        })
    }
}

/// A proposer's signed block proposal for one (height, round).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    height: Height,
    round: Round,
    block: Block,
    signature: Option<Signature>,
}

impl Proposal {
    /// Creates an unsigned proposal.
    pub fn new(height: Height, round: Round, block: Block) -> Self {
        Self {
            height,
            round,
            block,
            signature: None,
        }
    }

    /// Returns the proposal height.
    pub fn height(&self) -> Height {
        self.height
    }

    /// Returns the proposal round.
    pub fn round(&self) -> Round {
        self.round
    }

    /// Returns the proposed block.
    pub fn block(&self) -> &Block {
        &self.block
    }

    /// Returns the hash of the proposed block.
    pub fn block_hash(&self) -> Hash {
        self.block.hash()
    }

    /// Returns the signature, if attached.
    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    /// Attaches the proposer signature over the sign-bytes.
    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    /// Returns the canonical encoding with the signature separated out.
    pub fn sign_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u64(TAG_PROPOSAL_HEIGHT, self.height.0);
        writer.write_u32(TAG_PROPOSAL_ROUND, self.round.0);
        writer.write_bytes(TAG_PROPOSAL_BLOCK, &self.block.to_bytes());
        writer.into_bytes()
    }

    /// Returns the hash identifying the proposal.
    pub fn hash(&self) -> Hash {
        Hash::calc(&self.sign_bytes())
    }

    /// Verifies the proposer signature.
    pub fn verify(&self, proposer_key: &PublicKey) -> Result<()> {
        let signature = self
            .signature
            .ok_or_else(|| Error::InvalidVote("proposal has no signature".into()))?;
        if !proposer_key.verify(&self.sign_bytes(), &signature) {
            return Err(Error::InvalidVote("invalid proposal signature".into()));
        }
        Ok(())
    }

    /// Checks the structural validity of the proposal and its block.
    pub fn sanity_check(&self) -> Result<()> {
        if self.height == Height::zero() {
            return Err(Error::InvalidVote("height is zero".into()));
        }
        if self.signature.is_none() {
            return Err(Error::InvalidVote("proposal has no signature".into()));
        }
        self.block.sanity_check()
    }

    /// Returns a short identifier for logging.
    pub fn fingerprint(&self) -> String {
        format!(
            "{{{}/{} {}}}",
            self.height,
            self.round,
            self.block_hash().fingerprint()
        )
    }
}

impl Canonical for Proposal {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        writer.write_u64(TAG_PROPOSAL_HEIGHT, self.height.0);
        writer.write_u32(TAG_PROPOSAL_ROUND, self.round.0);
        writer.write_bytes(TAG_PROPOSAL_BLOCK, &self.block.to_bytes());
        writer.write_bool(TAG_PROPOSAL_SIGNATURE, self.signature.is_some());
        if let Some(signature) = &self.signature {
            signature.encode_into(&mut writer, TAG_PROPOSAL_SIGNATURE);
        }
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let height = Height(reader.read_u64(TAG_PROPOSAL_HEIGHT)?);
        let round = Round(reader.read_u32(TAG_PROPOSAL_ROUND)?);
        let block_bytes = reader.read_bytes(TAG_PROPOSAL_BLOCK)?;
        let block = Block::from_bytes(&block_bytes)?;
        let signature = if reader.read_bool(TAG_PROPOSAL_SIGNATURE)? {
            Some(Signature::decode_from(&mut reader, TAG_PROPOSAL_SIGNATURE)?)
        } else {
            None
        };
        reader.finish()?;
        Ok(Self {
            height,
            round,
            block,
            signature,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        block::{tx_ids_hash, Header, BLOCK_VERSION},
        crypto::{gen_keypair, PrivateKey},
    };

    /// Builds a signed proposal for the given height and round, returning
    /// the proposer's keys as well.
    pub(crate) fn generate_test_proposal(
        height: u64,
        round: u32,
    ) -> (Proposal, PublicKey, PrivateKey) {
        let (public_key, private_key) = gen_keypair();
        let header = Header::new(
            BLOCK_VERSION,
            Utc::now(),
            Hash::calc(b"prev"),
            Hash::calc(b"state"),
            tx_ids_hash(&[]),
            Hash::calc(b"receipts"),
            Hash::calc(b"commit"),
            Hash::calc(b"committers"),
            public_key.address(),
        );
        let block = Block::new(header, vec![], vec![]);
        let mut proposal = Proposal::new(Height(height), Round(round), block);
        proposal.set_signature(private_key.sign(&proposal.sign_bytes()));
        (proposal, public_key, private_key)
    }

    #[test]
    fn vote_round_trip_keeps_hash() {
        let (public_key, private_key) = gen_keypair();
        let mut vote = Vote::new(
            VoteType::Prevote,
            Height(10),
            Round(2),
            Hash::calc(b"block"),
            public_key.address(),
        );
        vote.set_signature(private_key.sign(&vote.sign_bytes()));

        let bytes = vote.to_bytes();
        let restored = Vote::from_bytes(&bytes).unwrap();
        assert_eq!(restored, vote);
        assert_eq!(restored.to_bytes(), bytes);
        assert_eq!(restored.hash(), vote.hash());
    }

    #[test]
    fn vote_verification() {
        let (public_key, private_key) = gen_keypair();
        let mut vote = Vote::new(
            VoteType::Precommit,
            Height(1),
            Round(0),
            Hash::undef(),
            public_key.address(),
        );
        assert!(vote.sanity_check().is_err());

        vote.set_signature(private_key.sign(&vote.sign_bytes()));
        assert!(vote.sanity_check().is_ok());
        assert!(vote.verify(&public_key).is_ok());

        let (other_key, _) = gen_keypair();
        assert!(vote.verify(&other_key).is_err());
    }

    #[test]
    fn proposal_marshaling() {
        let (proposal, _, _) = generate_test_proposal(10, 10);
        let bytes1 = proposal.to_bytes();
        let restored = Proposal::from_bytes(&bytes1).unwrap();
        let bytes2 = restored.to_bytes();

        assert_eq!(bytes1, bytes2);
        assert_eq!(proposal.hash(), restored.hash());
    }

    #[test]
    fn proposal_signature() {
        let (other_pub, other_priv) = gen_keypair();

        let (mut proposal, public_key, _) = generate_test_proposal(5, 5);
        assert!(proposal.verify(&public_key).is_ok());

        // Wrong public key.
        assert!(proposal.verify(&other_pub).is_err());

        // Signature by someone else.
        let foreign = other_priv.sign(&proposal.sign_bytes());
        proposal.set_signature(foreign);
        assert!(proposal.verify(&public_key).is_err());
    }
}
