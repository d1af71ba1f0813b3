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

//! Validators and the ordered committee.

use serde_derive::{Deserialize, Serialize};

use crate::{
    crypto::{Address, Hash, PublicKey},
    encoding::{Canonical, CodecError, TagReader, TagWriter},
    helpers::{Height, Round},
};

const TAG_PUBLIC_KEY: u8 = 1;
const TAG_STAKE: u8 = 2;
const TAG_BONDING_HEIGHT: u8 = 3;
const TAG_LAST_JOINED_HEIGHT: u8 = 4;
const TAG_SEQUENCE: u8 = 5;

/// A bonded validator.
///
/// Validators carry their own sequence counter: sortition transactions are
/// sequenced against the validator record rather than an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    public_key: PublicKey,
    stake: i64,
    bonding_height: Height,
    last_joined_height: Height,
    sequence: u64,
}

impl Validator {
    /// Creates a validator bonded at the given height with zero stake.
    pub fn new(public_key: PublicKey, bonding_height: Height) -> Self {
        Self {
            public_key,
            stake: 0,
            bonding_height,
            last_joined_height: Height::zero(),
            sequence: 0,
        }
    }

    /// Returns the validator's public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Returns the address derived from the validator's public key.
    pub fn address(&self) -> Address {
        self.public_key.address()
    }

    /// Returns the bonded stake.
    pub fn stake(&self) -> i64 {
        self.stake
    }

    /// Returns the voting power of the validator.
    pub fn power(&self) -> i64 {
        self.stake
    }

    /// Returns the height the validator bonded at.
    pub fn bonding_height(&self) -> Height {
        self.bonding_height
    }

    /// Returns the last height the validator joined the committee at.
    pub fn last_joined_height(&self) -> Height {
        self.last_joined_height
    }

    /// Returns the last used sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Increases the bonded stake.
    pub fn add_to_stake(&mut self, stake: i64) {
        self.stake += stake;
    }

    /// Advances the sequence by one.
    pub fn increment_sequence(&mut self) {
        self.sequence += 1;
    }

    /// Records the height the validator joined the committee at.
    pub fn set_last_joined_height(&mut self, height: Height) {
        self.last_joined_height = height;
    }
}

impl Canonical for Validator {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        self.public_key.encode_into(&mut writer, TAG_PUBLIC_KEY);
        writer.write_i64(TAG_STAKE, self.stake);
        writer.write_u64(TAG_BONDING_HEIGHT, self.bonding_height.0);
        writer.write_u64(TAG_LAST_JOINED_HEIGHT, self.last_joined_height.0);
        writer.write_u64(TAG_SEQUENCE, self.sequence);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let validator = Self {
            public_key: PublicKey::decode_from(&mut reader, TAG_PUBLIC_KEY)?,
            stake: reader.read_i64(TAG_STAKE)?,
            bonding_height: Height(reader.read_u64(TAG_BONDING_HEIGHT)?),
            last_joined_height: Height(reader.read_u64(TAG_LAST_JOINED_HEIGHT)?),
            sequence: reader.read_u64(TAG_SEQUENCE)?,
        };
        reader.finish()?;
        Ok(validator)
    }
}

/// Ordered committee of validators eligible to vote at a height.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
}

impl ValidatorSet {
    /// Creates a committee from an ordered list of validators.
    pub fn new(validators: Vec<Validator>) -> Self {
        Self { validators }
    }

    /// Returns the number of committee members.
    pub fn len(&self) -> usize {
        self.validators.len()
    }

    /// Checks whether the committee is empty.
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Returns the ordered committee members.
    pub fn validators(&self) -> &[Validator] {
        &self.validators
    }

    /// Checks whether an address belongs to the committee.
    pub fn contains(&self, address: &Address) -> bool {
        self.validator(address).is_some()
    }

    /// Returns the committee member with the given address.
    pub fn validator(&self, address: &Address) -> Option<&Validator> {
        self.validators.iter().find(|val| val.address() == *address)
    }

    /// Returns the proposer for the given height and round.
    ///
    /// Rotation is deterministic: member `(height + round) mod len`.
    ///
    /// # Panics
    ///
    /// Panics if the committee is empty.
    pub fn proposer(&self, height: Height, round: Round) -> &Validator {
        assert!(!self.validators.is_empty(), "empty committee");
        let index = (height.0 + u64::from(round.0)) % self.validators.len() as u64;
        &self.validators[index as usize]
    }

    /// Returns the total voting power of the committee.
    pub fn total_power(&self) -> i64 {
        self.validators.iter().map(Validator::power).sum()
    }

    /// Returns the hash of the committer set: the digest of the ordered
    /// member addresses.
    pub fn committers_hash(&self) -> Hash {
        let mut writer = TagWriter::new();
        writer.write_seq(1, self.validators.len() as u32);
        for validator in &self.validators {
            writer.write_nested(validator.address().as_ref());
        }
        Hash::calc(&writer.into_bytes())
    }
}
