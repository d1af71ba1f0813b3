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

//! Stake-weighted vote aggregation for one (height, round, kind).

use log::warn;

use std::collections::HashMap;

use crate::{
    consensus::vote::{Vote, VoteType},
    crypto::{Address, Hash},
    error::{Error, Result},
    helpers::{Height, Round},
    validator::ValidatorSet,
};

/// Records votes of one kind for one height and round against a snapshot of
/// the committee.
///
/// Tallies reflect set membership: a validator's power is counted once no
/// matter how often its vote arrives, so arrival order has no effect.
#[derive(Debug)]
pub struct VoteSet {
    height: Height,
    round: Round,
    vote_type: VoteType,
    validators: ValidatorSet,
    total_power: i64,
    votes: HashMap<Address, Vote>,
    double_signs: Vec<Vote>,
    power_by_block: HashMap<Hash, i64>,
    accumulated_power: i64,
    quorum_block: Option<Hash>,
}

impl VoteSet {
    /// Creates an empty vote set for the given coordinates and committee
    /// snapshot.
    pub fn new(height: Height, round: Round, vote_type: VoteType, validators: ValidatorSet) -> Self {
        let total_power = validators.total_power();
        Self {
            height,
            round,
            vote_type,
            validators,
            total_power,
            votes: HashMap::new(),
            double_signs: Vec::new(),
            power_by_block: HashMap::new(),
            accumulated_power: 0,
            quorum_block: None,
        }
    }

    /// Returns the vote kind recorded by this set.
    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Returns the number of primary votes.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Checks whether the set holds no votes.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// Adds a vote to the set.
    ///
    /// Returns `Ok(true)` when the vote was newly accepted, `Ok(false)` on
    /// an identical re-add, and `Err(Error::DuplicateVote)` when the voter
    /// already holds a vote for a *different* block hash — the first vote
    /// stays primary, the duplicate is retained as double-sign evidence and
    /// is worth gossiping.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool> {
        if vote.vote_type() != self.vote_type
            || vote.height() != self.height
            || vote.round() != self.round
        {
            return Err(Error::InvalidVote(format!(
                "vote {} does not belong to this set",
                vote.fingerprint()
            )));
        }

        let validator = self
            .validators
            .validator(&vote.signer())
            .ok_or_else(|| Error::InvalidVote("voter is not in the committee".into()))?;
        vote.verify(&validator.public_key())?;
        let power = validator.power();

        if let Some(existing) = self.votes.get(&vote.signer()) {
            if existing.hash() == vote.hash() {
                return Ok(false);
            }
            warn!(
                "double sign detected: voter {} voted {} and {}",
                vote.signer(),
                existing.fingerprint(),
                vote.fingerprint()
            );
            let signer = vote.signer();
            self.double_signs.push(vote);
            return Err(Error::DuplicateVote(signer));
        }

        let tally = self.power_by_block.entry(vote.block_hash()).or_insert(0);
        *tally += power;
        if 3 * *tally > 2 * self.total_power && self.quorum_block.is_none() {
            self.quorum_block = Some(vote.block_hash());
        }
        self.accumulated_power += power;
        self.votes.insert(vote.signer(), vote);
        Ok(true)
    }

    /// Checks whether some block hash accumulated a ⅔ quorum of power.
    pub fn has_quorum(&self) -> bool {
        self.quorum_block.is_some()
    }

    /// Returns the block hash holding the quorum, when present. The
    /// undefined hash signals a quorum for "no block".
    pub fn quorum_block(&self) -> Option<Hash> {
        self.quorum_block
    }

    /// Checks whether more than a third of the committee's power has voted,
    /// regardless of the block. Used for timer advancement.
    pub fn has_one_third_of_total_power(&self) -> bool {
        3 * self.accumulated_power > self.total_power
    }

    /// Returns the accumulated power behind a block hash.
    pub fn power_of(&self, block_hash: &Hash) -> i64 {
        self.power_by_block.get(block_hash).copied().unwrap_or(0)
    }

    /// Returns the primary votes in no particular order.
    pub fn all_votes(&self) -> Vec<&Vote> {
        self.votes.values().collect()
    }

    /// Returns the vote cast by the given committee member, if any.
    pub fn vote_of(&self, signer: &Address) -> Option<&Vote> {
        self.votes.get(signer)
    }

    /// Returns the recorded double-sign evidence.
    pub fn double_signs(&self) -> &[Vote] {
        &self.double_signs
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        crypto::{gen_keypair, PrivateKey},
        validator::Validator,
    };

    /// Builds a committee of equally staked validators, returning the
    /// private keys alongside.
    pub(crate) fn generate_test_committee(
        size: usize,
        stake: i64,
    ) -> (ValidatorSet, Vec<PrivateKey>) {
        let mut validators = Vec::with_capacity(size);
        let mut keys = Vec::with_capacity(size);
        for _ in 0..size {
            let (public_key, private_key) = gen_keypair();
            let mut validator = Validator::new(public_key, Height(1));
            validator.add_to_stake(stake);
            validators.push(validator);
            keys.push(private_key);
        }
        (ValidatorSet::new(validators), keys)
    }

    pub(crate) fn signed_vote(
        vote_type: VoteType,
        height: u64,
        round: u32,
        block_hash: Hash,
        key: &PrivateKey,
    ) -> Vote {
        let mut vote = Vote::new(
            vote_type,
            Height(height),
            Round(round),
            block_hash,
            key.public_key().address(),
        );
        vote.set_signature(key.sign(&vote.sign_bytes()));
        vote
    }

    fn prevote_set(committee: &ValidatorSet) -> VoteSet {
        VoteSet::new(Height(1), Round(0), VoteType::Prevote, committee.clone())
    }

    #[test]
    fn quorum_with_three_of_four() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut set = prevote_set(&committee);
        let block = Hash::calc(b"block B");

        for key in keys.iter().take(2) {
            let added = set
                .add_vote(signed_vote(VoteType::Prevote, 1, 0, block, key))
                .unwrap();
            assert!(added);
        }
        assert!(!set.has_quorum());
        assert!(set.has_one_third_of_total_power());

        set.add_vote(signed_vote(VoteType::Prevote, 1, 0, block, &keys[2]))
            .unwrap();
        assert!(set.has_quorum());
        assert_eq!(set.quorum_block(), Some(block));
        assert_eq!(set.power_of(&block), 3000);
    }

    #[test]
    fn add_vote_is_idempotent() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut set = prevote_set(&committee);
        let block = Hash::calc(b"block");
        let vote = signed_vote(VoteType::Prevote, 1, 0, block, &keys[0]);

        assert!(set.add_vote(vote.clone()).unwrap());
        assert!(!set.add_vote(vote).unwrap());
        assert_eq!(set.len(), 1);
        assert_eq!(set.power_of(&block), 1000);
    }

    #[test]
    fn equivocation_keeps_first_vote_primary() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut set = prevote_set(&committee);
        let block = Hash::calc(b"block B");
        let other = Hash::calc(b"block B'");

        set.add_vote(signed_vote(VoteType::Prevote, 1, 0, block, &keys[0]))
            .unwrap();
        let err = set
            .add_vote(signed_vote(VoteType::Prevote, 1, 0, other, &keys[0]))
            .unwrap_err();
        assert!(err.is_duplicate_vote());

        // Tally for the first block is unchanged and nothing counts twice.
        assert_eq!(set.power_of(&block), 1000);
        assert_eq!(set.power_of(&other), 0);
        assert_eq!(set.len(), 1);
        assert_eq!(set.double_signs().len(), 1);
    }

    #[test]
    fn strangers_and_misrouted_votes_are_rejected() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut set = prevote_set(&committee);
        let block = Hash::calc(b"block");

        // Not a committee member.
        let (_, stranger) = gen_keypair();
        assert!(set
            .add_vote(signed_vote(VoteType::Prevote, 1, 0, block, &stranger))
            .is_err());

        // Wrong kind, height or round.
        assert!(set
            .add_vote(signed_vote(VoteType::Precommit, 1, 0, block, &keys[0]))
            .is_err());
        assert!(set
            .add_vote(signed_vote(VoteType::Prevote, 2, 0, block, &keys[0]))
            .is_err());
        assert!(set
            .add_vote(signed_vote(VoteType::Prevote, 1, 1, block, &keys[0]))
            .is_err());
        assert!(set.is_empty());
    }

    #[test]
    fn undef_votes_tally_separately() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut set = prevote_set(&committee);
        let block = Hash::calc(b"block");

        set.add_vote(signed_vote(VoteType::Prevote, 1, 0, block, &keys[0]))
            .unwrap();
        for key in &keys[1..] {
            set.add_vote(signed_vote(VoteType::Prevote, 1, 0, Hash::undef(), key))
                .unwrap();
        }
        assert_eq!(set.quorum_block(), Some(Hash::undef()));
        assert_eq!(set.power_of(&Hash::undef()), 3000);
    }
}
