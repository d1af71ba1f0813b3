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

//! Vote aggregation across all rounds of one height, with proposal tracking
//! and cross-round locking.

use std::collections::{BTreeMap, HashMap};

use crate::{
    consensus::{
        vote::{Proposal, Vote, VoteType},
        vote_set::VoteSet,
    },
    crypto::Hash,
    error::{Error, Result},
    helpers::{Height, Round},
    validator::ValidatorSet,
};

/// Vote sets and the proposal of one round.
#[derive(Debug)]
pub struct RoundVoteSet {
    prevotes: VoteSet,
    precommits: VoteSet,
    proposal: Option<Proposal>,
}

impl RoundVoteSet {
    fn new(height: Height, round: Round, validators: ValidatorSet) -> Self {
        Self {
            prevotes: VoteSet::new(height, round, VoteType::Prevote, validators.clone()),
            precommits: VoteSet::new(height, round, VoteType::Precommit, validators),
            proposal: None,
        }
    }
}

/// Aggregates round vote sets for one height and carries the locking state
/// across rounds.
///
/// Rounds are created lazily on first access; round 0 exists from
/// construction. A deduplication index over vote hashes spans all rounds of
/// the height.
#[derive(Debug)]
pub struct HeightVoteSet {
    height: Height,
    validators: ValidatorSet,
    round_vote_sets: BTreeMap<Round, RoundVoteSet>,
    votes: HashMap<Hash, Vote>,
    locked_proposal: Option<Proposal>,
}

impl HeightVoteSet {
    /// Creates the aggregation for a height with a committee snapshot.
    pub fn new(height: Height, validators: ValidatorSet) -> Self {
        let mut hvs = Self {
            height,
            validators,
            round_vote_sets: BTreeMap::new(),
            votes: HashMap::new(),
            locked_proposal: None,
        };
        hvs.add_round(Round::zero());
        hvs
    }

    /// Returns the height this aggregation belongs to.
    pub fn height(&self) -> Height {
        self.height
    }

    fn add_round(&mut self, round: Round) -> &mut RoundVoteSet {
        let height = self.height;
        let validators = self.validators.clone();
        self.round_vote_sets
            .entry(round)
            .or_insert_with(|| RoundVoteSet::new(height, round, validators))
    }

    /// Adds a vote to the set of its round and kind, creating the round if
    /// needed.
    ///
    /// The result follows `VoteSet::add_vote`; identical votes already seen
    /// in any round of this height short-circuit to `Ok(false)`.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool> {
        vote.sanity_check()?;
        if vote.height() != self.height {
            return Err(Error::InvalidVote(format!(
                "vote height {} does not match {}",
                vote.height(),
                self.height
            )));
        }
        let vote_hash = vote.hash();
        if self.votes.contains_key(&vote_hash) {
            return Ok(false);
        }

        let round_set = self.add_round(vote.round());
        let vote_set = match vote.vote_type() {
            VoteType::Prevote => &mut round_set.prevotes,
            VoteType::Precommit => &mut round_set.precommits,
        };
        match vote_set.add_vote(vote.clone()) {
            Ok(added) => {
                if added {
                    self.votes.insert(vote_hash, vote);
                }
                Ok(added)
            }
            Err(err) if err.is_duplicate_vote() => {
                // Double-sign evidence also enters the dedup index so it is
                // surfaced once.
                self.votes.insert(vote_hash, vote);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Returns the prevote set of a round, if the round exists.
    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.prevotes)
    }

    /// Returns the precommit set of a round, if the round exists.
    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets.get(&round).map(|rvs| &rvs.precommits)
    }

    /// Checks whether a proposal was set for the round.
    pub fn has_round_proposal(&self, round: Round) -> bool {
        self.round_proposal(round).is_some()
    }

    /// Returns the proposal of a round, if set.
    pub fn round_proposal(&self, round: Round) -> Option<&Proposal> {
        self.round_vote_sets
            .get(&round)
            .and_then(|rvs| rvs.proposal.as_ref())
    }

    /// Sets the proposal of a round, creating the round if needed.
    pub fn set_round_proposal(&mut self, round: Round, proposal: Proposal) {
        self.add_round(round).proposal = Some(proposal);
    }

    /// Returns the proposal the node is locked on, if any.
    pub fn locked_proposal(&self) -> Option<&Proposal> {
        self.locked_proposal.as_ref()
    }

    /// Locks on a proposal the node has precommitted.
    pub fn lock(&mut self, proposal: Proposal) {
        self.locked_proposal = Some(proposal);
    }

    /// Releases the lock after a ⅔ prevote quorum for a different block.
    pub fn unlock(&mut self) {
        self.locked_proposal = None;
    }

    /// Atomically clears all rounds, the vote dedup index and the lock, and
    /// re-initializes round 0 for the new height and committee.
    pub fn reset(&mut self, height: Height, validators: ValidatorSet) {
        self.height = height;
        self.validators = validators;
        self.round_vote_sets = BTreeMap::new();
        self.votes = HashMap::new();
        self.locked_proposal = None;
        self.add_round(Round::zero());
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::consensus::{
        vote::tests::generate_test_proposal,
        vote_set::tests::{generate_test_committee, signed_vote},
    };

    #[test]
    fn round_zero_exists_on_construction() {
        let (committee, _) = generate_test_committee(4, 1000);
        let hvs = HeightVoteSet::new(Height(1), committee);
        assert!(hvs.prevotes(Round(0)).is_some());
        assert!(hvs.precommits(Round(0)).is_some());
        assert!(hvs.prevotes(Round(1)).is_none());
    }

    #[test]
    fn rounds_are_created_lazily() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut hvs = HeightVoteSet::new(Height(1), committee);
        let block = Hash::calc(b"block");

        let added = hvs
            .add_vote(signed_vote(VoteType::Prevote, 1, 5, block, &keys[0]))
            .unwrap();
        assert!(added);
        assert_eq!(hvs.prevotes(Round(5)).unwrap().len(), 1);
        assert!(hvs.precommits(Round(5)).unwrap().is_empty());
    }

    #[test]
    fn dedup_spans_rounds() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut hvs = HeightVoteSet::new(Height(1), committee);
        let block = Hash::calc(b"block");
        let vote = signed_vote(VoteType::Prevote, 1, 0, block, &keys[0]);

        assert!(hvs.add_vote(vote.clone()).unwrap());
        assert!(!hvs.add_vote(vote).unwrap());
    }

    #[test]
    fn wrong_height_is_rejected() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut hvs = HeightVoteSet::new(Height(1), committee);
        let vote = signed_vote(VoteType::Prevote, 2, 0, Hash::calc(b"b"), &keys[0]);
        assert!(matches!(hvs.add_vote(vote), Err(Error::InvalidVote(_))));
    }

    #[test]
    fn proposal_tracking() {
        let (committee, _) = generate_test_committee(4, 1000);
        let mut hvs = HeightVoteSet::new(Height(10), committee);
        let (proposal, _, _) = generate_test_proposal(10, 3);

        assert!(!hvs.has_round_proposal(Round(3)));
        hvs.set_round_proposal(Round(3), proposal.clone());
        assert!(hvs.has_round_proposal(Round(3)));
        assert_eq!(hvs.round_proposal(Round(3)).unwrap().hash(), proposal.hash());
    }

    #[test]
    fn reset_clears_everything() {
        let (committee, keys) = generate_test_committee(4, 1000);
        let mut hvs = HeightVoteSet::new(Height(1), committee.clone());
        let block = Hash::calc(b"block");

        hvs.add_vote(signed_vote(VoteType::Prevote, 1, 0, block, &keys[0]))
            .unwrap();
        hvs.add_vote(signed_vote(VoteType::Precommit, 1, 1, block, &keys[1]))
            .unwrap();
        let (proposal, _, _) = generate_test_proposal(1, 0);
        hvs.set_round_proposal(Round(0), proposal.clone());
        hvs.lock(proposal);

        hvs.reset(Height(2), committee);

        assert_eq!(hvs.height(), Height(2));
        assert!(hvs.prevotes(Round(0)).unwrap().is_empty());
        assert!(hvs.prevotes(Round(1)).is_none());
        assert!(hvs.locked_proposal().is_none());
        assert!(!hvs.has_round_proposal(Round(0)));

        // The dedup index was cleared: votes for the old height are now
        // rejected on height, not silently deduplicated.
        let stale = signed_vote(VoteType::Prevote, 1, 0, block, &keys[0]);
        assert!(hvs.add_vote(stale).is_err());
    }
}
