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

//! The consensus state machine.
//!
//! Per (height, round) the machine walks `NewHeight → NewRound → Propose →
//! Prevote → PrevoteWait → Precommit → PrecommitWait → Commit` and starts
//! over at the next height. A block commits at (h, r) only after the node
//! observed a ⅔ precommit quorum for its hash at that round; a lock taken
//! on a precommitted proposal constrains prevotes at later rounds of the
//! same height until ⅔ prevote evidence for another block appears.
//!
//! The machine runs on a single driver task. Round timeouts are raised
//! through an injectable scheduler and grow linearly with the round number,
//! so rounds eventually outlast network delay. Late votes for earlier
//! rounds are recorded as evidence but never rewind the state.

use anyhow::bail;
use chrono::Utc;
use futures::channel::mpsc;
use log::{debug, error, info, trace, warn};

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

mod height_vote_set;
mod hrs;
mod vote;
mod vote_set;

pub use self::{
    height_vote_set::{HeightVoteSet, RoundVoteSet},
    hrs::{Hrs, Step},
    vote::{Proposal, Vote, VoteType},
    vote_set::VoteSet,
};

use crate::{
    block::{tx_ids_hash, Block, Commit, Committer, Header, BLOCK_VERSION},
    config::ConsensusConfig,
    crypto::{Address, Hash, Signer},
    error::{Error, Result},
    execution::Execution,
    helpers::{Height, Round},
    messages::Message,
    pool::TxPool,
    receipt::{Receipt, Status},
    sandbox::Sandbox,
    transaction::Tx,
    validator::ValidatorSet,
};

/// Raises `handle_timeout` on the consensus driver after a delay.
///
/// The scheduler is injected so tests drive the machine deterministically;
/// the production implementation sleeps on the tokio timer.
pub trait TimeoutScheduler: Send + Sync {
    /// Schedules a timeout for the given protocol position.
    fn schedule(&self, after: Duration, target: Hrs);
}

/// Drives round progression, emits votes and proposals, and commits
/// decided blocks.
pub struct Consensus {
    config: ConsensusConfig,
    signer: Signer,
    hrs: Hrs,
    validators: ValidatorSet,
    votes: HeightVoteSet,
    pool: Arc<TxPool>,
    sandbox: Arc<RwLock<dyn Sandbox>>,
    broadcast: mpsc::Sender<Message>,
    scheduler: Arc<dyn TimeoutScheduler>,
}

impl Consensus {
    /// Assembles the machine. Nothing runs until `start`.
    pub fn new(
        config: ConsensusConfig,
        signer: Signer,
        sandbox: Arc<RwLock<dyn Sandbox>>,
        pool: Arc<TxPool>,
        broadcast: mpsc::Sender<Message>,
        scheduler: Arc<dyn TimeoutScheduler>,
    ) -> Self {
        Self {
            config,
            signer,
            hrs: Hrs::new(Height(1), Round::zero(), Step::NewHeight),
            validators: ValidatorSet::default(),
            votes: HeightVoteSet::new(Height(1), ValidatorSet::default()),
            pool,
            sandbox,
            broadcast,
            scheduler,
        }
    }

    /// Returns the node's position in the protocol.
    pub fn hrs(&self) -> Hrs {
        self.hrs
    }

    /// Returns the heartbeat message advertising the node's position.
    pub fn heart_beat_message(&self) -> Message {
        Message::HeartBeat(self.hrs)
    }

    /// Enters the first height.
    pub fn start(&mut self) -> Result<()> {
        self.move_to_new_height()
    }

    fn publish(&self, message: Message) {
        let mut sender = self.broadcast.clone();
        if let Err(err) = sender.try_send(message) {
            warn!("broadcast channel unavailable: {}", err);
        }
    }

    /// Resets the machine for the height after the last committed one,
    /// taking the committee and last commit published by the application.
    fn move_to_new_height(&mut self) -> Result<()> {
        let (height, committee) = {
            let sandbox = self.sandbox.read().expect("sandbox read lock");
            (sandbox.current_height().next(), sandbox.committee())
        };
        if committee.is_empty() {
            return Err(Error::Internal("empty committee".into()));
        }

        self.validators = committee.clone();
        self.votes.reset(height, committee);
        self.hrs = Hrs::new(height, Round::zero(), Step::NewHeight);
        debug!("entering height {}", height);
        self.enter_new_round(Round::zero())
    }

    fn enter_new_round(&mut self, round: Round) -> Result<()> {
        self.hrs = Hrs::new(self.hrs.height, round, Step::NewRound);
        let proposer = self.validators.proposer(self.hrs.height, round).clone();
        trace!(
            "entering round {}, proposer={}",
            round,
            proposer.address().fingerprint()
        );

        if proposer.address() == self.signer.address() && !self.votes.has_round_proposal(round) {
            match self.create_proposal(round) {
                Ok(proposal) => {
                    info!("broadcast proposal {}", proposal.fingerprint());
                    self.votes.set_round_proposal(round, proposal.clone());
                    self.publish(Message::Proposal(proposal));
                }
                Err(err) => error!("could not build a proposal: {}", err),
            }
        }
        self.enter_propose()
    }

    fn enter_propose(&mut self) -> Result<()> {
        self.hrs.step = Step::Propose;
        let round = self.hrs.round;
        self.scheduler.schedule(
            self.config.propose_timeout(round),
            Hrs::new(self.hrs.height, round, Step::Propose),
        );
        if self.votes.has_round_proposal(round) {
            return self.enter_prevote();
        }
        Ok(())
    }

    /// Builds a block from the pool, bounded by the block transaction
    /// limit. The resulting state hash is predicted by executing the chosen
    /// transactions (and the fee mint) on a sandbox snapshot.
    fn create_proposal(&mut self, round: Round) -> Result<Proposal> {
        let sandbox = self.sandbox.read().expect("sandbox read lock");
        let staged: Vec<Tx> = self
            .pool
            .all_transactions()
            .into_iter()
            .take(self.config.block_txs_limit)
            .collect();

        let mut snapshot = sandbox.snapshot();
        let mut execution = Execution::new();
        let mut txs = Vec::with_capacity(staged.len());
        for trx in staged {
            match execution.execute(&trx, &mut *snapshot) {
                Ok(()) => txs.push(trx),
                // The pool check is advisory; drop what no longer applies.
                Err(err) => debug!("leaving {} out of the proposal: {}", trx.fingerprint(), err),
            }
        }
        mint_fee(
            &mut *snapshot,
            self.signer.address(),
            execution.accumulated_fee(),
        );
        let state_hash = snapshot.state_hash();

        let tx_ids: Vec<Hash> = txs.iter().map(Tx::id).collect();
        let prev_commit_hash = sandbox
            .last_commit()
            .map(|commit| commit.hash())
            .unwrap_or_else(Hash::undef);
        let header = Header::new(
            BLOCK_VERSION,
            Utc::now(),
            sandbox.last_block_hash(),
            state_hash,
            tx_ids_hash(&tx_ids),
            sandbox.last_receipts_hash(),
            prev_commit_hash,
            self.validators.committers_hash(),
            self.signer.address(),
        );
        let block = Block::new(header, tx_ids, txs);
        block.sanity_check()?;

        let mut proposal = Proposal::new(self.hrs.height, round, block);
        proposal.set_signature(self.signer.sign(&proposal.sign_bytes()));
        Ok(proposal)
    }

    /// Handles a proposal received from the network.
    pub fn handle_proposal(&mut self, proposal: Proposal) -> Result<()> {
        proposal.sanity_check()?;
        if proposal.height() != self.hrs.height {
            debug!(
                "ignoring proposal {} for another height",
                proposal.fingerprint()
            );
            return Ok(());
        }
        let round = proposal.round();
        if self.votes.has_round_proposal(round) {
            return Ok(());
        }
        if let Err(err) = self.validate_proposal(&proposal) {
            warn!("rejected proposal {}: {}", proposal.fingerprint(), err);
            return Err(Error::InvalidBlock(err.to_string()));
        }

        self.votes.set_round_proposal(round, proposal);
        if round == self.hrs.round && self.hrs.step == Step::Propose {
            self.enter_prevote()?;
        }
        // A precommit quorum may have been waiting for this proposal.
        self.check_precommits(round)
    }

    fn validate_proposal(&self, proposal: &Proposal) -> anyhow::Result<()> {
        let proposer = self.validators.proposer(self.hrs.height, proposal.round());
        proposal.verify(&proposer.public_key())?;
        if proposal.block().header().proposer_address() != proposer.address() {
            bail!(
                "wrong proposer, expected {}",
                proposer.address().fingerprint()
            );
        }
        let last_block_hash = {
            let sandbox = self.sandbox.read().expect("sandbox read lock");
            sandbox.last_block_hash()
        };
        if proposal.block().header().prev_block_hash() != last_block_hash {
            bail!("proposal does not extend the last committed block");
        }
        Ok(())
    }

    /// Handles a vote received from the network.
    ///
    /// Votes for earlier or later rounds of the current height are recorded
    /// as evidence; only votes for the current round drive transitions.
    pub fn handle_vote(&mut self, vote: Vote) -> Result<()> {
        if vote.height() != self.hrs.height {
            debug!("ignoring vote {} for another height", vote.fingerprint());
            return Ok(());
        }
        let round = vote.round();
        let vote_type = vote.vote_type();
        match self.votes.add_vote(vote.clone()) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(err) if err.is_duplicate_vote() => {
                // Keep the first vote primary and gossip the evidence.
                warn!("{}; gossiping the evidence", err);
                self.publish(Message::Vote(vote));
                return Ok(());
            }
            Err(err) => return Err(err),
        }

        match vote_type {
            VoteType::Prevote => self.check_prevotes(round),
            VoteType::Precommit => self.check_precommits(round),
        }
    }

    fn check_prevotes(&mut self, round: Round) -> Result<()> {
        if round != self.hrs.round {
            return Ok(());
        }
        let quorum = self.votes.prevotes(round).and_then(VoteSet::quorum_block);
        if let Some(hash) = quorum {
            if self.hrs.step == Step::Prevote || self.hrs.step == Step::PrevoteWait {
                return self.enter_precommit(Some(hash));
            }
        }
        Ok(())
    }

    fn check_precommits(&mut self, round: Round) -> Result<()> {
        if round != self.hrs.round {
            return Ok(());
        }
        let quorum = self.votes.precommits(round).and_then(VoteSet::quorum_block);
        match quorum {
            Some(hash) if !hash.is_undef() => {
                if self.hrs.step < Step::Commit {
                    return self.enter_commit(round, hash);
                }
                Ok(())
            }
            Some(_) => {
                // Quorum for no block: the round is lost.
                if self.hrs.step >= Step::Precommit && self.hrs.step < Step::Commit {
                    return self.enter_new_round(round.next());
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn enter_prevote(&mut self) -> Result<()> {
        if self.hrs.step >= Step::Prevote {
            return Ok(());
        }
        self.hrs.step = Step::Prevote;
        let round = self.hrs.round;

        let prevote_hash = self.choose_prevote(round);
        self.broadcast_vote(VoteType::Prevote, prevote_hash);

        self.hrs.step = Step::PrevoteWait;
        self.scheduler.schedule(
            self.config.prevote_timeout(round),
            Hrs::new(self.hrs.height, round, Step::PrevoteWait),
        );
        self.check_prevotes(round)
    }

    /// Picks the prevote for the round: the proposal's hash when it is
    /// valid and compatible with the lock, the undefined hash otherwise.
    fn choose_prevote(&self, round: Round) -> Hash {
        let proposal = match self.votes.round_proposal(round) {
            Some(proposal) => proposal,
            None => return Hash::undef(),
        };
        match self.votes.locked_proposal() {
            None => proposal.block_hash(),
            Some(locked) if locked.block_hash() == proposal.block_hash() => proposal.block_hash(),
            Some(locked) => {
                // An earlier lock yields only to ⅔ prevote evidence for
                // the new block in this round.
                let quorum = self.votes.prevotes(round).and_then(VoteSet::quorum_block);
                if locked.round() < round && quorum == Some(proposal.block_hash()) {
                    proposal.block_hash()
                } else {
                    Hash::undef()
                }
            }
        }
    }

    fn enter_precommit(&mut self, prevote_quorum: Option<Hash>) -> Result<()> {
        if self.hrs.step >= Step::Precommit {
            return Ok(());
        }
        self.hrs.step = Step::Precommit;
        let round = self.hrs.round;

        let precommit_hash = match prevote_quorum {
            Some(hash) if !hash.is_undef() => match self.votes.round_proposal(round) {
                Some(proposal) if proposal.block_hash() == hash => {
                    let proposal = proposal.clone();
                    self.votes.lock(proposal);
                    hash
                }
                _ => {
                    warn!(
                        "prevote quorum for an unknown proposal, hash={}",
                        hash.fingerprint()
                    );
                    Hash::undef()
                }
            },
            Some(_) => {
                // Quorum for no block releases the lock.
                self.votes.unlock();
                Hash::undef()
            }
            None => Hash::undef(),
        };
        self.broadcast_vote(VoteType::Precommit, precommit_hash);

        self.hrs.step = Step::PrecommitWait;
        self.scheduler.schedule(
            self.config.precommit_timeout(round),
            Hrs::new(self.hrs.height, round, Step::PrecommitWait),
        );
        self.check_precommits(round)
    }

    fn enter_commit(&mut self, round: Round, block_hash: Hash) -> Result<()> {
        if self.hrs.step == Step::Commit {
            return Ok(());
        }
        let proposal = match self.votes.round_proposal(round) {
            Some(proposal) if proposal.block_hash() == block_hash => proposal.clone(),
            _ => {
                warn!(
                    "precommit quorum without the proposal, hash={}",
                    block_hash.fingerprint()
                );
                self.schedule_commit_retry(round);
                return Ok(());
            }
        };
        self.commit_block(round, &proposal)
    }

    /// Re-raises the precommit-wait timeout so a delayed commit is retried
    /// once the missing data had a chance to arrive.
    fn schedule_commit_retry(&self, round: Round) {
        self.scheduler.schedule(
            self.config.precommit_timeout(round),
            Hrs::new(self.hrs.height, round, Step::PrecommitWait),
        );
    }

    /// Applies the decided block to the ledger and advances the height.
    ///
    /// Missing transactions are fetched through the pool first; a still
    /// incomplete block leaves the step untouched so a later timeout
    /// retries. Execution failures and a state-hash mismatch are fatal:
    /// a ⅔ quorum stands behind the block, so either this node or the
    /// validator majority is broken.
    fn commit_block(&mut self, round: Round, proposal: &Proposal) -> Result<()> {
        let mut block = proposal.block().clone();
        if block.txs().is_empty() && !block.tx_ids().is_empty() {
            let mut txs = Vec::with_capacity(block.tx_ids().len());
            for id in block.tx_ids() {
                match self.pool.pending_tx(id) {
                    Some(trx) => txs.push(trx),
                    None => {
                        warn!(
                            "block transaction {} is unavailable, delaying commit",
                            id.fingerprint()
                        );
                        self.schedule_commit_retry(round);
                        return Ok(());
                    }
                }
            }
            block.set_txs(txs);
        }
        block.sanity_check()?;

        let block_hash = block.hash();
        let receipts = {
            let mut sandbox = self.sandbox.write().expect("sandbox write lock");
            let mut execution = Execution::new();
            let mut receipts = Vec::with_capacity(block.txs().len());
            for trx in block.txs() {
                if let Err(err) = execution.execute(trx, &mut *sandbox) {
                    return Err(Error::Internal(format!(
                        "committed block carries an invalid transaction {}: {}",
                        trx.fingerprint(),
                        err
                    )));
                }
                receipts.push(Receipt::new(Status::Ok, trx.id(), block_hash));
            }
            mint_fee(
                &mut *sandbox,
                block.header().proposer_address(),
                execution.accumulated_fee(),
            );
            if sandbox.state_hash() != block.header().state_hash() {
                return Err(Error::Internal(
                    "resulting state hash does not match the committed header".into(),
                ));
            }

            let precommits = self.votes.precommits(round).ok_or_else(|| {
                Error::Internal("commit without a precommit round".into())
            })?;
            let committers: Vec<Committer> = self
                .validators
                .validators()
                .iter()
                .map(|validator| Committer {
                    address: validator.address(),
                    signed: precommits
                        .vote_of(&validator.address())
                        .map_or(false, |vote| vote.block_hash() == block_hash),
                })
                .collect();
            let commit = Commit::new(round, committers);
            sandbox.commit(&block, &receipts, &commit)?;
            receipts
        };

        self.hrs.step = Step::Commit;
        info!(
            "COMMIT ====== height={}, round={}, proposer={}, committed={}, pool={}, hash={}",
            self.hrs.height,
            round,
            block.header().proposer_address().fingerprint(),
            receipts.len(),
            self.pool.fingerprint(),
            block_hash.to_hex(),
        );
        for id in block.tx_ids() {
            self.pool.remove_tx(id);
        }

        let committed_height = self.hrs.height;
        self.publish(Message::Block {
            height: committed_height,
            block,
        });
        self.move_to_new_height()?;
        self.publish(self.heart_beat_message());
        Ok(())
    }

    /// Handles a committed block received from the network. The block is
    /// adopted when a precommit quorum for its hash already exists at some
    /// round of the current height.
    pub fn handle_block(&mut self, height: Height, block: Block) -> Result<()> {
        if height != self.hrs.height {
            debug!(
                "ignoring block {} for height {}",
                block.hash().fingerprint(),
                height
            );
            return Ok(());
        }
        block.sanity_check()?;
        let hash = block.hash();

        for round in Round::zero().iter_to(self.hrs.round.next()) {
            let quorum = self.votes.precommits(round).and_then(VoteSet::quorum_block);
            if quorum == Some(hash) {
                if !self.votes.has_round_proposal(round) {
                    // The quorum authenticates the block; the proposal
                    // itself never arrived.
                    let proposal = Proposal::new(height, round, block.clone());
                    self.votes.set_round_proposal(round, proposal);
                }
                if self.hrs.step < Step::Commit {
                    return self.enter_commit(round, hash);
                }
            }
        }
        Ok(())
    }

    /// Handles a raised timeout. Stale targets are ignored.
    pub fn handle_timeout(&mut self, target: Hrs) -> Result<()> {
        if target.height != self.hrs.height || target.round != self.hrs.round {
            trace!("stale timeout {}", target);
            return Ok(());
        }
        match target.step {
            Step::Propose if self.hrs.step == Step::Propose => {
                warn!("no proposal at {}, voting for no block", self.hrs);
                self.enter_prevote()
            }
            Step::PrevoteWait if self.hrs.step == Step::PrevoteWait => {
                let quorum = self
                    .votes
                    .prevotes(target.round)
                    .and_then(VoteSet::quorum_block);
                self.enter_precommit(quorum)
            }
            Step::PrecommitWait if self.hrs.step == Step::PrecommitWait => {
                let quorum = self
                    .votes
                    .precommits(target.round)
                    .and_then(VoteSet::quorum_block);
                match quorum {
                    Some(hash) if !hash.is_undef() => self.enter_commit(target.round, hash),
                    _ => {
                        warn!("round {} timed out at {}", target.round, self.hrs);
                        self.enter_new_round(target.round.next())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    fn broadcast_vote(&mut self, vote_type: VoteType, block_hash: Hash) {
        if !self.validators.contains(&self.signer.address()) {
            // Observers follow the protocol but never vote.
            return;
        }
        let mut vote = Vote::new(
            vote_type,
            self.hrs.height,
            self.hrs.round,
            block_hash,
            self.signer.address(),
        );
        vote.set_signature(self.signer.sign(&vote.sign_bytes()));
        if let Err(err) = self.votes.add_vote(vote.clone()) {
            error!("could not record own vote: {}", err);
            return;
        }
        trace!("broadcast vote {}", vote.fingerprint());
        self.publish(Message::Vote(vote));
    }
}

impl std::fmt::Debug for Consensus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consensus").field("hrs", &self.hrs).finish()
    }
}

/// Credits the accumulated fee of a block to its proposer. This is the
/// single sanctioned value adjustment outside the execution engine.
fn mint_fee(sandbox: &mut dyn Sandbox, proposer: Address, fee: i64) {
    if fee == 0 {
        return;
    }
    let mut account = match sandbox.account(&proposer) {
        Some(account) => account,
        None => sandbox.make_new_account(&proposer),
    };
    account.add_to_balance(fee);
    sandbox.update_account(&account);
}
