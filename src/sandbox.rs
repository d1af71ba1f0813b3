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

//! The sandbox: a transactional view of ledger state.
//!
//! The sandbox is the only mutation channel available to transaction
//! execution; the persistent store behind it is out of scope and only has
//! to make `commit` atomic with respect to state and receipts. The ledger
//! accessors at the bottom of the trait are how the application publishes
//! the committee and the last commit to consensus at a height boundary.

use crate::{
    account::Account,
    block::{Block, Commit},
    crypto::{Address, Hash, PublicKey},
    error::Result,
    helpers::Height,
    receipt::Receipt,
    validator::{Validator, ValidatorSet},
};

/// Transactional view of ledger state exposed to execution and consensus.
pub trait Sandbox: Send + Sync {
    /// Returns the account with the given address.
    fn account(&self, address: &Address) -> Option<Account>;

    /// Creates a fresh account for the address.
    fn make_new_account(&mut self, address: &Address) -> Account;

    /// Stores the updated account.
    fn update_account(&mut self, account: &Account);

    /// Returns the validator with the given address.
    fn validator(&self, address: &Address) -> Option<Validator>;

    /// Creates a fresh validator for the public key, bonded at the current
    /// height.
    fn make_new_validator(&mut self, public_key: &PublicKey) -> Validator;

    /// Stores the updated validator.
    fn update_validator(&mut self, validator: &Validator);

    /// Validates a sortition proof against a recent block hash, bound to
    /// the validator's public key and stake.
    fn verify_sortition(&self, block_hash: &Hash, proof: &[u8], validator: &Validator) -> bool;

    /// Inserts the validator into the next committee.
    fn add_to_set(&mut self, block_hash: &Hash, address: Address) -> Result<()>;

    /// Returns the current height of the ledger.
    fn current_height(&self) -> Height;

    /// Returns the height of a recent block, if the hash is known.
    fn recent_block_height(&self, hash: &Hash) -> Option<Height>;

    /// Returns how many blocks a transaction stamp stays valid for.
    fn transaction_to_live_interval(&self) -> u64;

    /// Returns the maximum memo length in bytes.
    fn max_memo_length(&self) -> usize;

    /// Returns the proportional fee fraction of the fee policy.
    fn fee_fraction(&self) -> f64;

    /// Returns the minimum fee of the fee policy.
    fn min_fee(&self) -> i64;

    // Ledger view consumed by consensus.

    /// Returns the digest of the current ledger state.
    fn state_hash(&self) -> Hash;

    /// Returns the committee eligible to vote at the next height.
    fn committee(&self) -> ValidatorSet;

    /// Returns the hash of the last committed block, or the undefined hash
    /// on an empty chain.
    fn last_block_hash(&self) -> Hash;

    /// Returns the commit of the last committed block.
    fn last_commit(&self) -> Option<Commit>;

    /// Returns the receipts hash of the last committed block, or the
    /// undefined hash on an empty chain.
    fn last_receipts_hash(&self) -> Hash;

    /// Returns a throwaway copy of the view. Mutations on the snapshot are
    /// visible only to its holder.
    fn snapshot(&self) -> Box<dyn Sandbox>;

    /// Atomically persists a block together with its receipts and commit,
    /// advancing the ledger height.
    fn commit(&mut self, block: &Block, receipts: &[Receipt], commit: &Commit) -> Result<()>;
}

#[cfg(test)]
pub(crate) use self::mock::MockSandbox;
