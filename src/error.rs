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

//! Error kinds shared across the node.

use thiserror::Error;

use crate::crypto::Address;

/// Errors that can occur while validating or applying blocks, transactions,
/// votes and network messages.
///
/// Structural and validation errors on ingress reject the offending item and
/// are logged; they never crash the node. `Internal` signals a broken
/// invariant inside the consensus machine and aborts the consensus driver.
#[derive(Debug, Error)]
pub enum Error {
    /// A block or header failed its structural checks.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// A transaction failed validation or could not be applied.
    #[error("invalid transaction: {0}")]
    InvalidTx(String),

    /// A vote or proposal failed its structural checks.
    #[error("invalid vote: {0}")]
    InvalidVote(String),

    /// A network message failed its structural checks.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// A sortition proof was rejected.
    #[error("invalid sortition proof: {0}")]
    InvalidProof(String),

    /// An address is malformed or does not belong to the given key.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A validator cast two different votes in the same vote set.
    ///
    /// Non-fatal: the first vote stays primary and the duplicate is kept as
    /// double-sign evidence worth gossiping.
    #[error("duplicated vote from {0}")]
    DuplicateVote(Address),

    /// Unrecoverable invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` for the non-fatal equivocation error.
    pub fn is_duplicate_vote(&self) -> bool {
        matches!(self, Self::DuplicateVote(_))
    }
}

/// Specialized `Result` for node operations.
pub type Result<T> = std::result::Result<T, Error>;
