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

//! Node configuration.
//!
//! Components take their configuration explicitly at construction; there
//! are no global settings.

use serde_derive::{Deserialize, Serialize};

use std::time::Duration;

use crate::{helpers::Milliseconds, network::PeerInfo};

/// Consensus timeouts and proposal limits.
///
/// Timeouts grow linearly with the round number to outlast network delay
/// under partial synchrony.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Base timeout waiting for a proposal.
    pub timeout_propose: Milliseconds,
    /// Propose timeout growth per round.
    pub timeout_propose_delta: Milliseconds,
    /// Base timeout waiting for a prevote quorum.
    pub timeout_prevote: Milliseconds,
    /// Prevote timeout growth per round.
    pub timeout_prevote_delta: Milliseconds,
    /// Base timeout waiting for a precommit quorum.
    pub timeout_precommit: Milliseconds,
    /// Precommit timeout growth per round.
    pub timeout_precommit_delta: Milliseconds,
    /// Maximum number of transactions in a proposed block.
    pub block_txs_limit: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose: 3_000,
            timeout_propose_delta: 500,
            timeout_prevote: 1_000,
            timeout_prevote_delta: 500,
            timeout_precommit: 1_000,
            timeout_precommit_delta: 500,
            block_txs_limit: 1_000,
        }
    }
}

impl ConsensusConfig {
    fn grow(base: Milliseconds, delta: Milliseconds, round: u32) -> Duration {
        Duration::from_millis(base + delta * u64::from(round))
    }

    /// Returns the propose timeout for a round.
    pub fn propose_timeout(&self, round: crate::helpers::Round) -> Duration {
        Self::grow(self.timeout_propose, self.timeout_propose_delta, round.0)
    }

    /// Returns the prevote timeout for a round.
    pub fn prevote_timeout(&self, round: crate::helpers::Round) -> Duration {
        Self::grow(self.timeout_prevote, self.timeout_prevote_delta, round.0)
    }

    /// Returns the precommit timeout for a round.
    pub fn precommit_timeout(&self, round: crate::helpers::Round) -> Duration {
        Self::grow(self.timeout_precommit, self.timeout_precommit_delta, round.0)
    }
}

/// Transaction pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Capacity of the pool; the oldest entry is evicted beyond it.
    pub max_size: usize,
    /// How long `pending_tx` waits for a requested transaction.
    pub waiting_timeout: Milliseconds,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            waiting_timeout: 2_000,
        }
    }
}

/// Peer bootstrap settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Peers to connect to when below the threshold.
    pub peers: Vec<PeerInfo>,
    /// Number of connections the bootstrapper maintains.
    pub min_peer_threshold: usize,
    /// Interval between connection checks.
    pub period: Milliseconds,
    /// Timeout of a single connection attempt.
    pub connection_timeout: Milliseconds,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            min_peer_threshold: 8,
            period: 15_000,
            connection_timeout: 20_000,
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Consensus settings.
    pub consensus: ConsensusConfig,
    /// Transaction pool settings.
    pub pool: PoolConfig,
    /// Peer bootstrap settings.
    pub bootstrap: BootstrapConfig,
}
