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

//! Node of the Ostraka proof-of-stake blockchain.
//!
//! The node validates transactions, participates in a BFT-style consensus
//! with committee sortition, maintains the ledger state behind a sandbox
//! interface, and gossips messages across a peer-to-peer network.
//!
//! # Overview
//!
//! - [`Node`] is the assembly root wiring the components together
//! - [`consensus::Consensus`] drives round progression and block commits
//! - [`pool::TxPool`] stages pending transactions
//! - [`execution::Execution`] validates and applies state transitions
//! - [`sandbox::Sandbox`] is the transactional ledger view injected by the
//!   embedding application
//! - [`network::Network`] and [`network::Dialer`] are the seams to the
//!   gossip transport, which lives outside this crate

#![warn(
    missing_debug_implementations,
    missing_docs,
    unsafe_code,
    bare_trait_objects
)]

pub mod account;
pub mod block;
pub mod config;
pub mod consensus;
pub mod crypto;
pub mod encoding;
pub mod error;
pub mod execution;
pub mod helpers;
pub mod messages;
pub mod network;
pub mod pool;
pub mod receipt;
pub mod sandbox;
pub mod transaction;
pub mod validator;

pub use crate::{
    config::NodeConfig,
    error::{Error, Result},
    helpers::{user_agent, NODE_VERSION},
};

use futures::{channel::mpsc, StreamExt};
use log::{debug, error, trace, warn};
use tokio_util::sync::CancellationToken;

use std::{
    fmt,
    sync::{Arc, RwLock},
    time::Duration,
};

use crate::{
    consensus::{Consensus, Hrs, TimeoutScheduler},
    crypto::Signer,
    messages::Message,
    network::{Bootstrapper, Dialer, Network},
    pool::TxPool,
    sandbox::Sandbox,
    transaction::Tx,
};

/// Raises consensus timeouts through the tokio timer.
#[derive(Debug)]
struct TokioScheduler {
    sender: mpsc::Sender<Hrs>,
}

impl TimeoutScheduler for TokioScheduler {
    fn schedule(&self, after: Duration, target: Hrs) {
        let mut sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = sender.try_send(target);
        });
    }
}

/// The assembly root of a node.
///
/// `Node` owns the consensus driver and the pool, forwards broadcast
/// messages to the network, and dispatches ingress messages to the
/// components. The sandboxes and the transport are injected, so no
/// component owns another cyclically: execution consumes a sandbox
/// capability, the pool holds its own checker sandbox, and consensus holds
/// the ledger view.
pub struct Node {
    consensus: Consensus,
    pool: Arc<TxPool>,
    network: Arc<dyn Network>,
    bootstrapper: Bootstrapper,
    broadcast_tx: mpsc::Sender<Message>,
    broadcast_rx: mpsc::Receiver<Message>,
    timeout_rx: mpsc::Receiver<Hrs>,
    ingress_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
}

impl Node {
    /// Assembles a node.
    ///
    /// `ledger` is the sandbox view consensus executes committed blocks
    /// against; `pool_sandbox` is the pool's own throwaway view for
    /// advisory validation. The transport hands its message-ingress
    /// channel over as `ingress_rx`.
    pub fn new(
        config: NodeConfig,
        signer: Signer,
        ledger: Arc<RwLock<dyn Sandbox>>,
        pool_sandbox: Box<dyn Sandbox>,
        network: Arc<dyn Network>,
        dialer: Arc<dyn Dialer>,
        ingress_rx: mpsc::Receiver<Message>,
    ) -> Self {
        let (broadcast_tx, broadcast_rx) = mpsc::channel(256);
        let (timeout_tx, timeout_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        let pool = Arc::new(TxPool::new(
            config.pool,
            pool_sandbox,
            broadcast_tx.clone(),
        ));
        let consensus = Consensus::new(
            config.consensus,
            signer,
            ledger,
            Arc::clone(&pool),
            broadcast_tx.clone(),
            Arc::new(TokioScheduler { sender: timeout_tx }),
        );
        let bootstrapper = Bootstrapper::new(config.bootstrap, dialer, &cancel);

        Self {
            consensus,
            pool,
            network,
            bootstrapper,
            broadcast_tx,
            broadcast_rx,
            timeout_rx,
            ingress_rx,
            cancel,
        }
    }

    /// Returns the transaction pool.
    pub fn pool(&self) -> &Arc<TxPool> {
        &self.pool
    }

    /// Returns a token cancelling the node and everything it spawned.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stages a locally submitted transaction and announces it to peers.
    pub fn submit_transaction(&self, trx: Tx) -> Result<()> {
        self.pool.append_tx_and_broadcast(trx)
    }

    fn publish(&self, message: Message) {
        let mut sender = self.broadcast_tx.clone();
        if let Err(err) = sender.try_send(message) {
            warn!("broadcast channel unavailable: {}", err);
        }
    }

    /// Dispatches a message from the network to the owning component.
    fn handle_message(&mut self, message: Message) -> Result<()> {
        message.sanity_check()?;
        trace!("received {}", message);
        match message {
            Message::Vote(vote) => self.consensus.handle_vote(vote),
            Message::Proposal(proposal) => self.consensus.handle_proposal(proposal),
            Message::Block { height, block } => self.consensus.handle_block(height, block),
            Message::Txs(txs) => {
                for trx in txs {
                    if let Err(err) = self.pool.append_tx(trx) {
                        debug!("transaction not staged: {}", err);
                    }
                }
                Ok(())
            }
            Message::TxsReq(ids) => {
                let found: Vec<Tx> = ids
                    .iter()
                    .filter_map(|id| self.pool.transaction(id))
                    .collect();
                if !found.is_empty() {
                    self.publish(Message::Txs(found));
                }
                Ok(())
            }
            Message::HeartBeat(hrs) => {
                if hrs.height > self.consensus.hrs().height {
                    warn!(
                        "peer is ahead of us: peer={}, ours={}",
                        hrs,
                        self.consensus.hrs()
                    );
                }
                Ok(())
            }
        }
    }

    /// Runs the node until cancellation.
    ///
    /// Starts the transport, the bootstrapper and the consensus driver,
    /// then serves the three channels: outgoing broadcast, raised consensus
    /// timeouts and network ingress. Validation errors reject the offending
    /// item; an `Internal` error aborts the driver.
    pub async fn run(mut self) -> anyhow::Result<()> {
        self.network.start()?;
        self.bootstrapper.start();
        self.consensus.start()?;

        enum Event {
            Cancelled,
            Outgoing(Message),
            Timeout(Hrs),
            Ingress(Message),
            Closed,
        }

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Cancelled,
                message = self.broadcast_rx.next() => {
                    message.map_or(Event::Closed, Event::Outgoing)
                }
                target = self.timeout_rx.next() => {
                    target.map_or(Event::Closed, Event::Timeout)
                }
                message = self.ingress_rx.next() => {
                    message.map_or(Event::Closed, Event::Ingress)
                }
            };

            match event {
                Event::Cancelled | Event::Closed => {
                    self.bootstrapper.stop();
                    self.network.stop();
                    return Ok(());
                }
                Event::Outgoing(message) => {
                    if let Err(err) = self.network.publish_message(&message) {
                        warn!("could not publish {}: {}", message, err);
                    }
                }
                Event::Timeout(target) => {
                    if let Err(err) = self.consensus.handle_timeout(target) {
                        if let Error::Internal(_) = err {
                            error!("consensus invariant violated: {}", err);
                            self.network.stop();
                            return Err(err.into());
                        }
                        warn!("timeout handling failed: {}", err);
                    }
                }
                Event::Ingress(message) => match self.handle_message(message) {
                    Ok(()) => {}
                    Err(err @ Error::Internal(_)) => {
                        error!("consensus invariant violated: {}", err);
                        self.network.stop();
                        return Err(err.into());
                    }
                    Err(err) => warn!("rejected message: {}", err),
                },
            }
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("hrs", &self.consensus.hrs())
            .field("pool", &self.pool)
            .finish()
    }
}
