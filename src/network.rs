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

//! The network seam and the peer bootstrapper.
//!
//! The gossip transport itself lives outside this crate; the node consumes
//! it through the [`Network`] trait. The [`Bootstrapper`] keeps the
//! transport connected to a minimum number of peers by periodically dialing
//! a random subset of a configured bootstrap list. All long-running work is
//! bound to a hierarchical cancellation token.

use async_trait::async_trait;
use futures::future::join_all;
use log::{error, warn};
use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use std::{fmt, sync::Arc, time::Duration};

use crate::{config::BootstrapConfig, messages::Message};

/// Identity of a remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A dialable peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Peer identity.
    pub id: PeerId,
    /// Peer address.
    pub address: String,
}

/// The gossip transport consumed by the pool and consensus.
///
/// Implementations hand the message-ingress channel to the node at
/// assembly time.
pub trait Network: Send + Sync {
    /// Starts the transport.
    fn start(&self) -> anyhow::Result<()>;

    /// Stops the transport.
    fn stop(&self);

    /// Publishes a message to the gossip topic.
    fn publish_message(&self, message: &Message) -> anyhow::Result<()>;
}

/// Dialing capability of the transport, consumed by the bootstrapper.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Returns the identities of the currently connected peers.
    fn connected_peers(&self) -> Vec<PeerId>;

    /// Dials a peer.
    async fn connect(&self, peer: &PeerInfo) -> anyhow::Result<()>;
}

/// Keeps the transport connected to at least `min_peer_threshold` peers.
///
/// On every period the bootstrapper compares the connection count against
/// the threshold and, when below it, dials a random subset of the
/// not-yet-connected bootstrap peers, each attempt bounded by the
/// configured connection timeout. Cancelling the parent token (or calling
/// `stop`) ends the loop.
pub struct Bootstrapper {
    config: BootstrapConfig,
    dialer: Arc<dyn Dialer>,
    cancel: CancellationToken,
}

impl Bootstrapper {
    /// Creates a bootstrapper bound to a child of the given cancellation
    /// token.
    pub fn new(config: BootstrapConfig, dialer: Arc<dyn Dialer>, parent: &CancellationToken) -> Self {
        Self {
            config,
            dialer,
            cancel: parent.child_token(),
        }
    }

    /// Spawns the periodic bootstrap task. The first check runs
    /// immediately.
    pub fn start(&self) {
        let config = self.config.clone();
        let dialer = Arc::clone(&self.dialer);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(config.period));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => bootstrap_round(&config, dialer.as_ref()).await,
                }
            }
        });
    }

    /// Stops the bootstrap task.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for Bootstrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bootstrapper")
            .field("config", &self.config)
            .finish()
    }
}

/// One bootstrap check: dial enough random unconnected bootstrap peers to
/// reach the threshold.
async fn bootstrap_round(config: &BootstrapConfig, dialer: &dyn Dialer) {
    let connected = dialer.connected_peers();
    let needed = config.min_peer_threshold.saturating_sub(connected.len());
    if needed == 0 {
        return;
    }

    let mut candidates: Vec<&PeerInfo> = config
        .peers
        .iter()
        .filter(|peer| !connected.contains(&peer.id))
        .collect();
    candidates.shuffle(&mut rand::thread_rng());

    if candidates.len() < needed {
        warn!(
            "not enough bootstrap nodes to maintain connections, threshold={}, current={}",
            config.min_peer_threshold,
            connected.len()
        );
    }

    let timeout = Duration::from_millis(config.connection_timeout);
    let dials = candidates.into_iter().take(needed).map(|peer| async move {
        match tokio::time::timeout(timeout, dialer.connect(peer)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!("error dialing bootstrap peer {}: {}", peer.id, err),
            Err(_) => warn!("dial to bootstrap peer {} timed out", peer.id),
        }
    });
    join_all(dials).await;
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockDialer {
        connected: Mutex<Vec<PeerId>>,
        dialed: Mutex<Vec<PeerId>>,
    }

    #[async_trait]
    impl Dialer for MockDialer {
        fn connected_peers(&self) -> Vec<PeerId> {
            self.connected.lock().unwrap().clone()
        }

        async fn connect(&self, peer: &PeerInfo) -> anyhow::Result<()> {
            self.dialed.lock().unwrap().push(peer.id.clone());
            self.connected.lock().unwrap().push(peer.id.clone());
            Ok(())
        }
    }

    fn config_with_peers(count: usize, threshold: usize) -> BootstrapConfig {
        BootstrapConfig {
            peers: (0..count)
                .map(|index| PeerInfo {
                    id: PeerId(format!("peer-{}", index)),
                    address: format!("/ip4/127.0.0.1/tcp/{}", 9000 + index),
                })
                .collect(),
            min_peer_threshold: threshold,
            period: 10,
            connection_timeout: 100,
        }
    }

    #[tokio::test]
    async fn dials_until_threshold() {
        let config = config_with_peers(4, 2);
        let dialer = MockDialer::default();

        bootstrap_round(&config, &dialer).await;
        assert_eq!(dialer.connected_peers().len(), 2);

        // Above the threshold nothing more is dialed.
        bootstrap_round(&config, &dialer).await;
        assert_eq!(dialer.dialed.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn skips_already_connected_peers() {
        let config = config_with_peers(2, 2);
        let dialer = MockDialer::default();
        dialer
            .connected
            .lock()
            .unwrap()
            .push(config.peers[0].id.clone());

        bootstrap_round(&config, &dialer).await;
        let dialed = dialer.dialed.lock().unwrap().clone();
        assert_eq!(dialed, vec![config.peers[1].id.clone()]);
    }

    #[tokio::test]
    async fn stop_cancels_the_loop() {
        let config = config_with_peers(8, 8);
        let dialer: Arc<MockDialer> = Arc::new(MockDialer::default());
        let root = CancellationToken::new();
        let bootstrapper =
            Bootstrapper::new(config, Arc::clone(&dialer) as Arc<dyn Dialer>, &root);

        bootstrapper.start();
        tokio::time::sleep(Duration::from_millis(30)).await;
        bootstrapper.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dialed_after_stop = dialer.dialed.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(dialer.dialed.lock().unwrap().len(), dialed_after_stop);
    }
}
