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

//! The transaction pool: a bounded, insertion-ordered staging buffer of
//! pending transactions.
//!
//! Transactions are validated on insert by a fresh execution attempt
//! against the pool's own sandbox. That check is advisory — a transaction
//! valid at insert may become invalid later, so the commit path
//! re-validates against the ledger.
//!
//! `pending_tx` is a request/reply fabric: a correlation map from requested
//! ID to one-shot waiters. The first waiter for an ID publishes a `TxsReq`;
//! concurrent waiters for the same ID share that outstanding request; each
//! wait has its own deadline. The pool lock is never held while waiting.

use futures::channel::mpsc;
use indexmap::IndexMap;
use log::{debug, error, warn};

use std::{
    collections::HashMap,
    sync::{mpsc as std_mpsc, RwLock},
    time::Duration,
};

use crate::{
    config::PoolConfig,
    crypto::Hash,
    error::{Error, Result},
    execution::Execution,
    messages::Message,
    sandbox::Sandbox,
    transaction::Tx,
};

struct Inner {
    pendings: IndexMap<Hash, Tx>,
    checker: Execution,
    sandbox: Box<dyn Sandbox>,
    waiters: HashMap<Hash, Vec<(u64, std_mpsc::SyncSender<Tx>)>>,
    next_waiter: u64,
}

impl Inner {
    fn append(&mut self, config: &PoolConfig, trx: &Tx) -> Result<()> {
        let id = trx.id();
        if self.pendings.contains_key(&id) {
            return Err(Error::InvalidTx(format!(
                "transaction is already in pool, id: {}",
                id.fingerprint()
            )));
        }

        if let Err(err) = self.checker.execute(trx, &mut *self.sandbox) {
            error!("invalid transaction: tx={}, err={}", trx.fingerprint(), err);
            return Err(err);
        }

        if self.pendings.len() >= config.max_size {
            // Full pool evicts the oldest entry silently.
            self.pendings.shift_remove_index(0);
        }
        self.pendings.insert(id, trx.clone());
        Ok(())
    }

    fn resolve_waiters(&mut self, trx: &Tx) {
        if let Some(waiters) = self.waiters.remove(&trx.id()) {
            for (_, sender) in waiters {
                // A waiter that timed out in the meantime is gone; ignore.
                let _ = sender.try_send(trx.clone());
            }
        }
    }
}

/// De-duplicated staging buffer of pending valid transactions with capacity
/// `max_size`; the oldest entry is evicted when the capacity is exceeded.
pub struct TxPool {
    config: PoolConfig,
    inner: RwLock<Inner>,
    broadcast: mpsc::Sender<Message>,
}

impl TxPool {
    /// Creates a pool validating against the given sandbox view and
    /// publishing on the given broadcast channel.
    pub fn new(config: PoolConfig, sandbox: Box<dyn Sandbox>, broadcast: mpsc::Sender<Message>) -> Self {
        Self {
            config,
            inner: RwLock::new(Inner {
                pendings: IndexMap::new(),
                checker: Execution::new(),
                sandbox,
                waiters: HashMap::new(),
                next_waiter: 0,
            }),
            broadcast,
        }
    }

    fn publish(&self, message: Message) {
        let mut sender = self.broadcast.clone();
        if let Err(err) = sender.try_send(message) {
            warn!("broadcast channel unavailable: {}", err);
        }
    }

    /// Validates the transaction and stages it, resolving any waiters for
    /// its ID.
    pub fn append_tx(&self, trx: Tx) -> Result<()> {
        let mut inner = self.inner.write().expect("pool write lock");
        inner.append(&self.config, &trx)?;
        inner.resolve_waiters(&trx);
        Ok(())
    }

    /// As `append_tx`, additionally announcing the transaction on the
    /// broadcast channel.
    pub fn append_tx_and_broadcast(&self, trx: Tx) -> Result<()> {
        {
            let mut inner = self.inner.write().expect("pool write lock");
            inner.append(&self.config, &trx)?;
            inner.resolve_waiters(&trx);
        }
        self.publish(Message::Txs(vec![trx]));
        Ok(())
    }

    /// Removes the transaction with the given ID, e.g. after it was
    /// committed.
    pub fn remove_tx(&self, id: &Hash) {
        let mut inner = self.inner.write().expect("pool write lock");
        inner.pendings.shift_remove(id);
    }

    /// Checks whether the pool holds the transaction.
    pub fn has_tx(&self, id: &Hash) -> bool {
        let inner = self.inner.read().expect("pool read lock");
        inner.pendings.contains_key(id)
    }

    /// Returns the number of staged transactions.
    pub fn size(&self) -> usize {
        let inner = self.inner.read().expect("pool read lock");
        inner.pendings.len()
    }

    /// Returns the staged transactions in insertion order.
    pub fn all_transactions(&self) -> Vec<Tx> {
        let inner = self.inner.read().expect("pool read lock");
        inner.pendings.values().cloned().collect()
    }

    /// Returns the staged transaction with the given ID without waiting.
    pub fn transaction(&self, id: &Hash) -> Option<Tx> {
        let inner = self.inner.read().expect("pool read lock");
        inner.pendings.get(id).cloned()
    }

    /// Returns the transaction with the given ID, requesting it from peers
    /// and waiting up to the configured timeout when it is not staged.
    ///
    /// Non-matching transactions arriving during the wait stay in the pool
    /// untouched. Returns `None` on timeout.
    pub fn pending_tx(&self, id: &Hash) -> Option<Tx> {
        {
            let inner = self.inner.read().expect("pool read lock");
            if let Some(trx) = inner.pendings.get(id) {
                return Some(trx.clone());
            }
        }

        debug!("request transaction from peers, id={}", id.fingerprint());
        let (receiver, token, first_waiter) = {
            let mut inner = self.inner.write().expect("pool write lock");
            // The transaction may have arrived while the lock was released.
            if let Some(trx) = inner.pendings.get(id) {
                return Some(trx.clone());
            }
            let (sender, receiver) = std_mpsc::sync_channel(1);
            let token = inner.next_waiter;
            inner.next_waiter += 1;
            let first_waiter = !inner.waiters.contains_key(id);
            inner.waiters.entry(*id).or_default().push((token, sender));
            (receiver, token, first_waiter)
        };

        if first_waiter {
            self.publish(Message::TxsReq(vec![*id]));
        }

        match receiver.recv_timeout(Duration::from_millis(self.config.waiting_timeout)) {
            Ok(trx) => {
                debug!("transaction found, id={}", id.fingerprint());
                Some(trx)
            }
            Err(_) => {
                warn!(
                    "transaction not received, id={}, timeout={}ms",
                    id.fingerprint(),
                    self.config.waiting_timeout
                );
                let mut inner = self.inner.write().expect("pool write lock");
                if let Some(waiters) = inner.waiters.get_mut(id) {
                    waiters.retain(|(waiter, _)| *waiter != token);
                }
                if inner.waiters.get(id).map_or(false, Vec::is_empty) {
                    inner.waiters.remove(id);
                }
                None
            }
        }
    }

    /// Returns a short identifier for logging.
    pub fn fingerprint(&self) -> String {
        format!("{{{}}}", self.size())
    }
}

impl std::fmt::Debug for TxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxPool").field("size", &self.size()).finish()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use std::{sync::Arc, thread, time::Duration};

    use super::*;
    use crate::{
        crypto::{gen_keypair, PrivateKey, PublicKey},
        messages::PayloadType,
        sandbox::MockSandbox,
    };

    struct TestEnv {
        pool: Arc<TxPool>,
        receiver: mpsc::Receiver<Message>,
        stamp: Hash,
        sender_pub: PublicKey,
        sender_priv: PrivateKey,
        sequence: u64,
    }

    impl TestEnv {
        fn next_tx(&mut self) -> Tx {
            let (receiver_pub, _) = gen_keypair();
            self.sequence += 1;
            let mut trx = Tx::new_send(
                self.stamp,
                self.sequence,
                self.sender_pub.address(),
                receiver_pub.address(),
                100,
                1000,
                "",
                Some(self.sender_pub),
            );
            trx.set_signature(self.sender_priv.sign(&trx.sign_bytes()));
            trx
        }

        fn published(&mut self) -> Option<Message> {
            self.receiver.try_next().ok().flatten()
        }
    }

    fn setup(max_size: usize) -> TestEnv {
        let mut sandbox = MockSandbox::new();
        let (sender_pub, sender_priv) = gen_keypair();
        let mut account = sandbox.make_new_account(&sender_pub.address());
        account.add_to_balance(1_000_000_000);
        sandbox.update_account(&account);
        let stamp = Hash::calc(b"stamp");
        sandbox.append_stamp_and_update_height(100, stamp);

        let (broadcast, receiver) = mpsc::channel(16);
        let config = PoolConfig {
            max_size,
            waiting_timeout: 50,
        };
        let pool = Arc::new(TxPool::new(config, Box::new(sandbox), broadcast));
        TestEnv {
            pool,
            receiver,
            stamp,
            sender_pub,
            sender_priv,
            sequence: 0,
        }
    }

    #[test]
    fn append_and_query() {
        let mut env = setup(10);
        let trx = env.next_tx();
        let id = trx.id();

        env.pool.append_tx(trx.clone()).unwrap();
        assert!(env.pool.has_tx(&id));
        assert_eq!(env.pool.size(), 1);
        assert_eq!(env.pool.pending_tx(&id), Some(trx.clone()));

        // Duplicates are rejected.
        assert!(matches!(
            env.pool.append_tx(trx),
            Err(Error::InvalidTx(_))
        ));

        env.pool.remove_tx(&id);
        assert!(!env.pool.has_tx(&id));
    }

    #[test]
    fn invalid_transaction_is_rejected() {
        let mut env = setup(10);
        let mut trx = env.next_tx();
        trx.set_signature(env.sender_priv.sign(b"bad bytes"));
        assert!(env.pool.append_tx(trx).is_err());
        assert_eq!(env.pool.size(), 0);
    }

    #[test]
    fn full_pool_evicts_oldest() {
        let mut env = setup(3);
        let first = env.next_tx();
        env.pool.append_tx(first.clone()).unwrap();
        for _ in 0..3 {
            let trx = env.next_tx();
            env.pool.append_tx(trx).unwrap();
        }

        assert_eq!(env.pool.size(), 3);
        assert!(!env.pool.has_tx(&first.id()));

        // Insertion order is preserved for the survivors.
        let all = env.pool.all_transactions();
        let sequences: Vec<_> = all.iter().map(Tx::sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
    }

    #[test]
    fn pending_tx_times_out_and_requests_once() {
        let mut env = setup(10);
        let id = Hash::calc(b"missing");

        assert_eq!(env.pool.pending_tx(&id), None);

        // Exactly one TxsReq was published.
        let message = env.published().expect("request published");
        assert_eq!(message.payload_type(), PayloadType::TxsReq);
        assert_eq!(message, Message::TxsReq(vec![id]));
        assert!(env.published().is_none());
    }

    #[test]
    fn pending_tx_resolves_on_arrival() {
        let mut env = setup(10);
        let unrelated = env.next_tx();
        let trx = env.next_tx();
        let id = trx.id();

        let pool = Arc::clone(&env.pool);
        let handle = thread::spawn(move || pool.pending_tx(&id));

        thread::sleep(Duration::from_millis(10));
        // A non-matching transaction does not resolve the wait and stays in
        // the pool.
        env.pool.append_tx(unrelated.clone()).unwrap();
        env.pool.append_tx(trx.clone()).unwrap();

        assert_eq!(handle.join().unwrap(), Some(trx));
        assert!(env.pool.has_tx(&unrelated.id()));
    }

    #[test]
    fn broadcast_on_append() {
        let mut env = setup(10);
        let trx = env.next_tx();
        env.pool.append_tx_and_broadcast(trx.clone()).unwrap();

        let message = env.published().expect("announcement published");
        assert_eq!(message, Message::Txs(vec![trx]));
    }
}
