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

//! The transaction execution engine.
//!
//! `execute` either applies all of a transaction's state mutations to the
//! sandbox and raises the accumulated-fee counter, or returns an error and
//! leaves the sandbox unchanged. Every check runs before the first
//! mutation, so a rejected transaction cannot leave a partial write behind.

use log::debug;

use crate::{
    crypto::{Address, PublicKey},
    error::{Error, Result},
    sandbox::Sandbox,
    transaction::{Payload, Tx},
};

/// Validates and applies transactions against a sandbox.
#[derive(Debug, Default)]
pub struct Execution {
    accumulated_fee: i64,
}

impl Execution {
    /// Creates an engine with a zero fee counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fees collected by successful executions so far. The
    /// mint of this value to the proposer happens at commit, outside the
    /// engine.
    pub fn accumulated_fee(&self) -> i64 {
        self.accumulated_fee
    }

    /// Resets the fee counter, e.g. when a checker instance is reused
    /// across heights.
    pub fn reset_fee(&mut self) {
        self.accumulated_fee = 0;
    }

    /// Validates the transaction and applies its mutations to the sandbox.
    pub fn execute(&mut self, trx: &Tx, sandbox: &mut dyn Sandbox) -> Result<()> {
        trx.sanity_check()?;
        self.check_memo(trx, sandbox)?;
        self.check_stamp(trx, sandbox)?;
        self.check_signature(trx)?;

        match trx.payload().clone() {
            Payload::Send {
                sender,
                receiver,
                amount,
            } => self.execute_send(trx, sender, receiver, amount, sandbox),
            Payload::Bond {
                bonder,
                validator,
                stake,
            } => self.execute_bond(trx, bonder, validator, stake, sandbox),
            Payload::Sortition { address, proof } => {
                self.execute_sortition(trx, address, &proof, sandbox)
            }
        }
    }

    fn check_memo(&self, trx: &Tx, sandbox: &dyn Sandbox) -> Result<()> {
        if trx.memo().len() > sandbox.max_memo_length() {
            return Err(Error::InvalidTx("memo is too long".into()));
        }
        Ok(())
    }

    fn check_stamp(&self, trx: &Tx, sandbox: &dyn Sandbox) -> Result<()> {
        let stamp_height = sandbox
            .recent_block_height(&trx.stamp())
            .ok_or_else(|| Error::InvalidTx("stamp references an unknown block".into()))?;
        let interval = sandbox.current_height().distance(stamp_height);
        if interval > sandbox.transaction_to_live_interval() {
            return Err(Error::InvalidTx("stamp is expired".into()));
        }
        Ok(())
    }

    fn check_signature(&self, trx: &Tx) -> Result<()> {
        let public_key = trx
            .public_key()
            .ok_or_else(|| Error::InvalidTx("no public key".into()))?;
        if !public_key.verify(&trx.sign_bytes(), &self.signature_of(trx)?) {
            return Err(Error::InvalidTx("invalid signature".into()));
        }
        if !trx.signer().verify(&public_key) {
            return Err(Error::InvalidTx(
                "public key does not belong to the signer".into(),
            ));
        }
        Ok(())
    }

    fn signature_of(&self, trx: &Tx) -> Result<crate::crypto::Signature> {
        trx.signature()
            .ok_or_else(|| Error::InvalidTx("no signature".into()))
    }

    fn check_fee(&self, amount: i64, fee: i64, sandbox: &dyn Sandbox) -> Result<()> {
        let fraction_fee = (amount as f64 * sandbox.fee_fraction()).ceil() as i64;
        let minimum = sandbox.min_fee().max(fraction_fee);
        if fee < minimum {
            return Err(Error::InvalidTx(format!(
                "fee {} is below the policy minimum {}",
                fee, minimum
            )));
        }
        Ok(())
    }

    fn execute_send(
        &mut self,
        trx: &Tx,
        sender: Address,
        receiver: Address,
        amount: i64,
        sandbox: &mut dyn Sandbox,
    ) -> Result<()> {
        let mut sender_account = sandbox
            .account(&sender)
            .ok_or_else(|| Error::InvalidTx("unknown sender".into()))?;
        if trx.sequence() != sender_account.sequence() + 1 {
            return Err(Error::InvalidTx(format!(
                "invalid sequence, expected {}, got {}",
                sender_account.sequence() + 1,
                trx.sequence()
            )));
        }
        self.check_fee(amount, trx.fee(), sandbox)?;
        if sender_account.balance() < amount + trx.fee() {
            return Err(Error::InvalidTx("insufficient balance".into()));
        }

        sender_account.increment_sequence();
        sender_account.subtract_from_balance(amount + trx.fee());
        sandbox.update_account(&sender_account);

        // The receiver is read after the sender update, so a self-send
        // credits the already-debited balance.
        let mut receiver_account = match sandbox.account(&receiver) {
            Some(account) => account,
            None => sandbox.make_new_account(&receiver),
        };
        receiver_account.add_to_balance(amount);
        sandbox.update_account(&receiver_account);

        self.accumulated_fee += trx.fee();
        debug!("executed {}: {} -> {}", trx.fingerprint(), sender, receiver);
        Ok(())
    }

    fn execute_bond(
        &mut self,
        trx: &Tx,
        bonder: Address,
        validator_key: PublicKey,
        stake: i64,
        sandbox: &mut dyn Sandbox,
    ) -> Result<()> {
        let mut bonder_account = sandbox
            .account(&bonder)
            .ok_or_else(|| Error::InvalidTx("unknown bonder".into()))?;
        if trx.sequence() != bonder_account.sequence() + 1 {
            return Err(Error::InvalidTx(format!(
                "invalid sequence, expected {}, got {}",
                bonder_account.sequence() + 1,
                trx.sequence()
            )));
        }
        if bonder_account.balance() < stake + trx.fee() {
            return Err(Error::InvalidTx("insufficient balance".into()));
        }

        bonder_account.increment_sequence();
        bonder_account.subtract_from_balance(stake + trx.fee());
        sandbox.update_account(&bonder_account);

        let mut validator = match sandbox.validator(&validator_key.address()) {
            Some(validator) => validator,
            None => sandbox.make_new_validator(&validator_key),
        };
        validator.add_to_stake(stake);
        sandbox.update_validator(&validator);

        self.accumulated_fee += trx.fee();
        debug!("executed {}: bonded {}", trx.fingerprint(), stake);
        Ok(())
    }

    fn execute_sortition(
        &mut self,
        trx: &Tx,
        address: Address,
        proof: &[u8],
        sandbox: &mut dyn Sandbox,
    ) -> Result<()> {
        let mut validator = sandbox
            .validator(&address)
            .ok_or_else(|| Error::InvalidTx("unknown validator".into()))?;
        if trx.sequence() != validator.sequence() + 1 {
            return Err(Error::InvalidTx(format!(
                "invalid sequence, expected {}, got {}",
                validator.sequence() + 1,
                trx.sequence()
            )));
        }
        if !sandbox.verify_sortition(&trx.stamp(), proof, &validator) {
            return Err(Error::InvalidProof("sortition proof rejected".into()));
        }

        validator.increment_sequence();
        validator.set_last_joined_height(sandbox.current_height());
        sandbox.update_validator(&validator);
        sandbox.add_to_set(&trx.stamp(), address)?;

        debug!("executed {}: joined committee", trx.fingerprint());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        crypto::{gen_keypair, Hash, PrivateKey},
        sandbox::MockSandbox,
        validator::Validator,
    };

    struct TestEnv {
        exec: Execution,
        sandbox: MockSandbox,
        addr1: Address,
        pub1: PublicKey,
        priv1: PrivateKey,
        addr2: Address,
        pub2: PublicKey,
        priv2: PrivateKey,
        stamp: Hash,
        total_coin: i64,
    }

    fn setup() -> TestEnv {
        let mut sandbox = MockSandbox::new();

        let (pub1, priv1) = gen_keypair();
        let addr1 = pub1.address();
        let mut acc1 = sandbox.make_new_account(&addr1);
        acc1.add_to_balance(3000);
        sandbox.update_account(&acc1);

        let (pub2, priv2) = gen_keypair();
        let addr2 = pub2.address();
        let mut acc2 = sandbox.make_new_account(&addr2);
        acc2.add_to_balance(10_000_000_000_000_000);
        sandbox.update_account(&acc2);

        let val1 = Validator::new(pub1, Height(0));
        sandbox.update_validator(&val1);

        let stamp = Hash::calc(b"recent block");
        sandbox.append_stamp_and_update_height(100, stamp);

        TestEnv {
            exec: Execution::new(),
            sandbox,
            addr1,
            pub1,
            priv1,
            addr2,
            pub2,
            priv2,
            stamp,
            total_coin: 10_000_000_000_000_000 + 3000,
        }
    }

    use crate::helpers::Height;

    fn signed_send(
        env: &TestEnv,
        sequence: u64,
        sender: Address,
        receiver: Address,
        amount: i64,
        fee: i64,
        memo: &str,
        public_key: PublicKey,
        private_key: &PrivateKey,
    ) -> Tx {
        let mut trx = Tx::new_send(
            env.stamp,
            sequence,
            sender,
            receiver,
            amount,
            fee,
            memo,
            Some(public_key),
        );
        trx.set_signature(private_key.sign(&trx.sign_bytes()));
        trx
    }

    fn check_total_coin(env: &TestEnv) {
        let mut total: i64 = env
            .sandbox
            .accounts
            .values()
            .map(|account| account.balance())
            .sum();
        total += env
            .sandbox
            .validators
            .values()
            .map(|validator| validator.stake())
            .sum::<i64>();
        assert_eq!(total + env.exec.accumulated_fee(), env.total_coin);
    }

    #[test]
    fn execute_send_tx() {
        let mut env = setup();
        let (receiver_pub, receiver_priv) = gen_keypair();
        let receiver = receiver_pub.address();

        // Unknown sender.
        let trx1 = signed_send(
            &env,
            1,
            receiver,
            receiver,
            100,
            1000,
            "invalid sender",
            receiver_pub,
            &receiver_priv,
        );
        assert!(env.exec.execute(&trx1, &mut env.sandbox).is_err());

        // Sequence is off by one.
        let seq = env.sandbox.account_sequence(&env.addr1);
        let trx2 = signed_send(
            &env,
            seq + 2,
            env.addr1,
            receiver,
            1000,
            1000,
            "invalid sequence",
            env.pub1,
            &env.priv1,
        );
        assert!(env.exec.execute(&trx2, &mut env.sandbox).is_err());

        // Insufficient balance.
        let trx3 = signed_send(
            &env,
            seq + 1,
            env.addr1,
            receiver,
            2001,
            1000,
            "insufficient balance",
            env.pub1,
            &env.priv1,
        );
        assert!(env.exec.execute(&trx3, &mut env.sandbox).is_err());

        // Fee below policy.
        let trx4 = signed_send(
            &env,
            seq + 1,
            env.addr1,
            receiver,
            1000,
            999,
            "invalid fee",
            env.pub1,
            &env.priv1,
        );
        assert!(env.exec.execute(&trx4, &mut env.sandbox).is_err());

        let trx5 = signed_send(
            &env,
            seq + 1,
            env.addr1,
            receiver,
            1000,
            1000,
            "ok",
            env.pub1,
            &env.priv1,
        );
        assert!(env.exec.execute(&trx5, &mut env.sandbox).is_ok());
        assert_eq!(env.sandbox.account(&env.addr1).unwrap().balance(), 1000);
        assert_eq!(env.sandbox.account(&receiver).unwrap().balance(), 1000);

        // Duplicated: the sequence no longer matches.
        assert!(env.exec.execute(&trx5, &mut env.sandbox).is_err());

        // Balance no longer covers amount + fee.
        let seq = env.sandbox.account_sequence(&env.addr1);
        let trx6 = signed_send(
            &env,
            seq + 1,
            env.addr1,
            receiver,
            1,
            1000,
            "insufficient balance",
            env.pub1,
            &env.priv1,
        );
        assert!(env.exec.execute(&trx6, &mut env.sandbox).is_err());

        let seq2 = env.sandbox.account_sequence(&env.addr2);
        let trx7 = signed_send(
            &env,
            seq2 + 1,
            env.addr2,
            receiver,
            5_000_000,
            5000,
            "ok",
            env.pub2,
            &env.priv2,
        );
        assert!(env.exec.execute(&trx7, &mut env.sandbox).is_ok());
        assert_eq!(env.exec.accumulated_fee(), 6000);

        check_total_coin(&env);
    }

    #[test]
    fn execute_bond_tx() {
        let mut env = setup();
        let (val_pub, val_priv) = gen_keypair();
        let val_addr = val_pub.address();

        // Unknown bonder account.
        let mut trx1 = Tx::new_bond(
            env.stamp,
            1,
            val_addr,
            val_pub,
            1000,
            0,
            "invalid bonder",
            Some(val_pub),
        );
        trx1.set_signature(val_priv.sign(&trx1.sign_bytes()));
        assert!(env.exec.execute(&trx1, &mut env.sandbox).is_err());

        // Sequence is off by one.
        let seq = env.sandbox.account_sequence(&env.addr1);
        let mut trx2 = Tx::new_bond(
            env.stamp,
            seq + 2,
            env.addr1,
            val_pub,
            1000,
            0,
            "invalid sequence",
            Some(env.pub1),
        );
        trx2.set_signature(env.priv1.sign(&trx2.sign_bytes()));
        assert!(env.exec.execute(&trx2, &mut env.sandbox).is_err());

        // Insufficient balance.
        let mut trx3 = Tx::new_bond(
            env.stamp,
            seq + 1,
            env.addr1,
            val_pub,
            3001,
            0,
            "insufficient balance",
            Some(env.pub1),
        );
        trx3.set_signature(env.priv1.sign(&trx3.sign_bytes()));
        assert!(env.exec.execute(&trx3, &mut env.sandbox).is_err());

        let mut trx4 = Tx::new_bond(
            env.stamp,
            seq + 1,
            env.addr1,
            val_pub,
            1000,
            0,
            "ok",
            Some(env.pub1),
        );
        trx4.set_signature(env.priv1.sign(&trx4.sign_bytes()));
        assert!(env.exec.execute(&trx4, &mut env.sandbox).is_ok());

        // Duplicated: the sequence no longer matches.
        assert!(env.exec.execute(&trx4, &mut env.sandbox).is_err());

        assert_eq!(env.sandbox.account(&env.addr1).unwrap().balance(), 2000);
        assert_eq!(env.sandbox.validator(&val_addr).unwrap().stake(), 1000);
        assert_eq!(env.exec.accumulated_fee(), 0);

        check_total_coin(&env);
    }

    #[test]
    fn execute_sortition_tx() {
        let mut env = setup();
        let (val_pub, val_priv) = gen_keypair();
        let val_addr = val_pub.address();
        let zero_proof = vec![0; 48];

        // Unknown validator.
        let mut trx1 = Tx::new_sortition(
            env.stamp,
            1,
            val_addr,
            zero_proof.clone(),
            "invalid validator",
            Some(val_pub),
        );
        trx1.set_signature(val_priv.sign(&trx1.sign_bytes()));
        assert!(env.exec.execute(&trx1, &mut env.sandbox).is_err());

        let validator = Validator::new(val_pub, Height(0));
        env.sandbox.update_validator(&validator);

        // Zero proof is rejected.
        let mut trx2 = Tx::new_sortition(
            env.stamp,
            1,
            val_addr,
            zero_proof,
            "invalid proof",
            Some(val_pub),
        );
        trx2.set_signature(val_priv.sign(&trx2.sign_bytes()));
        assert!(matches!(
            env.exec.execute(&trx2, &mut env.sandbox),
            Err(Error::InvalidProof(_))
        ));

        let proof = MockSandbox::valid_proof(&env.stamp, &validator);
        let mut trx3 = Tx::new_sortition(env.stamp, 1, val_addr, proof, "ok", Some(val_pub));
        trx3.set_signature(val_priv.sign(&trx3.sign_bytes()));
        assert!(env.exec.execute(&trx3, &mut env.sandbox).is_ok());

        assert_eq!(env.exec.accumulated_fee(), 0);
        assert_eq!(env.sandbox.joined(), &[val_addr]);
        assert_eq!(env.sandbox.validator(&val_addr).unwrap().sequence(), 1);

        check_total_coin(&env);
    }

    #[test]
    fn send_to_self() {
        let mut env = setup();
        let seq = env.sandbox.account_sequence(&env.addr1);

        let trx = signed_send(
            &env,
            seq + 1,
            env.addr1,
            env.addr1,
            1000,
            1000,
            "ok",
            env.pub1,
            &env.priv1,
        );
        assert!(env.exec.execute(&trx, &mut env.sandbox).is_ok());

        // Only the fee leaves the balance.
        let account = env.sandbox.account(&env.addr1).unwrap();
        assert_eq!(account.balance(), 2000);
        assert_eq!(account.sequence(), seq + 1);
    }

    #[test]
    fn memo_and_stamp_are_enforced() {
        let mut env = setup();
        let (receiver_pub, _) = gen_keypair();
        let receiver = receiver_pub.address();

        let long_memo = "m".repeat(65);
        let trx = signed_send(
            &env,
            1,
            env.addr1,
            receiver,
            100,
            1000,
            &long_memo,
            env.pub1,
            &env.priv1,
        );
        assert!(env.exec.execute(&trx, &mut env.sandbox).is_err());

        // An unknown stamp is rejected.
        let mut unknown = Tx::new_send(
            Hash::calc(b"unknown"),
            1,
            env.addr1,
            receiver,
            100,
            1000,
            "",
            Some(env.pub1),
        );
        unknown.set_signature(env.priv1.sign(&unknown.sign_bytes()));
        assert!(env.exec.execute(&unknown, &mut env.sandbox).is_err());

        // A stamp older than the live interval is rejected.
        let old_stamp = Hash::calc(b"old block");
        env.sandbox.append_stamp_and_update_height(91, old_stamp);
        env.sandbox.append_stamp_and_update_height(100, env.stamp);
        let mut stale = Tx::new_send(
            old_stamp,
            1,
            env.addr1,
            receiver,
            100,
            1000,
            "",
            Some(env.pub1),
        );
        stale.set_signature(env.priv1.sign(&stale.sign_bytes()));
        assert!(env.exec.execute(&stale, &mut env.sandbox).is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let mut env = setup();
        let (receiver_pub, _) = gen_keypair();

        // Signed by a key that does not own the sender address.
        let mut trx = Tx::new_send(
            env.stamp,
            1,
            env.addr1,
            receiver_pub.address(),
            100,
            1000,
            "",
            Some(env.pub2),
        );
        trx.set_signature(env.priv2.sign(&trx.sign_bytes()));
        assert!(env.exec.execute(&trx, &mut env.sandbox).is_err());

        // Signature over different sign-bytes.
        let mut trx = Tx::new_send(
            env.stamp,
            1,
            env.addr1,
            receiver_pub.address(),
            100,
            1000,
            "",
            Some(env.pub1),
        );
        trx.set_signature(env.priv1.sign(b"other bytes"));
        assert!(env.exec.execute(&trx, &mut env.sandbox).is_err());

        // A failed execution leaves the state untouched.
        assert_eq!(env.sandbox.account(&env.addr1).unwrap().balance(), 3000);
        assert_eq!(env.sandbox.account_sequence(&env.addr1), 0);
    }
}
