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

//! Account state: an address with a monotonic sequence and a balance.
//!
//! Accounts are mutated only through the sandbox within the execution of a
//! transaction.

use serde_derive::{Deserialize, Serialize};

use crate::{
    crypto::Address,
    encoding::{Canonical, CodecError, TagReader, TagWriter},
};

const TAG_ADDRESS: u8 = 1;
const TAG_SEQUENCE: u8 = 2;
const TAG_BALANCE: u8 = 3;

/// Ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    address: Address,
    sequence: u64,
    balance: i64,
}

impl Account {
    /// Creates a fresh account with zero sequence and balance.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            sequence: 0,
            balance: 0,
        }
    }

    /// Returns the account address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the last used sequence number. The next valid transaction
    /// from this account carries `sequence() + 1`.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the account balance.
    pub fn balance(&self) -> i64 {
        self.balance
    }

    /// Advances the sequence by one.
    pub fn increment_sequence(&mut self) {
        self.sequence += 1;
    }

    /// Credits the balance.
    pub fn add_to_balance(&mut self, amount: i64) {
        self.balance += amount;
    }

    /// Debits the balance. Callers check sufficiency first.
    pub fn subtract_from_balance(&mut self, amount: i64) {
        self.balance -= amount;
    }
}

impl Canonical for Account {
    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        self.address.encode_into(&mut writer, TAG_ADDRESS);
        writer.write_u64(TAG_SEQUENCE, self.sequence);
        writer.write_i64(TAG_BALANCE, self.balance);
        writer.into_bytes()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let account = Self {
            address: Address::decode_from(&mut reader, TAG_ADDRESS)?,
            sequence: reader.read_u64(TAG_SEQUENCE)?,
            balance: reader.read_i64(TAG_BALANCE)?,
        };
        reader.finish()?;
        Ok(account)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crypto::gen_keypair;

    #[test]
    fn balance_and_sequence_updates() {
        let (public_key, _) = gen_keypair();
        let mut account = Account::new(public_key.address());
        account.add_to_balance(3000);
        account.subtract_from_balance(1000);
        account.increment_sequence();

        assert_eq!(account.balance(), 2000);
        assert_eq!(account.sequence(), 1);
    }

    #[test]
    fn canonical_round_trip() {
        let (public_key, _) = gen_keypair();
        let mut account = Account::new(public_key.address());
        account.add_to_balance(42);
        account.increment_sequence();

        let bytes = account.to_bytes();
        let restored = Account::from_bytes(&bytes).unwrap();
        assert_eq!(restored, account);
        assert_eq!(restored.to_bytes(), bytes);
    }
}
