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

//! Transactions: a tagged union over the Send, Bond and Sortition kinds.
//!
//! Sign-bytes exclude the signature; the transaction ID is the hash of the
//! sign-bytes, so the ID is deterministic from the content and the kind tag.

use serde_derive::{Deserialize, Serialize};

use std::fmt;

use crate::{
    crypto::{Address, Hash, PublicKey, Signature},
    encoding::{Canonical, CodecError, TagReader, TagWriter},
    error::{Error, Result},
};

const TAG_STAMP: u8 = 1;
const TAG_SEQUENCE: u8 = 2;
const TAG_FEE: u8 = 3;
const TAG_PAYLOAD_TYPE: u8 = 4;
const TAG_PAYLOAD: u8 = 5;
const TAG_MEMO: u8 = 6;
const TAG_PUBLIC_KEY: u8 = 7;
const TAG_SIGNATURE: u8 = 8;

const TAG_SENDER: u8 = 1;
const TAG_RECEIVER: u8 = 2;
const TAG_AMOUNT: u8 = 3;
const TAG_VALIDATOR_KEY: u8 = 2;
const TAG_STAKE: u8 = 3;
const TAG_PROOF: u8 = 2;

/// Kind discriminant of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadType {
    /// Transfer of value between accounts.
    Send = 1,
    /// Bonding stake to a validator.
    Bond = 2,
    /// Joining the next committee with a sortition proof.
    Sortition = 3,
}

impl PayloadType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Send),
            2 => Some(Self::Bond),
            3 => Some(Self::Sortition),
            _ => None,
        }
    }
}

/// Kind-specific payload of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Debit `amount + fee` from `sender`, credit `amount` to `receiver`.
    Send {
        /// Paying account.
        sender: Address,
        /// Receiving account, created if absent.
        receiver: Address,
        /// Transferred value.
        amount: i64,
    },
    /// Debit `stake + fee` from `bonder` and add `stake` to the validator
    /// identified by `validator`.
    Bond {
        /// Paying account.
        bonder: Address,
        /// Public key of the bonded validator.
        validator: PublicKey,
        /// Bonded value.
        stake: i64,
    },
    /// Enter the next committee with a sortition proof over a recent block
    /// hash.
    Sortition {
        /// Address of the proving validator.
        address: Address,
        /// Verifiable-random proof.
        proof: Vec<u8>,
    },
}

impl Payload {
    /// Returns the kind discriminant of the payload.
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Self::Send { .. } => PayloadType::Send,
            Self::Bond { .. } => PayloadType::Bond,
            Self::Sortition { .. } => PayloadType::Sortition,
        }
    }

    /// Returns the identity that must have signed the transaction.
    pub fn signer(&self) -> Address {
        match self {
            Self::Send { sender, .. } => *sender,
            Self::Bond { bonder, .. } => *bonder,
            Self::Sortition { address, .. } => *address,
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = TagWriter::new();
        match self {
            Self::Send {
                sender,
                receiver,
                amount,
            } => {
                sender.encode_into(&mut writer, TAG_SENDER);
                receiver.encode_into(&mut writer, TAG_RECEIVER);
                writer.write_i64(TAG_AMOUNT, *amount);
            }
            Self::Bond {
                bonder,
                validator,
                stake,
            } => {
                bonder.encode_into(&mut writer, TAG_SENDER);
                validator.encode_into(&mut writer, TAG_VALIDATOR_KEY);
                writer.write_i64(TAG_STAKE, *stake);
            }
            Self::Sortition { address, proof } => {
                address.encode_into(&mut writer, TAG_SENDER);
                writer.write_bytes(TAG_PROOF, proof);
            }
        }
        writer.into_bytes()
    }

    fn from_bytes(payload_type: PayloadType, bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let payload = match payload_type {
            PayloadType::Send => Self::Send {
                sender: Address::decode_from(&mut reader, TAG_SENDER)?,
                receiver: Address::decode_from(&mut reader, TAG_RECEIVER)?,
                amount: reader.read_i64(TAG_AMOUNT)?,
            },
            PayloadType::Bond => Self::Bond {
                bonder: Address::decode_from(&mut reader, TAG_SENDER)?,
                validator: PublicKey::decode_from(&mut reader, TAG_VALIDATOR_KEY)?,
                stake: reader.read_i64(TAG_STAKE)?,
            },
            PayloadType::Sortition => Self::Sortition {
                address: Address::decode_from(&mut reader, TAG_SENDER)?,
                proof: reader.read_bytes(TAG_PROOF)?,
            },
        };
        reader.finish()?;
        Ok(payload)
    }
}

/// A transaction staged for inclusion in a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    stamp: Hash,
    sequence: u64,
    fee: i64,
    payload: Payload,
    memo: String,
    public_key: Option<PublicKey>,
    signature: Option<Signature>,
}

impl Tx {
    /// Creates a Send transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn new_send(
        stamp: Hash,
        sequence: u64,
        sender: Address,
        receiver: Address,
        amount: i64,
        fee: i64,
        memo: impl Into<String>,
        public_key: Option<PublicKey>,
    ) -> Self {
        Self {
            stamp,
            sequence,
            fee,
            payload: Payload::Send {
                sender,
                receiver,
                amount,
            },
            memo: memo.into(),
            public_key,
            signature: None,
        }
    }

    /// Creates a Bond transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn new_bond(
        stamp: Hash,
        sequence: u64,
        bonder: Address,
        validator: PublicKey,
        stake: i64,
        fee: i64,
        memo: impl Into<String>,
        public_key: Option<PublicKey>,
    ) -> Self {
        Self {
            stamp,
            sequence,
            fee,
            payload: Payload::Bond {
                bonder,
                validator,
                stake,
            },
            memo: memo.into(),
            public_key,
            signature: None,
        }
    }

    /// Creates a Sortition transaction. Sortition carries no fee.
    pub fn new_sortition(
        stamp: Hash,
        sequence: u64,
        address: Address,
        proof: Vec<u8>,
        memo: impl Into<String>,
        public_key: Option<PublicKey>,
    ) -> Self {
        Self {
            stamp,
            sequence,
            fee: 0,
            payload: Payload::Sortition { address, proof },
            memo: memo.into(),
            public_key,
            signature: None,
        }
    }

    /// Returns the stamp: a recent block hash bounding the validity window.
    pub fn stamp(&self) -> Hash {
        self.stamp
    }

    /// Returns the sender sequence number.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Returns the declared fee.
    pub fn fee(&self) -> i64 {
        self.fee
    }

    /// Returns the kind-specific payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Returns the kind discriminant.
    pub fn payload_type(&self) -> PayloadType {
        self.payload.payload_type()
    }

    /// Returns the memo string.
    pub fn memo(&self) -> &str {
        &self.memo
    }

    /// Returns the declared signer identity.
    pub fn signer(&self) -> Address {
        self.payload.signer()
    }

    /// Returns the sender public key, if attached.
    pub fn public_key(&self) -> Option<PublicKey> {
        self.public_key
    }

    /// Returns the signature, if attached.
    pub fn signature(&self) -> Option<Signature> {
        self.signature
    }

    /// Attaches the signature over the sign-bytes.
    pub fn set_signature(&mut self, signature: Signature) {
        self.signature = Some(signature);
    }

    /// Attaches the sender public key.
    pub fn set_public_key(&mut self, public_key: PublicKey) {
        self.public_key = Some(public_key);
    }

    /// Returns the canonical encoding with the signature separated out.
    pub fn sign_bytes(&self) -> Vec<u8> {
        self.encode(false)
    }

    /// Returns the transaction ID: the hash of the sign-bytes.
    pub fn id(&self) -> Hash {
        Hash::calc(&self.sign_bytes())
    }

    /// Returns a short identifier for logging.
    pub fn fingerprint(&self) -> String {
        format!("{{{:?} {}}}", self.payload_type(), self.id().fingerprint())
    }

    /// Returns the JSON form of the transaction for operator inspection.
    /// The JSON form is never hashed or signed.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn encode(&self, with_signature: bool) -> Vec<u8> {
        let mut writer = TagWriter::new();
        self.stamp.encode_into(&mut writer, TAG_STAMP);
        writer.write_u64(TAG_SEQUENCE, self.sequence);
        writer.write_i64(TAG_FEE, self.fee);
        writer.write_u8(TAG_PAYLOAD_TYPE, self.payload.payload_type() as u8);
        writer.write_bytes(TAG_PAYLOAD, &self.payload.to_bytes());
        writer.write_str(TAG_MEMO, &self.memo);
        writer.write_bool(TAG_PUBLIC_KEY, self.public_key.is_some());
        if let Some(public_key) = &self.public_key {
            public_key.encode_into(&mut writer, TAG_PUBLIC_KEY);
        }
        if with_signature {
            writer.write_bool(TAG_SIGNATURE, self.signature.is_some());
            if let Some(signature) = &self.signature {
                signature.encode_into(&mut writer, TAG_SIGNATURE);
            }
        }
        writer.into_bytes()
    }

    /// Checks the structural validity of the transaction.
    pub fn sanity_check(&self) -> Result<()> {
        if self.stamp.is_undef() {
            return Err(Error::InvalidTx("stamp is undefined".into()));
        }
        if self.sequence == 0 {
            return Err(Error::InvalidTx("sequence is zero".into()));
        }
        if self.fee < 0 {
            return Err(Error::InvalidTx("negative fee".into()));
        }
        match &self.payload {
            Payload::Send { amount, .. } => {
                if *amount < 0 {
                    return Err(Error::InvalidTx("negative amount".into()));
                }
            }
            Payload::Bond { stake, .. } => {
                if *stake < 0 {
                    return Err(Error::InvalidTx("negative stake".into()));
                }
            }
            Payload::Sortition { proof, .. } => {
                if self.fee != 0 {
                    return Err(Error::InvalidTx("sortition carries a fee".into()));
                }
                if proof.is_empty() {
                    return Err(Error::InvalidTx("empty sortition proof".into()));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

impl Canonical for Tx {
    fn to_bytes(&self) -> Vec<u8> {
        self.encode(true)
    }

    fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, CodecError> {
        let mut reader = TagReader::new(bytes);
        let stamp = Hash::decode_from(&mut reader, TAG_STAMP)?;
        let sequence = reader.read_u64(TAG_SEQUENCE)?;
        let fee = reader.read_i64(TAG_FEE)?;
        let payload_type = PayloadType::from_u8(reader.read_u8(TAG_PAYLOAD_TYPE)?)
            .ok_or_else(|| CodecError::Malformed("unknown payload type".into()))?;
        let payload_bytes = reader.read_bytes(TAG_PAYLOAD)?;
        let payload = Payload::from_bytes(payload_type, &payload_bytes)?;
        let memo = reader.read_str(TAG_MEMO)?;
        let public_key = if reader.read_bool(TAG_PUBLIC_KEY)? {
            Some(PublicKey::decode_from(&mut reader, TAG_PUBLIC_KEY)?)
        } else {
            None
        };
        let signature = if reader.read_bool(TAG_SIGNATURE)? {
            Some(Signature::decode_from(&mut reader, TAG_SIGNATURE)?)
        } else {
            None
        };
        reader.finish()?;
        Ok(Self {
            stamp,
            sequence,
            fee,
            payload,
            memo,
            public_key,
            signature,
        })
    }
}
