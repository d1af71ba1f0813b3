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

//! Cryptography related types, constants and functions: SHA-256 content
//! digests, Ed25519 key pairs and signatures, and addresses derived from
//! public keys.
//!
//! All types render as hex strings in JSON and as short fingerprints in
//! debug output.

use anyhow::{bail, ensure};
use ed25519_dalek::{Signer as _, Verifier as _};
use rand::RngCore;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use std::fmt;

use crate::encoding::{CodecError, TagReader, TagWriter};

/// Width of a content digest in bytes.
pub const HASH_SIZE: usize = 32;
/// Width of an address in bytes.
pub const ADDRESS_SIZE: usize = 20;
/// Width of an Ed25519 public key in bytes.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Width of an Ed25519 private key seed in bytes.
pub const PRIVATE_KEY_SIZE: usize = 32;
/// Width of an Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// The number of bytes rendered in fingerprints and debug output.
const BYTES_IN_FINGERPRINT: usize = 4;

macro_rules! implement_byte_wrapper {
    ($(#[$attr:meta])* $name:ident, $size:expr) => {
        $(#[$attr])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; $size]);

        impl $name {
            /// Creates the value from a fixed-width byte array.
            pub fn new(bytes: [u8; $size]) -> Self {
                Self(bytes)
            }

            /// Creates the value from a slice, returning `None` on a width
            /// mismatch.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                if bytes.len() != $size {
                    return None;
                }
                let mut array = [0; $size];
                array.copy_from_slice(bytes);
                Some(Self(array))
            }

            /// Restores the value from a hex string.
            pub fn from_hex(hex: &str) -> anyhow::Result<Self> {
                let bytes = hex::decode(hex)?;
                match Self::from_slice(&bytes) {
                    Some(value) => Ok(value),
                    None => bail!(
                        "invalid {} length: {}",
                        stringify!($name),
                        bytes.len()
                    ),
                }
            }

            /// Returns the hex rendering of the value.
            pub fn to_hex(&self) -> String {
                hex::encode(&self.0[..])
            }

            /// Returns a short hex prefix for logging.
            pub fn fingerprint(&self) -> String {
                hex::encode(&self.0[..BYTES_IN_FINGERPRINT])
            }

            /// Returns the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $size] {
                &self.0
            }

            pub(crate) fn encode_into(&self, writer: &mut TagWriter, tag: u8) {
                writer.write_fixed(tag, &self.0[..]);
            }

            pub(crate) fn decode_from(
                reader: &mut TagReader<'_>,
                tag: u8,
            ) -> Result<Self, CodecError> {
                let bytes = reader.read_fixed(tag, $size)?;
                Self::from_slice(bytes)
                    .ok_or_else(|| CodecError::Malformed(stringify!($name).into()))
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0[..]
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({}...)"), self.fingerprint())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let hex = String::deserialize(deserializer)?;
                Self::from_hex(&hex).map_err(de::Error::custom)
            }
        }
    };
}

implement_byte_wrapper! {
    /// Fixed-width SHA-256 content digest with a distinguished all-zero
    /// "undefined" value.
    Hash, HASH_SIZE
}

implement_byte_wrapper! {
    /// Identity derived from an Ed25519 public key.
    Address, ADDRESS_SIZE
}

implement_byte_wrapper! {
    /// Ed25519 public key.
    PublicKey, PUBLIC_KEY_SIZE
}

implement_byte_wrapper! {
    /// Detached Ed25519 signature.
    Signature, SIGNATURE_SIZE
}

impl Hash {
    /// Returns the distinguished undefined hash.
    pub fn undef() -> Self {
        Self([0; HASH_SIZE])
    }

    /// Checks whether the hash is the undefined value.
    pub fn is_undef(&self) -> bool {
        self.0 == [0; HASH_SIZE]
    }

    /// Computes the digest of the given data.
    pub fn calc(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Verifies the hash is defined.
    pub fn sanity_check(&self) -> anyhow::Result<()> {
        ensure!(!self.is_undef(), "hash is undefined");
        Ok(())
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::undef()
    }
}

impl Address {
    /// Derives the address of an Ed25519 public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Sha256::digest(public_key.as_ref());
        let mut bytes = [0; ADDRESS_SIZE];
        bytes.copy_from_slice(&digest[..ADDRESS_SIZE]);
        Self(bytes)
    }

    /// Checks that the address is derived from the given public key.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        *self == Self::from_public_key(public_key)
    }

    /// Verifies the address is defined.
    pub fn sanity_check(&self) -> anyhow::Result<()> {
        ensure!(self.0 != [0; ADDRESS_SIZE], "address is undefined");
        Ok(())
    }
}

impl PublicKey {
    /// Returns the address derived from this key.
    pub fn address(&self) -> Address {
        Address::from_public_key(self)
    }

    /// Verifies a detached signature over the given data.
    pub fn verify(&self, data: &[u8], signature: &Signature) -> bool {
        let key = match ed25519_dalek::VerifyingKey::from_bytes(&self.0) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        key.verify(data, &signature).is_ok()
    }
}

/// Ed25519 private key.
#[derive(Clone)]
pub struct PrivateKey([u8; PRIVATE_KEY_SIZE]);

impl PrivateKey {
    /// Creates the key from a 32-byte seed.
    pub fn new(seed: [u8; PRIVATE_KEY_SIZE]) -> Self {
        Self(seed)
    }

    /// Returns the public key of this private key.
    pub fn public_key(&self) -> PublicKey {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        PublicKey::new(key.verifying_key().to_bytes())
    }

    /// Signs a slice of bytes and returns the detached signature.
    pub fn sign(&self, data: &[u8]) -> Signature {
        let key = ed25519_dalek::SigningKey::from_bytes(&self.0);
        Signature::new(key.sign(data).to_bytes())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never render key material.
        write!(f, "PrivateKey(for {:?})", self.public_key())
    }
}

/// Signing capability: a private key together with its derived identity.
#[derive(Debug, Clone)]
pub struct Signer {
    private_key: PrivateKey,
    public_key: PublicKey,
    address: Address,
}

impl Signer {
    /// Creates a signer from a private key.
    pub fn new(private_key: PrivateKey) -> Self {
        let public_key = private_key.public_key();
        let address = public_key.address();
        Self {
            private_key,
            public_key,
            address,
        }
    }

    /// Returns the signer's address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Returns the signer's public key.
    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Signs the given sign-bytes.
    pub fn sign(&self, data: &[u8]) -> Signature {
        self.private_key.sign(data)
    }
}

/// Generates a fresh Ed25519 key pair from the operating system RNG.
pub fn gen_keypair() -> (PublicKey, PrivateKey) {
    let mut seed = [0; PRIVATE_KEY_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let private_key = PrivateKey::new(seed);
    (private_key.public_key(), private_key)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn hash_calc_is_stable() {
        let hash1 = Hash::calc(b"ostraka");
        let hash2 = Hash::calc(b"ostraka");
        assert_eq!(hash1, hash2);
        assert!(!hash1.is_undef());
        assert!(hash1.sanity_check().is_ok());
        assert!(Hash::undef().sanity_check().is_err());
    }

    #[test]
    fn hash_hex_round_trip() {
        let hash = Hash::calc(b"abc");
        let restored = Hash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, restored);
        assert!(Hash::from_hex("deadbeef").is_err());
    }

    #[test]
    fn sign_and_verify() {
        let (public_key, private_key) = gen_keypair();
        let signature = private_key.sign(b"payload");
        assert!(public_key.verify(b"payload", &signature));
        assert!(!public_key.verify(b"other payload", &signature));

        let (other_key, _) = gen_keypair();
        assert!(!other_key.verify(b"payload", &signature));
    }

    #[test]
    fn address_belongs_to_key() {
        let (public_key, _) = gen_keypair();
        let address = public_key.address();
        assert!(address.verify(&public_key));

        let (other_key, _) = gen_keypair();
        assert!(!address.verify(&other_key));
    }

    #[test]
    fn signer_uses_own_identity() {
        let (public_key, private_key) = gen_keypair();
        let signer = Signer::new(private_key);
        assert_eq!(signer.public_key(), public_key);
        assert_eq!(signer.address(), public_key.address());
        assert!(public_key.verify(b"data", &signer.sign(b"data")));
    }

    #[test]
    fn json_form_is_hex() {
        let hash = Hash::calc(b"json");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }
}
