//! Node identity keys and the sealed box used during the handshake.
//!
//! A node is addressed by the public half of an x25519 key pair. ClientInfo
//! and ServerInfo payloads are sealed with XChaCha20-Poly1305 under the
//! shared secret of the two key pairs, prefixed with a random 24-byte nonce.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::WireError;

/// Length of a public or private key in bytes
pub const KEY_LEN: usize = 32;

/// Length of the sealed-box nonce
pub const NONCE_LEN: usize = 24;

const PUBLIC_PREFIX: &str = "nodekey:";
const PRIVATE_PREFIX: &str = "privkey:";

/// Public half of a node key; the addressing unit of the relay
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodePublic([u8; KEY_LEN]);

impl NodePublic {
    /// Wrap raw key bytes
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key from the front of a payload
    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        let raw: [u8; KEY_LEN] = bytes
            .get(..KEY_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| WireError::Key(format!("need {} bytes, got {}", KEY_LEN, bytes.len())))?;
        Ok(Self(raw))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Whether this is the all-zero key
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; KEY_LEN]
    }

    /// Abbreviated form for log lines, e.g. `[1a2b3]`
    pub fn short_string(&self) -> String {
        let hex = hex::encode(&self.0[..3]);
        format!("[{}]", &hex[..5])
    }
}

impl fmt::Display for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", PUBLIC_PREFIX, hex::encode(self.0))
    }
}

impl fmt::Debug for NodePublic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePublic{}", self.short_string())
    }
}

impl FromStr for NodePublic {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix(PUBLIC_PREFIX)
            .ok_or_else(|| WireError::Key(format!("missing {:?} prefix", PUBLIC_PREFIX)))?;
        Ok(Self(decode_key_hex(hex_part)?))
    }
}

impl TryFrom<String> for NodePublic {
    type Error = WireError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<NodePublic> for String {
    fn from(key: NodePublic) -> Self {
        key.to_string()
    }
}

/// Private half of a node key
#[derive(Clone)]
pub struct NodePrivate(StaticSecret);

impl NodePrivate {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(rand::rngs::OsRng))
    }

    /// Build a key from raw secret bytes
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Public half of this key
    pub fn public(&self) -> NodePublic {
        NodePublic(PublicKey::from(&self.0).to_bytes())
    }

    /// Text form, `privkey:<hex>`
    pub fn to_text(&self) -> String {
        format!("{}{}", PRIVATE_PREFIX, hex::encode(self.0.to_bytes()))
    }

    /// Seal `plaintext` for `peer`. Output is `nonce || ciphertext`.
    pub fn seal_to(&self, peer: &NodePublic, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = self
            .cipher(peer)
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireError::Malformed("box seal failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a box sealed by `peer` with [`NodePrivate::seal_to`]
    pub fn open_from(&self, peer: &NodePublic, sealed: &[u8]) -> Result<Vec<u8>, WireError> {
        if sealed.len() < NONCE_LEN {
            return Err(WireError::Open);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);

        self.cipher(peer)
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| WireError::Open)
    }

    fn cipher(&self, peer: &NodePublic) -> XChaCha20Poly1305 {
        let shared = self.0.diffie_hellman(&PublicKey::from(peer.0));
        XChaCha20Poly1305::new(Key::from_slice(shared.as_bytes()))
    }
}

impl fmt::Debug for NodePrivate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodePrivate(public={})", self.public().short_string())
    }
}

impl FromStr for NodePrivate {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex_part = s
            .strip_prefix(PRIVATE_PREFIX)
            .ok_or_else(|| WireError::Key(format!("missing {:?} prefix", PRIVATE_PREFIX)))?;
        Ok(Self::from_bytes(decode_key_hex(hex_part)?))
    }
}

fn decode_key_hex(s: &str) -> Result<[u8; KEY_LEN], WireError> {
    let bytes = hex::decode(s).map_err(|e| WireError::Key(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| WireError::Key(format!("need {} bytes, got {}", KEY_LEN, b.len())))
}
