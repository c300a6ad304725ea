use crate::Error;
use crate::codec::random_array;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// 20-byte member identifier, usually the truncated SHA-256 of a public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; Identifier::LEN]);

impl Identifier {
    pub const LEN: usize = 20;

    /// First 20 bytes of the SHA-256 digest of `public_key`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; Self::LEN];
        id.copy_from_slice(&digest[..Self::LEN]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl From<[u8; Identifier::LEN]> for Identifier {
    fn from(bytes: [u8; Identifier::LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({self})")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct X25519PublicKey(PublicKey);

impl X25519PublicKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for X25519PublicKey {
    fn from(bytes: [u8; 32]) -> Self {
        Self(PublicKey::from(bytes))
    }
}

impl From<PublicKey> for X25519PublicKey {
    fn from(value: PublicKey) -> Self {
        Self(value)
    }
}

impl AsRef<PublicKey> for X25519PublicKey {
    fn as_ref(&self) -> &PublicKey {
        &self.0
    }
}

#[derive(Clone)]
pub struct X25519Secret(StaticSecret);

impl X25519Secret {
    /// Fresh secret from the OS random source.
    pub fn generate() -> Result<Self, Error> {
        Ok(Self::from(random_array::<32>()?))
    }

    /// Secret whose scalar is `HKDF-SHA256(ikm, no salt).expand(32)`.
    pub(crate) fn derive_from(ikm: &[u8; 32]) -> Result<Self, Error> {
        let mut okm = [0u8; 32];
        Hkdf::<Sha256>::new(None, ikm)
            .expand(&[], &mut okm)
            .map_err(|e| Error::CryptoPrecondition(e.to_string()))?;

        let secret = Self::from(okm);
        okm.zeroize();
        Ok(secret)
    }

    pub(crate) fn dh(&self, public_key: &X25519PublicKey) -> [u8; 32] {
        self.0.diffie_hellman(public_key.as_ref()).to_bytes()
    }

    pub fn public_key(&self) -> X25519PublicKey {
        PublicKey::from(&self.0).into()
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl From<[u8; 32]> for X25519Secret {
    fn from(bytes: [u8; 32]) -> Self {
        Self(StaticSecret::from(bytes))
    }
}

impl Zeroize for X25519Secret {
    fn zeroize(&mut self) {
        self.0.zeroize()
    }
}

/// Key state of a tree node.
#[derive(Clone)]
pub enum KeyPair {
    /// Keyless placeholder at the root slot.
    Sentinel,
    /// Key whose private half is only known to another member.
    PublicOnly(X25519PublicKey),
    WithPrivate(X25519PublicKey, X25519Secret),
}

impl KeyPair {
    pub fn generate() -> Result<Self, Error> {
        Ok(Self::from(X25519Secret::generate()?))
    }

    pub fn public_key(&self) -> Option<&X25519PublicKey> {
        match self {
            Self::Sentinel => None,
            Self::PublicOnly(public) | Self::WithPrivate(public, _) => Some(public),
        }
    }

    pub fn secret(&self) -> Option<&X25519Secret> {
        match self {
            Self::WithPrivate(_, secret) => Some(secret),
            _ => None,
        }
    }

    pub fn has_private(&self) -> bool {
        self.secret().is_some()
    }

    /// The same key with its private half dropped.
    pub fn to_public(&self) -> Self {
        match self.public_key() {
            Some(public) => Self::PublicOnly(*public),
            None => Self::Sentinel,
        }
    }
}

impl From<X25519Secret> for KeyPair {
    fn from(secret: X25519Secret) -> Self {
        Self::WithPrivate(secret.public_key(), secret)
    }
}

impl From<X25519PublicKey> for KeyPair {
    fn from(public: X25519PublicKey) -> Self {
        Self::PublicOnly(public)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sentinel => f.write_str("Sentinel"),
            Self::PublicOnly(public) => f.debug_tuple("PublicOnly").field(public).finish(),
            Self::WithPrivate(public, _) => f
                .debug_tuple("WithPrivate")
                .field(public)
                .field(&"<redacted>")
                .finish(),
        }
    }
}
