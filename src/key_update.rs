use crate::codec::ByteReader;
use crate::{Error, Identifier, X25519PublicKey};

const KEY_LEN: usize = 32;
const REPLACE_INDEX_LEN: usize = 2;

/// Which leaf a [`KeyUpdate`] is meant for.
///
/// The wire format tells the variants apart by the residue of the total length
/// modulo 32, so at most one of them can travel with an update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpdateTarget {
    /// Receiver resolves the leaf on its own.
    #[default]
    Unspecified,
    Member(Identifier),
    /// Leaf index of a slot to overwrite.
    ReplaceLeaf(u16),
}

/// Public keys along one leaf-to-root path of a [`DhTree`](crate::DhTree), leaf first.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyUpdate {
    pub keys: Vec<X25519PublicKey>,
    pub target: UpdateTarget,
}

impl KeyUpdate {
    pub fn new(keys: Vec<X25519PublicKey>) -> Self {
        Self {
            keys,
            target: UpdateTarget::Unspecified,
        }
    }

    pub fn with_identifier(mut self, identifier: Identifier) -> Self {
        self.target = UpdateTarget::Member(identifier);
        self
    }

    pub fn with_replace_leaf_index(mut self, leaf_index: u16) -> Self {
        self.target = UpdateTarget::ReplaceLeaf(leaf_index);
        self
    }

    pub fn identifier(&self) -> Option<&Identifier> {
        match &self.target {
            UpdateTarget::Member(identifier) => Some(identifier),
            _ => None,
        }
    }

    pub fn replace_leaf_index(&self) -> Option<u16> {
        match self.target {
            UpdateTarget::ReplaceLeaf(index) => Some(index),
            _ => None,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let prefix_len = match self.target {
            UpdateTarget::Unspecified => 0,
            UpdateTarget::Member(_) => Identifier::LEN,
            UpdateTarget::ReplaceLeaf(_) => REPLACE_INDEX_LEN,
        };

        let mut bytes = Vec::with_capacity(prefix_len + self.keys.len() * KEY_LEN);
        match &self.target {
            UpdateTarget::Unspecified => {}
            UpdateTarget::Member(identifier) => bytes.extend_from_slice(identifier.as_bytes()),
            UpdateTarget::ReplaceLeaf(index) => bytes.extend_from_slice(&index.to_le_bytes()),
        }

        for key in &self.keys {
            bytes.extend_from_slice(key.as_bytes());
        }

        bytes
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);

        let target = match bytes.len() % KEY_LEN {
            REPLACE_INDEX_LEN => UpdateTarget::ReplaceLeaf(reader.read_u16_le("replace index")?),
            Identifier::LEN => UpdateTarget::Member(Identifier::from(
                reader.read_array::<{ Identifier::LEN }>("identifier")?,
            )),
            _ => UpdateTarget::Unspecified,
        };

        // A tail shorter than one key is dropped.
        let mut keys = Vec::with_capacity(reader.remaining() / KEY_LEN);
        while reader.remaining() >= KEY_LEN {
            keys.push(X25519PublicKey::from(reader.read_array::<KEY_LEN>("key")?));
        }

        Ok(Self { keys, target })
    }
}
