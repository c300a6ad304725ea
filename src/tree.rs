use crate::codec::{ByteReader, decode_timestamp, encode_timestamp};
use crate::{
    Error, Identifier, KeyPair, KeyUpdate, TreeConfig, UpdateTarget, X25519PublicKey, X25519Secret,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;
use zeroize::Zeroize;

const KEY_LEN: usize = 32;

/// One slot of a [`DhTree`].
#[derive(Clone, Debug)]
pub struct DhNode {
    pub id: Option<Identifier>,
    pub key_pair: KeyPair,
    pub last_update: Option<SystemTime>,
}

impl DhNode {
    fn leaf(key_pair: KeyPair, id: Identifier) -> Self {
        Self {
            id: Some(id),
            key_pair,
            last_update: Some(SystemTime::now()),
        }
    }

    fn internal(key_pair: KeyPair) -> Self {
        Self {
            id: None,
            key_pair,
            last_update: None,
        }
    }

    /// Whether the node has gone longer than `interval` without a key rotation.
    ///
    /// Nodes that were never stamped do not expire.
    pub fn is_expired(&self, interval: Duration) -> bool {
        self.last_update
            .and_then(|last| SystemTime::now().duration_since(last).ok())
            .is_some_and(|age| age > interval)
    }
}

/// Group Diffie-Hellman ratchet tree.
///
/// Nodes live in a flat vector: the parent of `i` is `(i - 1) / 2`, index 0 is a
/// keyless sentinel once the tree holds two or more members, and the last
/// `leaf_count()` slots are the members' leaves. Every internal node holds the key
/// pair derived from the DH secret of its two children, so a member can compute
/// the private keys of its own ancestors and the group secret at the top.
///
/// Mutations touch several slots plus the cached group secret and are not atomic;
/// share a tree across threads only behind a lock.
#[derive(Clone)]
pub struct DhTree {
    nodes: Vec<DhNode>,
    tree_secret: Option<[u8; 32]>,
    config: TreeConfig,
}

impl Default for DhTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DhTree {
    fn drop(&mut self) {
        self.tree_secret.zeroize();
    }
}

impl DhTree {
    pub fn new() -> Self {
        Self::with_config(TreeConfig::default())
    }

    pub fn with_config(config: TreeConfig) -> Self {
        Self {
            nodes: Vec::new(),
            tree_secret: None,
            config,
        }
    }

    pub fn nodes(&self) -> &[DhNode] {
        &self.nodes
    }

    pub fn key_expiration_interval(&self) -> Duration {
        self.config.key_expiration_interval
    }

    pub fn set_key_expiration_interval(&mut self, interval: Duration) {
        self.config.key_expiration_interval = interval;
    }

    /// Number of levels, `floor(log2(n)) + 1`.
    pub fn depth(&self) -> usize {
        (usize::BITS - self.nodes.len().leading_zeros()) as usize
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.len() / 2 + self.nodes.len() % 2
    }

    fn first_leaf(&self) -> usize {
        self.nodes.len() - self.leaf_count()
    }

    pub fn leaves(&self) -> &[DhNode] {
        &self.nodes[self.first_leaf()..]
    }

    pub fn leaf_index_of(&self, identifier: &Identifier) -> Option<usize> {
        self.leaves()
            .iter()
            .position(|leaf| leaf.id.as_ref() == Some(identifier))
    }

    /// Tree index of the leaf carrying `identifier`.
    pub fn index_of(&self, identifier: &Identifier) -> Option<usize> {
        self.leaf_index_of(identifier)
            .map(|leaf_index| leaf_index + self.first_leaf())
    }

    pub fn contains(&self, identifier: &Identifier) -> bool {
        self.leaf_index_of(identifier).is_some()
    }

    /// Tree index of the local member, the leaf that holds a private key.
    pub fn self_index(&self) -> Option<usize> {
        self.leaves()
            .iter()
            .position(|leaf| leaf.key_pair.has_private())
            .map(|leaf_index| leaf_index + self.first_leaf())
    }

    fn local_index(&self) -> Result<usize, Error> {
        self.self_index().ok_or_else(|| {
            Error::CryptoPrecondition("No leaf holds a private key".to_string())
        })
    }

    /// Leaf indices of leaves that may be reused for new members.
    ///
    /// The local member's own leaf is never reported, however old its key is.
    pub fn scan(&self) -> Vec<usize> {
        let interval = self.config.key_expiration_interval;
        self.leaves()
            .iter()
            .enumerate()
            .filter(|(_, leaf)| !leaf.key_pair.has_private() && leaf.is_expired(interval))
            .map(|(leaf_index, _)| leaf_index)
            .collect()
    }

    fn parent(index: usize) -> usize {
        if index == 0 { 0 } else { (index - 1) / 2 }
    }

    fn sibling(&self, index: usize) -> usize {
        if index & 1 == 1 {
            if index + 1 >= self.nodes.len() {
                index
            } else {
                index + 1
            }
        } else if index == 0 {
            index
        } else {
            index - 1
        }
    }

    /// ECDH between the node at `index` and its sibling, using whichever side
    /// holds a private key.
    fn shared_secret_at(&self, index: usize) -> Result<[u8; 32], Error> {
        let node = self.nodes.get(index).ok_or_else(|| {
            Error::CryptoPrecondition(format!("No node at index {index}"))
        })?;
        let sibling = &self.nodes[self.sibling(index)];

        let (secret, public) = match (node.key_pair.secret(), sibling.key_pair.secret()) {
            (Some(secret), _) => (secret, sibling.key_pair.public_key()),
            (None, Some(secret)) => (secret, node.key_pair.public_key()),
            (None, None) => {
                return Err(Error::CryptoPrecondition(format!(
                    "Neither node {index} nor its sibling holds a private key"
                )));
            }
        };

        let public = public.ok_or_else(|| {
            Error::CryptoPrecondition(format!("Node {index} pairs with the sentinel"))
        })?;

        Ok(secret.dh(public))
    }

    /// Re-derives every ancestor of `index` from the DH secret of its children,
    /// then refreshes the cached group secret.
    pub fn update(&mut self, index: usize) -> Result<(), Error> {
        if index >= self.nodes.len() {
            return Err(Error::InvalidState(format!(
                "Index {index} is outside a tree of {} nodes",
                self.nodes.len()
            )));
        }

        let mut index = index;
        let mut parent = Self::parent(index);
        while parent != 0 {
            let mut shared = self.shared_secret_at(index)?;
            let secret = X25519Secret::derive_from(&shared);
            shared.zeroize();
            self.nodes[parent] = DhNode::internal(KeyPair::from(secret?));

            index = parent;
            parent = Self::parent(parent);
        }

        if self.nodes.len() > 1 {
            self.tree_secret = Some(self.shared_secret_at(1)?);
            debug!(nodes = self.nodes.len(), "recomputed tree secret");
        }

        Ok(())
    }

    /// Group secret expanded with HKDF-SHA256 under `salt`, usually a ratchet id
    /// or the salt carried by a packet.
    pub fn secret(&mut self, salt: Option<&[u8]>) -> Result<[u8; 32], Error> {
        let tree_secret = match self.tree_secret {
            Some(secret) => secret,
            None => {
                let secret = self.shared_secret_at(1)?;
                self.tree_secret = Some(secret);
                secret
            }
        };

        let mut okm = [0u8; 32];
        Hkdf::<Sha256>::new(salt, &tree_secret)
            .expand(&[], &mut okm)
            .map_err(|e| Error::CryptoPrecondition(e.to_string()))?;

        Ok(okm)
    }

    /// Inserts a member, or rotates the key of one already present, and
    /// re-derives the path above it.
    pub fn put(&mut self, key_pair: KeyPair, identifier: Identifier) -> Result<usize, Error> {
        self.put_with(key_pair, identifier, true, None)
    }

    /// Like [`put`](Self::put), with control over the re-derivation and the slot.
    ///
    /// Returns the tree index of the written leaf. With `replace_leaf_index` the
    /// leaf at that position is overwritten; otherwise an expired leaf is reused
    /// when one exists before the last leaf, and the tree grows by two slots when not.
    pub fn put_with(
        &mut self,
        key_pair: KeyPair,
        identifier: Identifier,
        update: bool,
        replace_leaf_index: Option<u16>,
    ) -> Result<usize, Error> {
        if let Some(index) = self.index_of(&identifier) {
            let node = &mut self.nodes[index];
            node.key_pair = key_pair;
            node.last_update = Some(SystemTime::now());
            self.refresh(index, update)?;
            return Ok(index);
        }

        if let Some(leaf_index) = replace_leaf_index {
            let leaf_index = usize::from(leaf_index);
            if leaf_index >= self.leaf_count() {
                return Err(Error::MalformedInput(format!(
                    "Leaf index {leaf_index} outside {} leaves",
                    self.leaf_count()
                )));
            }

            let index = self.first_leaf() + leaf_index;
            self.nodes[index] = DhNode::leaf(key_pair, identifier);
            self.refresh(index, update)?;
            return Ok(index);
        }

        let leaf_count = self.leaf_count();
        if let Some(garbage) = self.scan().into_iter().find(|&i| i + 1 < leaf_count) {
            debug!(%identifier, leaf_index = garbage, "reusing expired leaf");
            let garbage = u16::try_from(garbage)
                .map_err(|_| Error::InvalidState("Leaf index exceeds u16".to_string()))?;
            return self.put_with(key_pair, identifier, update, Some(garbage));
        }

        let len = self.nodes.len();
        self.nodes.push(DhNode::leaf(key_pair, identifier));
        if len == 0 {
            return Ok(0);
        }

        // The first leaf moves to the tail and its old slot becomes its parent.
        let parent = Self::parent(len);
        let displaced = self.nodes[parent].clone();
        self.nodes[parent] = if parent == 0 {
            DhNode::internal(KeyPair::Sentinel)
        } else {
            DhNode::internal(displaced.key_pair.clone())
        };
        self.nodes.push(displaced);
        debug!(%identifier, leaves = self.leaf_count(), "tree grew");

        self.refresh(len + 1, update)?;
        Ok(len)
    }

    /// Re-derives from `index`, or drops the cached secret so that the next
    /// [`secret`](Self::secret) call recomputes it.
    fn refresh(&mut self, index: usize, update: bool) -> Result<(), Error> {
        if update {
            self.update(index)
        } else {
            self.tree_secret = None;
            Ok(())
        }
    }

    /// Collects the public keys from a leaf up to the child of the sentinel.
    ///
    /// Without `identifier` the local member's leaf is used, tagged with its own
    /// identifier.
    pub fn create_update(&self, identifier: Option<&Identifier>) -> Result<KeyUpdate, Error> {
        let start = match identifier {
            Some(identifier) => self.index_of(identifier).ok_or_else(|| {
                Error::InvalidState(format!("Member {identifier} is not in the tree"))
            })?,
            None => self.local_index()?,
        };

        let mut keys = Vec::with_capacity(self.depth());
        let mut index = start;
        while index != 0 {
            let public = self.nodes[index].key_pair.public_key().ok_or_else(|| {
                Error::CryptoPrecondition(format!("Node {index} has no key"))
            })?;
            keys.push(*public);
            index = Self::parent(index);
        }

        let update = KeyUpdate::new(keys);
        Ok(match identifier.copied().or(self.nodes[start].id) {
            Some(identifier) => update.with_identifier(identifier),
            None => update,
        })
    }

    /// Installs a peer's [`KeyUpdate`] and re-derives the local member's path.
    pub fn apply_update(&mut self, update: &KeyUpdate) -> Result<(), Error> {
        let Some((leaf_key, path_keys)) = update.keys.split_first() else {
            return Ok(());
        };

        let identifier = match update.target {
            UpdateTarget::Member(identifier) => identifier,
            UpdateTarget::ReplaceLeaf(leaf_index) => self
                .leaves()
                .get(usize::from(leaf_index))
                .and_then(|leaf| leaf.id)
                .ok_or_else(|| {
                    Error::MalformedInput(format!("No leaf to replace at {leaf_index}"))
                })?,
            UpdateTarget::Unspecified => {
                return Err(Error::MalformedInput(
                    "Key update names no member or leaf".to_string(),
                ));
            }
        };

        if let Some(index) = self.index_of(&identifier) {
            if self.nodes[index].key_pair.has_private() {
                return Err(Error::InvalidState(
                    "Key update targets the local member".to_string(),
                ));
            }
        }

        let recompute = self.leaf_count() == 1 && update.keys.len() == 1;
        let leaf = self.put_with(
            KeyPair::PublicOnly(*leaf_key),
            identifier,
            recompute,
            update.replace_leaf_index(),
        )?;

        let mut index = Self::parent(leaf);
        for key in path_keys {
            if index == 0 {
                break;
            }
            self.nodes[index] = DhNode::internal(KeyPair::PublicOnly(*key));
            index = Self::parent(index);
        }

        debug!(%identifier, keys = update.keys.len(), "applied key update");
        let local = self.local_index()?;
        self.update(local)
    }

    /// Public snapshot of the tree, without any private keys.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let leaf_count = u16::try_from(self.leaf_count())
            .map_err(|_| Error::InvalidState("Too many leaves to serialize".to_string()))?;

        let mut bytes = Vec::with_capacity(2 + self.nodes.len() * (Identifier::LEN + KEY_LEN + 4));
        bytes.extend_from_slice(&leaf_count.to_le_bytes());

        for leaf in self.leaves() {
            let id = leaf
                .id
                .ok_or_else(|| Error::InvalidState("Leaf without identifier".to_string()))?;
            bytes.extend_from_slice(id.as_bytes());
            bytes.extend_from_slice(Self::public_key_of(leaf)?.as_bytes());
            bytes.extend_from_slice(&encode_timestamp(leaf.last_update.unwrap_or(UNIX_EPOCH)));
        }

        for node in self.nodes.get(1..self.first_leaf()).unwrap_or_default() {
            bytes.extend_from_slice(Self::public_key_of(node)?.as_bytes());
        }

        Ok(bytes)
    }

    fn public_key_of(node: &DhNode) -> Result<&X25519PublicKey, Error> {
        node.key_pair
            .public_key()
            .ok_or_else(|| Error::InvalidState("Node without public key".to_string()))
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        Self::deserialize_with_config(bytes, TreeConfig::default())
    }

    pub fn deserialize_with_config(bytes: &[u8], config: TreeConfig) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);
        let leaf_count = usize::from(reader.read_u16_le("leaf count")?);

        let mut leaves = Vec::with_capacity(leaf_count);
        for _ in 0..leaf_count {
            let id = Identifier::from(reader.read_array::<{ Identifier::LEN }>("leaf id")?);
            let public = X25519PublicKey::from(reader.read_array::<KEY_LEN>("leaf key")?);
            let timestamp = decode_timestamp(reader.read_array("leaf timestamp")?);
            leaves.push(DhNode {
                id: Some(id),
                key_pair: KeyPair::PublicOnly(public),
                last_update: Some(timestamp),
            });
        }

        let expected_internal = leaf_count.saturating_sub(2);
        if reader.remaining() != expected_internal * KEY_LEN {
            return Err(Error::MalformedInput(format!(
                "{leaf_count} leaves need {expected_internal} internal keys, got {} bytes",
                reader.remaining()
            )));
        }

        let mut nodes = Vec::with_capacity(2 * leaf_count);
        if leaf_count > 1 {
            nodes.push(DhNode::internal(KeyPair::Sentinel));
        }
        for _ in 0..expected_internal {
            let public = X25519PublicKey::from(reader.read_array::<KEY_LEN>("internal key")?);
            nodes.push(DhNode::internal(KeyPair::PublicOnly(public)));
        }
        nodes.append(&mut leaves);

        let mut tree = Self::with_config(config);
        tree.nodes = nodes;
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::random_array;

    fn random_id() -> Identifier {
        Identifier::from(random_array::<20>().unwrap())
    }

    /// A member's own tree after it joined from `snapshot`.
    fn join(snapshot: Option<&[u8]>, id: Identifier) -> (DhTree, KeyUpdate) {
        let mut tree = match snapshot {
            Some(bytes) => DhTree::deserialize(bytes).unwrap(),
            None => DhTree::new(),
        };
        tree.put(KeyPair::generate().unwrap(), id).unwrap();
        let update = tree.create_update(None).unwrap();
        (tree, update)
    }

    #[test]
    fn test_index_arithmetic() {
        let mut tree = DhTree::new();
        for _ in 0..4 {
            tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        }
        assert_eq!(tree.nodes().len(), 7);

        assert_eq!(DhTree::parent(0), 0);
        assert_eq!(DhTree::parent(1), 0);
        assert_eq!(DhTree::parent(2), 0);
        assert_eq!(DhTree::parent(5), 2);
        assert_eq!(DhTree::parent(6), 2);

        assert_eq!(tree.sibling(0), 0);
        assert_eq!(tree.sibling(1), 2);
        assert_eq!(tree.sibling(2), 1);
        assert_eq!(tree.sibling(5), 6);
        assert_eq!(tree.sibling(6), 5);
    }

    #[test]
    fn test_sibling_of_unpaired_tail() {
        let mut tree = DhTree::new();
        tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        tree.nodes.push(DhNode::internal(KeyPair::Sentinel));
        tree.nodes.push(DhNode::internal(KeyPair::Sentinel));

        assert_eq!(tree.sibling(3), 4);
        tree.nodes.pop();
        assert_eq!(tree.sibling(3), 3);
    }

    #[test]
    fn test_shape_while_growing() {
        let mut tree = DhTree::new();
        assert_eq!(tree.depth(), 0);
        assert_eq!(tree.leaf_count(), 0);

        let expected = [(1, 1, 1), (3, 2, 2), (5, 3, 3), (7, 4, 3), (9, 5, 4)];
        for (nodes, leaves, depth) in expected {
            tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
            assert_eq!(tree.nodes().len(), nodes);
            assert_eq!(tree.leaf_count(), leaves);
            assert_eq!(tree.depth(), depth);
        }

        assert!(matches!(tree.nodes()[0].key_pair, KeyPair::Sentinel));
    }

    #[test]
    fn test_sequential_puts_resolve_by_identifier() {
        // Coordinator view: every leaf carries its own key pair.
        let mut tree = DhTree::new();
        let ids: Vec<_> = (0..6).map(|_| random_id()).collect();
        for id in &ids {
            tree.put(KeyPair::generate().unwrap(), *id).unwrap();
        }

        assert_eq!(tree.leaf_count(), ids.len());
        for id in &ids {
            let index = tree.index_of(id).unwrap();
            assert!(index >= tree.nodes().len() - tree.leaf_count());
            assert_eq!(tree.nodes()[index].id, Some(*id));
            assert!(tree.contains(id));
        }
        assert!(!tree.contains(&random_id()));
    }

    #[test]
    fn test_two_members_share_secret() {
        let alice_key = X25519Secret::generate().unwrap();
        let bob_key = X25519Secret::generate().unwrap();
        let (alice_id, bob_id) = (random_id(), random_id());

        let mut alice = DhTree::new();
        alice.put(KeyPair::from(alice_key.clone()), alice_id).unwrap();
        alice.put(KeyPair::from(bob_key.public_key()), bob_id).unwrap();

        let mut bob = DhTree::new();
        bob.put(KeyPair::from(bob_key), bob_id).unwrap();
        bob.put(KeyPair::from(alice_key.public_key()), alice_id).unwrap();

        let salt = b"ratchet-7";
        assert_eq!(
            alice.secret(Some(salt)).unwrap(),
            bob.secret(Some(salt)).unwrap()
        );
        assert_ne!(
            alice.secret(Some(salt)).unwrap(),
            alice.secret(Some(b"ratchet-8")).unwrap()
        );
        assert_eq!(alice.secret(None).unwrap(), bob.secret(None).unwrap());
    }

    #[test]
    fn test_members_converge_through_key_updates() {
        let ids: Vec<_> = (0..4).map(|_| random_id()).collect();

        let (mut alice, _) = join(None, ids[0]);

        let (mut bob, bob_update) = join(Some(&alice.serialize().unwrap()), ids[1]);
        alice.apply_update(&bob_update).unwrap();

        let (mut carol, carol_update) = join(Some(&alice.serialize().unwrap()), ids[2]);
        alice.apply_update(&carol_update).unwrap();
        bob.apply_update(&carol_update).unwrap();

        let (mut dave, dave_update) = join(Some(&alice.serialize().unwrap()), ids[3]);
        for tree in [&mut alice, &mut bob, &mut carol] {
            tree.apply_update(&dave_update).unwrap();
        }

        let salt = [3u8; 16];
        let expected = alice.secret(Some(&salt)).unwrap();
        for tree in [&mut bob, &mut carol, &mut dave] {
            assert_eq!(tree.leaf_count(), 4);
            assert_eq!(tree.secret(Some(&salt)).unwrap(), expected);
        }
    }

    #[test]
    fn test_rotation_propagates() {
        let ids = [random_id(), random_id(), random_id()];
        let (mut alice, _) = join(None, ids[0]);
        let (mut bob, update) = join(Some(&alice.serialize().unwrap()), ids[1]);
        alice.apply_update(&update).unwrap();
        let (mut carol, update) = join(Some(&alice.serialize().unwrap()), ids[2]);
        alice.apply_update(&update).unwrap();
        bob.apply_update(&update).unwrap();

        let before = carol.secret(None).unwrap();
        let stamp = carol.nodes()[carol.self_index().unwrap()].last_update;

        carol.put(KeyPair::generate().unwrap(), ids[2]).unwrap();
        let rotation = carol.create_update(None).unwrap();
        assert_eq!(rotation.identifier(), Some(&ids[2]));
        assert!(carol.nodes()[carol.self_index().unwrap()].last_update >= stamp);

        alice.apply_update(&rotation).unwrap();
        bob.apply_update(&rotation).unwrap();

        let after = carol.secret(None).unwrap();
        assert_ne!(before, after);
        assert_eq!(alice.secret(None).unwrap(), after);
        assert_eq!(bob.secret(None).unwrap(), after);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut tree = DhTree::new();
        let ids: Vec<_> = (0..3).map(|_| random_id()).collect();
        for id in &ids {
            tree.put(KeyPair::generate().unwrap(), *id).unwrap();
        }

        let bytes = tree.serialize().unwrap();
        assert_eq!(bytes.len(), 2 + 3 * (20 + 32 + 4) + 32);

        let restored = DhTree::deserialize(&bytes).unwrap();
        assert_eq!(restored.nodes().len(), tree.nodes().len());
        assert!(matches!(restored.nodes()[0].key_pair, KeyPair::Sentinel));
        assert!(restored.self_index().is_none());
        for (restored, original) in restored.nodes().iter().zip(tree.nodes()).skip(1) {
            assert!(!restored.key_pair.has_private());
            assert_eq!(restored.key_pair.public_key(), original.key_pair.public_key());
            assert_eq!(restored.id, original.id);
        }

        let whole_seconds = |node: &DhNode| {
            node.last_update
                .map(|t| t.duration_since(UNIX_EPOCH).unwrap().as_secs())
        };
        for (restored, original) in restored.leaves().iter().zip(tree.leaves()) {
            assert!(restored.last_update.is_some());
            assert_eq!(whole_seconds(restored), whole_seconds(original));
        }
    }

    #[test]
    fn test_single_leaf_snapshot() {
        let (tree, _) = join(None, random_id());
        let restored = DhTree::deserialize(&tree.serialize().unwrap()).unwrap();
        assert_eq!(restored.nodes().len(), 1);
        assert_eq!(restored.leaf_count(), 1);
    }

    #[test]
    fn test_truncated_snapshot_is_rejected() {
        let mut tree = DhTree::new();
        for _ in 0..3 {
            tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        }
        let bytes = tree.serialize().unwrap();

        assert!(matches!(
            DhTree::deserialize(&bytes[..bytes.len() - 1]),
            Err(Error::MalformedInput(_))
        ));
        assert!(matches!(
            DhTree::deserialize(&[5]),
            Err(Error::MalformedInput(_))
        ));
    }

    #[test]
    fn test_secret_without_private_key_fails() {
        let mut tree = DhTree::new();
        for _ in 0..2 {
            tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        }
        let mut public_copy = DhTree::deserialize(&tree.serialize().unwrap()).unwrap();

        assert!(matches!(
            public_copy.secret(None),
            Err(Error::CryptoPrecondition(_))
        ));
        assert!(matches!(
            DhTree::new().secret(None),
            Err(Error::CryptoPrecondition(_))
        ));
    }

    #[test]
    fn test_put_of_remote_member_needs_local_branch() {
        let (mut alice, _) = join(None, random_id());
        alice
            .put(KeyPair::generate().unwrap().to_public(), random_id())
            .unwrap();

        // The third leaf pairs with the second, neither of which is local.
        let result = alice.put(KeyPair::generate().unwrap().to_public(), random_id());
        assert!(matches!(result, Err(Error::CryptoPrecondition(_))));
    }

    #[test]
    fn test_fresh_leaves_are_not_garbage() {
        let mut tree = DhTree::new();
        for _ in 0..3 {
            tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        }

        assert!(tree.scan().is_empty());
        tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        assert_eq!(tree.leaf_count(), 4);
    }

    #[test]
    fn test_expired_leaf_is_reused() {
        let mut tree = DhTree::new();
        let ids: Vec<_> = (0..3).map(|_| random_id()).collect();
        for id in &ids {
            tree.put(KeyPair::generate().unwrap(), *id).unwrap();
        }
        tree.set_key_expiration_interval(Duration::from_secs(60));

        let stale = tree.index_of(&ids[0]).unwrap();
        tree.nodes[stale].key_pair = tree.nodes[stale].key_pair.to_public();
        tree.nodes[stale].last_update = Some(SystemTime::now() - Duration::from_secs(120));
        assert_eq!(tree.scan(), vec![0]);

        let newcomer = random_id();
        let index = tree.put(KeyPair::generate().unwrap(), newcomer).unwrap();
        assert_eq!(index, stale);
        assert_eq!(tree.leaf_count(), 3);
        assert!(!tree.contains(&ids[0]));
        assert_eq!(tree.index_of(&newcomer), Some(stale));
    }

    #[test]
    fn test_expired_last_leaf_is_not_reused() {
        let mut tree = DhTree::new();
        for _ in 0..3 {
            tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        }
        tree.set_key_expiration_interval(Duration::from_secs(60));

        let last = tree.nodes().len() - 1;
        tree.nodes[last].key_pair = tree.nodes[last].key_pair.to_public();
        tree.nodes[last].last_update = Some(SystemTime::now() - Duration::from_secs(120));
        assert_eq!(tree.scan(), vec![2]);

        tree.put(KeyPair::generate().unwrap(), random_id()).unwrap();
        assert_eq!(tree.leaf_count(), 4);
    }

    #[test]
    fn test_expired_local_leaf_is_kept() {
        let ids = [random_id(), random_id(), random_id(), random_id()];
        let (mut alice, _) = join(None, ids[0]);
        let (mut bob, update) = join(Some(&alice.serialize().unwrap()), ids[1]);
        alice.apply_update(&update).unwrap();
        let (_carol, update) = join(Some(&alice.serialize().unwrap()), ids[2]);
        alice.apply_update(&update).unwrap();
        bob.apply_update(&update).unwrap();

        let alice_index = alice.self_index().unwrap();
        assert_eq!(alice.leaf_index_of(&ids[0]), Some(0));
        alice.nodes[alice_index].last_update =
            Some(SystemTime::now() - Duration::from_secs(11 * 24 * 60 * 60));
        assert!(alice.nodes()[alice_index].is_expired(alice.key_expiration_interval()));
        assert!(alice.scan().is_empty());

        // Dave's public view sees Alice's leaf as garbage and takes it over.
        let (dave, update) = join(Some(&alice.serialize().unwrap()), ids[3]);
        assert_eq!(dave.leaf_index_of(&ids[3]), Some(0));
        assert!(!dave.contains(&ids[0]));

        alice.apply_update(&update).unwrap();
        assert!(alice.contains(&ids[0]));
        assert!(alice.contains(&ids[3]));
        assert_eq!(alice.leaf_count(), 4);

        let alice_index = alice.self_index().unwrap();
        assert_eq!(alice.nodes()[alice_index].id, Some(ids[0]));
        assert_eq!(alice.leaves().iter().filter(|l| l.key_pair.has_private()).count(), 1);
        assert!(alice.secret(None).is_ok());
    }

    #[test]
    fn test_replace_update_keeps_slot_identifier() {
        let ids = [random_id(), random_id(), random_id()];
        let (mut alice, _) = join(None, ids[0]);
        let (mut bob, update) = join(Some(&alice.serialize().unwrap()), ids[1]);
        alice.apply_update(&update).unwrap();
        let (carol, update) = join(Some(&alice.serialize().unwrap()), ids[2]);
        alice.apply_update(&update).unwrap();
        bob.apply_update(&update).unwrap();

        // A newcomer takes over Bob's slot in Carol's tree.
        let bob_leaf = alice.leaf_index_of(&ids[1]).unwrap();
        let mut newcomer = DhTree::deserialize(&alice.serialize().unwrap()).unwrap();
        let newcomer_key = KeyPair::generate().unwrap();
        let newcomer_leaf = newcomer
            .put_with(newcomer_key, ids[1], true, Some(bob_leaf as u16))
            .unwrap();
        let update = newcomer
            .create_update(None)
            .unwrap()
            .with_replace_leaf_index(bob_leaf as u16);

        alice.apply_update(&update).unwrap();
        let mut carol = carol;
        carol.apply_update(&update).unwrap();

        assert_eq!(alice.index_of(&ids[1]), Some(newcomer_leaf));
        assert_eq!(
            alice.nodes()[newcomer_leaf].key_pair.public_key(),
            Some(&update.keys[0])
        );
        assert_eq!(alice.secret(None).unwrap(), newcomer.secret(None).unwrap());
        assert_eq!(carol.secret(None).unwrap(), newcomer.secret(None).unwrap());
    }

    #[test]
    fn test_apply_update_edge_cases() {
        let (mut alice, _) = join(None, random_id());

        assert!(alice.apply_update(&KeyUpdate::default()).is_ok());
        assert_eq!(alice.nodes().len(), 1);

        let (_, bob_update) = join(Some(&alice.serialize().unwrap()), random_id());
        alice.apply_update(&bob_update).unwrap();
        let own = alice.create_update(None).unwrap();
        assert_eq!(own.keys.len(), 1);

        let anonymous = KeyUpdate::new(vec![X25519PublicKey::from([1u8; 32])]);
        assert!(matches!(
            alice.apply_update(&anonymous),
            Err(Error::MalformedInput(_))
        ));

        assert!(matches!(
            alice.apply_update(&own),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            alice.create_update(Some(&random_id())),
            Err(Error::InvalidState(_))
        ));
    }
}
