#[macro_use]
extern crate afl;
use plabble_tree::{DhTree, KeyPair};

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(mut tree) = DhTree::deserialize(data) {
            if let Ok(key_pair) = KeyPair::generate() {
                let _ = tree.put(key_pair, [0u8; 20].into());
                let _ = tree.create_update(None);
            }
        }
    });
}
