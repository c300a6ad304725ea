#[macro_use]
extern crate afl;
use plabble_tree::{DhTree, KeyPair, KeyUpdate};

fn get_tree() -> DhTree {
    let mut tree = DhTree::new();
    let alice = KeyPair::generate().expect("Setup failed");
    let bob = KeyPair::generate().expect("Setup failed");
    tree.put(alice, [1u8; 20].into()).expect("Setup failed");
    tree.put(bob.to_public(), [2u8; 20].into()).expect("Setup failed");
    tree
}

fn main() {
    let tree = get_tree();

    fuzz!(|data: &[u8]| {
        if let Ok(update) = KeyUpdate::deserialize(data) {
            let mut tree = tree.clone();
            let _ = tree.apply_update(&update);
        }
    });
}
