#[macro_use]
extern crate afl;
use plabble_tree::PlabblePacket;

fn main() {
    fuzz!(|data: &[u8]| {
        if let Ok(packet) = PlabblePacket::deserialize(data) {
            let _ = packet.verify(None);
            let _ = packet.serialize();
        }
    });
}
