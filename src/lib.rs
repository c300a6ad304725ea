mod codec;
pub use codec::{PLABBLE_EPOCH, decode_timestamp, encode_timestamp, random_bytes};

mod keys;
pub use keys::*;

mod key_update;
pub use key_update::*;

mod tree;
pub use tree::*;

mod packet;
pub use packet::*;

mod error;
pub use error::Error;

mod config;
pub use config::*;
