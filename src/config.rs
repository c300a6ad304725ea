use std::time::Duration;

/// Tuning for a [`DhTree`](crate::DhTree).
#[derive(Clone, Debug)]
pub struct TreeConfig {
    /// Age after which a leaf may be reused for a new member.
    pub key_expiration_interval: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            key_expiration_interval: Duration::from_secs(10 * 24 * 60 * 60), // 10 days
        }
    }
}

/// Defaults applied to newly built [`PlabblePacket`](crate::PlabblePacket)s.
#[derive(Clone, Debug)]
pub struct PacketConfig {
    pub version: u16,
}

impl Default for PacketConfig {
    fn default() -> Self {
        Self { version: 1 }
    }
}
