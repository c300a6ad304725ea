use crate::Error;
use rand::TryRngCore;
use rand::rngs::OsRng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Seconds between the Unix epoch and 2020-01-01T00:00:00 UTC.
pub const PLABBLE_EPOCH: u64 = 1_577_836_800;

const MAX_RANDOM_CHUNK: usize = 65_536;

/// Encodes a point in time as little-endian seconds since [`PLABBLE_EPOCH`].
///
/// Times before the epoch clamp to zero, times past the `u32` range clamp to its maximum.
pub fn encode_timestamp(time: SystemTime) -> [u8; 4] {
    let unix = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let seconds = u32::try_from(unix.saturating_sub(PLABBLE_EPOCH)).unwrap_or(u32::MAX);

    seconds.to_le_bytes()
}

/// Decodes a timestamp written by [`encode_timestamp`].
pub fn decode_timestamp(bytes: [u8; 4]) -> SystemTime {
    let seconds = u64::from(u32::from_le_bytes(bytes));
    UNIX_EPOCH + Duration::from_secs(PLABBLE_EPOCH + seconds)
}

/// Fills a fresh buffer with `size` bytes from the operating system's CSPRNG.
pub fn random_bytes(size: usize) -> Result<Vec<u8>, Error> {
    if u32::try_from(size).is_err() {
        return Err(Error::InvalidState(format!(
            "Requested {size} random bytes, more than the maximum"
        )));
    }

    let mut bytes = vec![0u8; size];
    for chunk in bytes.chunks_mut(MAX_RANDOM_CHUNK) {
        OsRng.try_fill_bytes(chunk).map_err(|_| Error::Random)?;
    }

    Ok(bytes)
}

pub(crate) fn random_array<const N: usize>() -> Result<[u8; N], Error> {
    let mut bytes = [0u8; N];
    OsRng.try_fill_bytes(&mut bytes).map_err(|_| Error::Random)?;
    Ok(bytes)
}

/// Bounds-checked cursor over a borrowed byte slice.
pub(crate) struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.position
    }

    fn read(&mut self, len: usize, field: &str) -> Result<&'a [u8], Error> {
        if self.remaining() < len {
            return Err(Error::MalformedInput(format!(
                "Expected {len} bytes for {field}, {} left",
                self.remaining()
            )));
        }

        let slice = &self.bytes[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    pub(crate) fn read_array<const N: usize>(&mut self, field: &str) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read(N, field)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self, field: &str) -> Result<u8, Error> {
        let [byte] = self.read_array::<1>(field)?;
        Ok(byte)
    }

    pub(crate) fn read_u16_le(&mut self, field: &str) -> Result<u16, Error> {
        Ok(u16::from_le_bytes(self.read_array(field)?))
    }

    pub(crate) fn read_u32_le(&mut self, field: &str) -> Result<u32, Error> {
        Ok(u32::from_le_bytes(self.read_array(field)?))
    }

    /// Consumes everything that is left.
    pub(crate) fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.bytes[self.position..];
        self.position = self.bytes.len();
        rest
    }
}
