use crate::codec::{ByteReader, decode_timestamp, encode_timestamp, random_array};
use crate::{Error, Identifier, PacketConfig};
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::fmt;
use std::ops::BitOr;
use std::time::SystemTime;
use tracing::{trace, warn};

const SIZE_PREFIX_LEN: usize = 4;
const STATIC_HEADER_LEN: usize = SIZE_PREFIX_LEN + 2 + 1 + 1;
const SIGNATURE_LEN: usize = 64;
const PREV_MSG_ID_LEN: usize = 4;
const SENDER_KEY_LEN: usize = 32;
const TIMESTAMP_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

/// Bitmask telling which optional header fields follow the static header.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const NONE: Self = Self(0);
    pub const WITH_SIGNATURE: Self = Self(1 << 0);
    pub const WITH_PREV_MESSAGE_ID: Self = Self(1 << 1);
    pub const WITH_SENDER_KEY: Self = Self(1 << 2);
    pub const WITH_SENDER_ID: Self = Self(1 << 3);
    pub const WITH_RECEIVER_ID: Self = Self(1 << 4);
    pub const WITH_TIMESTAMP: Self = Self(1 << 5);
    pub const WITH_ENCRYPTION: Self = Self(1 << 6);
    pub const WITH_SALT: Self = Self(1 << 7);

    /// Bits implied by the presence of their field.
    const FROM_FIELDS: Self = Self(
        Self::WITH_PREV_MESSAGE_ID.0
            | Self::WITH_SENDER_ID.0
            | Self::WITH_RECEIVER_ID.0
            | Self::WITH_TIMESTAMP.0,
    );

    const NAMES: [(Self, &'static str); 8] = [
        (Self::WITH_SIGNATURE, "WITH_SIGNATURE"),
        (Self::WITH_PREV_MESSAGE_ID, "WITH_PREV_MESSAGE_ID"),
        (Self::WITH_SENDER_KEY, "WITH_SENDER_KEY"),
        (Self::WITH_SENDER_ID, "WITH_SENDER_ID"),
        (Self::WITH_RECEIVER_ID, "WITH_RECEIVER_ID"),
        (Self::WITH_TIMESTAMP, "WITH_TIMESTAMP"),
        (Self::WITH_ENCRYPTION, "WITH_ENCRYPTION"),
        (Self::WITH_SALT, "WITH_SALT"),
    ];

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub fn to_byte(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl BitOr for PacketFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for PacketFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Self::NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .peekable();

        if names.peek().is_none() {
            return f.write_str("NONE");
        }
        f.write_str(&names.collect::<Vec<_>>().join(" | "))
    }
}

/// Kind of packet, the byte right after the flags.
///
/// Values 6, 7 and 8 are held back for the invite, join and welcome flows and,
/// like any other unassigned value, parse as [`PacketType::Unknown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    Raw,
    Status,
    Message,
    Identify,
    Register,
    Resolve,
    Leave,
    Kick,
    Unknown(u8),
}

impl From<u8> for PacketType {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Raw,
            1 => Self::Status,
            2 => Self::Message,
            3 => Self::Identify,
            4 => Self::Register,
            5 => Self::Resolve,
            9 => Self::Leave,
            10 => Self::Kick,
            other => Self::Unknown(other),
        }
    }
}

impl From<PacketType> for u8 {
    fn from(value: PacketType) -> Self {
        match value {
            PacketType::Raw => 0,
            PacketType::Status => 1,
            PacketType::Message => 2,
            PacketType::Identify => 3,
            PacketType::Register => 4,
            PacketType::Resolve => 5,
            PacketType::Leave => 9,
            PacketType::Kick => 10,
            PacketType::Unknown(other) => other,
        }
    }
}

/// The Plabble protocol packet.
///
/// ```text
/// [4]  [2]     [1]  [1]  [64?]      [4?]       [32?]      [20?]     [20?]       [4?]       [12?]  [16?]  [..]
/// Size Version Flag Type Signature  PrevMsgId  SenderKey  SenderId  ReceiverId  Timestamp  Nonce  Salt   Payload
/// ```
///
/// The size prefix is framing only: [`deserialize`](Self::deserialize) starts at the
/// version field. The sender id, receiver id, timestamp and previous message id
/// flags follow from whether those fields are set; the other flags are driven by
/// the methods that fill their fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlabblePacket {
    version: u16,
    flags: PacketFlags,
    packet_type: PacketType,
    signature: Option<[u8; SIGNATURE_LEN]>,
    prev_msg_id: Option<u32>,
    sender_key: Option<[u8; SENDER_KEY_LEN]>,
    sender_id: Option<Identifier>,
    receiver_id: Option<Identifier>,
    timestamp: Option<SystemTime>,
    nonce: Option<[u8; NONCE_LEN]>,
    salt: Option<[u8; SALT_LEN]>,
    payload: Option<Vec<u8>>,
}

impl PlabblePacket {
    pub fn new(packet_type: PacketType) -> Self {
        Self::with_config(packet_type, &PacketConfig::default())
    }

    pub fn with_config(packet_type: PacketType, config: &PacketConfig) -> Self {
        Self {
            version: config.version,
            flags: PacketFlags::NONE,
            packet_type,
            signature: None,
            prev_msg_id: None,
            sender_key: None,
            sender_id: None,
            receiver_id: None,
            timestamp: None,
            nonce: None,
            salt: None,
            payload: None,
        }
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Flags as they go on the wire.
    pub fn flags(&self) -> PacketFlags {
        let mut flags = self.flags;
        if self.sender_id.is_some() {
            flags.insert(PacketFlags::WITH_SENDER_ID);
        }
        if self.receiver_id.is_some() {
            flags.insert(PacketFlags::WITH_RECEIVER_ID);
        }
        if self.timestamp.is_some() {
            flags.insert(PacketFlags::WITH_TIMESTAMP);
        }
        if self.prev_msg_id.is_some() {
            flags.insert(PacketFlags::WITH_PREV_MESSAGE_ID);
        }
        flags
    }

    pub fn signature(&self) -> Option<&[u8; SIGNATURE_LEN]> {
        self.signature.as_ref()
    }

    pub fn prev_msg_id(&self) -> Option<u32> {
        self.prev_msg_id
    }

    pub fn set_prev_msg_id(&mut self, prev_msg_id: u32) {
        self.prev_msg_id = Some(prev_msg_id);
    }

    /// Packet id, one past the previous message id.
    pub fn id(&self) -> Option<u32> {
        self.prev_msg_id.map(|prev| prev.wrapping_add(1))
    }

    pub fn sender_key(&self) -> Option<&[u8; SENDER_KEY_LEN]> {
        self.sender_key.as_ref()
    }

    /// Carries the sender's Ed25519 key in the packet.
    pub fn set_sender_key(&mut self, key: &VerifyingKey) {
        self.sender_key = Some(key.to_bytes());
        self.flags.insert(PacketFlags::WITH_SENDER_KEY);
    }

    /// Explicit sender id, or the truncated hash of the sender key.
    pub fn sender_id(&self) -> Option<Identifier> {
        self.sender_id
            .or_else(|| self.sender_key.map(|key| Identifier::from_public_key(&key)))
    }

    pub fn set_sender_id(&mut self, sender_id: Identifier) {
        self.sender_id = Some(sender_id);
    }

    pub fn receiver_id(&self) -> Option<&Identifier> {
        self.receiver_id.as_ref()
    }

    pub fn set_receiver_id(&mut self, receiver_id: Identifier) {
        self.receiver_id = Some(receiver_id);
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    /// Stored at whole-second precision on the wire.
    pub fn set_timestamp(&mut self, timestamp: SystemTime) {
        self.timestamp = Some(timestamp);
    }

    pub fn nonce(&self) -> Option<&[u8; NONCE_LEN]> {
        self.nonce.as_ref()
    }

    pub fn salt(&self) -> Option<&[u8; SALT_LEN]> {
        self.salt.as_ref()
    }

    /// KDF salt for the key the payload is encrypted with.
    pub fn set_salt(&mut self, salt: [u8; SALT_LEN]) {
        self.salt = Some(salt);
        self.flags.insert(PacketFlags::WITH_SALT);
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = Some(payload);
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.contains(PacketFlags::WITH_ENCRYPTION)
    }

    /// Exact serialized size, size prefix included.
    pub fn size(&self) -> usize {
        let flags = self.flags();
        let optional = [
            (PacketFlags::WITH_SIGNATURE, SIGNATURE_LEN),
            (PacketFlags::WITH_PREV_MESSAGE_ID, PREV_MSG_ID_LEN),
            (PacketFlags::WITH_SENDER_KEY, SENDER_KEY_LEN),
            (PacketFlags::WITH_SENDER_ID, Identifier::LEN),
            (PacketFlags::WITH_RECEIVER_ID, Identifier::LEN),
            (PacketFlags::WITH_TIMESTAMP, TIMESTAMP_LEN),
            (PacketFlags::WITH_ENCRYPTION, NONCE_LEN),
            (PacketFlags::WITH_SALT, SALT_LEN),
        ];

        STATIC_HEADER_LEN
            + optional
                .iter()
                .filter(|(flag, _)| flags.contains(*flag))
                .map(|(_, len)| len)
                .sum::<usize>()
            + self.payload.as_ref().map_or(0, Vec::len)
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let size = self.size();
        let size_prefix = u32::try_from(size)
            .map_err(|_| Error::InvalidState(format!("Packet of {size} bytes is too large")))?;
        let flags = self.flags();

        let mut bytes = Vec::with_capacity(size);
        bytes.extend_from_slice(&size_prefix.to_le_bytes());
        self.write_static_header(flags, &mut bytes);
        if flags.contains(PacketFlags::WITH_SIGNATURE) {
            bytes.extend_from_slice(&self.signature.unwrap_or([0u8; SIGNATURE_LEN]));
        }
        self.write_after_signature(flags, &mut bytes)?;

        Ok(bytes)
    }

    fn write_static_header(&self, flags: PacketFlags, bytes: &mut Vec<u8>) {
        bytes.extend_from_slice(&self.version.to_le_bytes());
        bytes.push(flags.to_byte());
        bytes.push(u8::from(self.packet_type));
    }

    /// Everything behind the signature slot, payload included.
    fn write_after_signature(&self, flags: PacketFlags, bytes: &mut Vec<u8>) -> Result<(), Error> {
        fn field<'a, T>(value: Option<&'a T>, name: &str) -> Result<&'a T, Error> {
            value.ok_or_else(|| Error::InvalidState(format!("Flag set but no {name}")))
        }

        if flags.contains(PacketFlags::WITH_PREV_MESSAGE_ID) {
            let prev_msg_id = field(self.prev_msg_id.as_ref(), "prev msg id")?;
            bytes.extend_from_slice(&prev_msg_id.to_le_bytes());
        }
        if flags.contains(PacketFlags::WITH_SENDER_KEY) {
            bytes.extend_from_slice(field(self.sender_key.as_ref(), "sender key")?);
        }
        if flags.contains(PacketFlags::WITH_SENDER_ID) {
            bytes.extend_from_slice(field(self.sender_id().as_ref(), "sender id")?.as_bytes());
        }
        if flags.contains(PacketFlags::WITH_RECEIVER_ID) {
            bytes.extend_from_slice(field(self.receiver_id.as_ref(), "receiver id")?.as_bytes());
        }
        if flags.contains(PacketFlags::WITH_TIMESTAMP) {
            let timestamp = field(self.timestamp.as_ref(), "timestamp")?;
            bytes.extend_from_slice(&encode_timestamp(*timestamp));
        }
        if flags.contains(PacketFlags::WITH_ENCRYPTION) {
            bytes.extend_from_slice(field(self.nonce.as_ref(), "nonce")?);
        }
        if flags.contains(PacketFlags::WITH_SALT) {
            bytes.extend_from_slice(field(self.salt.as_ref(), "salt")?);
        }
        if let Some(payload) = &self.payload {
            bytes.extend_from_slice(payload);
        }

        Ok(())
    }

    /// Parses a packet starting at the version field.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);

        let version = reader.read_u16_le("version")?;
        let flags = PacketFlags::from_byte(reader.read_u8("flags")?);
        let packet_type = PacketType::from(reader.read_u8("packet type")?);

        let mut packet = Self::with_config(packet_type, &PacketConfig { version });
        packet.flags = flags;
        packet.flags.remove(PacketFlags::FROM_FIELDS);

        if flags.contains(PacketFlags::WITH_SIGNATURE) {
            packet.signature = Some(reader.read_array("signature")?);
        }
        if flags.contains(PacketFlags::WITH_PREV_MESSAGE_ID) {
            packet.prev_msg_id = Some(reader.read_u32_le("prev msg id")?);
        }
        if flags.contains(PacketFlags::WITH_SENDER_KEY) {
            packet.sender_key = Some(reader.read_array("sender key")?);
        }
        if flags.contains(PacketFlags::WITH_SENDER_ID) {
            let sender_id = reader.read_array::<{ Identifier::LEN }>("sender id")?;
            packet.sender_id = Some(Identifier::from(sender_id));
        }
        if flags.contains(PacketFlags::WITH_RECEIVER_ID) {
            let receiver_id = reader.read_array::<{ Identifier::LEN }>("receiver id")?;
            packet.receiver_id = Some(Identifier::from(receiver_id));
        }
        if flags.contains(PacketFlags::WITH_TIMESTAMP) {
            packet.timestamp = Some(decode_timestamp(reader.read_array("timestamp")?));
        }
        if flags.contains(PacketFlags::WITH_ENCRYPTION) {
            packet.nonce = Some(reader.read_array("nonce")?);
        }
        if flags.contains(PacketFlags::WITH_SALT) {
            packet.salt = Some(reader.read_array("salt")?);
        }
        packet.payload = Some(reader.read_rest().to_vec());

        Ok(packet)
    }

    /// Parses a packet including its 4-byte size prefix, which must match.
    pub fn deserialize_framed(bytes: &[u8]) -> Result<Self, Error> {
        let mut reader = ByteReader::new(bytes);
        let size = reader.read_u32_le("size")?;
        if usize::try_from(size).ok() != Some(bytes.len()) {
            return Err(Error::MalformedInput(format!(
                "Size prefix {size} does not match {} bytes",
                bytes.len()
            )));
        }

        Self::deserialize(reader.read_rest())
    }

    /// XORs the payload with a ChaCha20 keystream under a fresh nonce.
    ///
    /// There is no authentication tag: integrity comes from the signature only.
    pub fn encrypt(&mut self, key: &[u8; 32]) -> Result<(), Error> {
        if self.is_encrypted() {
            return Err(Error::InvalidState("Packet is already encrypted".to_string()));
        }
        let Some(payload) = self.payload.as_mut() else {
            return Err(Error::InvalidState("No payload present".to_string()));
        };

        let nonce = random_array::<NONCE_LEN>()?;
        apply_keystream(key, &nonce, payload);
        trace!(len = payload.len(), "encrypted packet payload");

        self.nonce = Some(nonce);
        self.flags.insert(PacketFlags::WITH_ENCRYPTION);
        Ok(())
    }

    /// Reverses [`encrypt`](Self::encrypt). A wrong key yields garbage, not an error.
    pub fn decrypt(&mut self, key: &[u8; 32]) -> Result<(), Error> {
        if !self.is_encrypted() {
            return Err(Error::InvalidState("Packet is not encrypted".to_string()));
        }
        let Some(payload) = self.payload.as_mut() else {
            return Err(Error::InvalidState("No payload present".to_string()));
        };
        let Some(nonce) = self.nonce else {
            return Err(Error::InvalidState("Encrypted packet without nonce".to_string()));
        };

        apply_keystream(key, &nonce, payload);
        trace!(len = payload.len(), "decrypted packet payload");

        self.nonce = None;
        self.flags.remove(PacketFlags::WITH_ENCRYPTION);
        Ok(())
    }

    /// Bytes covered by the signature: version, flags and type, then everything
    /// behind the signature slot. The signature flag counts as set.
    pub(crate) fn signable_region(&self) -> Result<Vec<u8>, Error> {
        let flags = self.flags() | PacketFlags::WITH_SIGNATURE;

        let mut bytes = Vec::with_capacity(self.size());
        self.write_static_header(flags, &mut bytes);
        self.write_after_signature(flags, &mut bytes)?;
        Ok(bytes)
    }

    /// Signs the packet and freezes it.
    ///
    /// With `set_sender_id` the sender id becomes the truncated hash of the
    /// signing key's public half.
    pub fn sign(
        mut self,
        signing_key: &SigningKey,
        set_sender_id: bool,
    ) -> Result<SignedPacket, Error> {
        if set_sender_id {
            self.sender_id = Some(Identifier::from_public_key(
                signing_key.verifying_key().as_bytes(),
            ));
        }

        self.flags.insert(PacketFlags::WITH_SIGNATURE);
        let region = self.signable_region()?;
        self.signature = Some(signing_key.sign(&region).to_bytes());
        trace!(len = region.len(), "signed packet");

        Ok(SignedPacket(self))
    }

    /// Checks the signature against `public_key`, or the carried sender key when
    /// none is given.
    ///
    /// A sender id that does not belong to the key is an error; a signature that
    /// does not match is `Ok(false)`.
    pub fn verify(&self, public_key: Option<&VerifyingKey>) -> Result<bool, Error> {
        let public_key = match public_key {
            Some(key) => *key,
            None => match self.sender_key {
                Some(key) if self.flags.contains(PacketFlags::WITH_SENDER_KEY) => {
                    VerifyingKey::from_bytes(&key)?
                }
                _ => {
                    return Err(Error::CryptoPrecondition(
                        "No public key provided and none present in packet".to_string(),
                    ));
                }
            },
        };

        let signature = match self.signature {
            Some(signature) if self.flags.contains(PacketFlags::WITH_SIGNATURE) => signature,
            _ => {
                return Err(Error::CryptoPrecondition(
                    "No signature present on this packet".to_string(),
                ));
            }
        };

        if self.flags().contains(PacketFlags::WITH_SENDER_ID) {
            let author = Identifier::from_public_key(public_key.as_bytes());
            if self.sender_id() != Some(author) {
                warn!(%author, "sender id does not match verifying key");
                return Err(Error::AuthenticationFailure(
                    "Provided public key does not match the sender id".to_string(),
                ));
            }
        }

        let region = self.signable_region()?;
        Ok(public_key
            .verify(&region, &Signature::from_bytes(&signature))
            .is_ok())
    }
}

fn apply_keystream(key: &[u8; 32], nonce: &[u8; NONCE_LEN], data: &mut [u8]) {
    let mut cipher = ChaCha20::new(key.into(), nonce.into());
    cipher.apply_keystream(data);
}

/// A packet whose fields can no longer change, so its signature stays valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedPacket(PlabblePacket);

impl SignedPacket {
    pub fn packet(&self) -> &PlabblePacket {
        &self.0
    }

    pub fn signature(&self) -> Option<&[u8; SIGNATURE_LEN]> {
        self.0.signature()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        self.0.serialize()
    }

    pub fn verify(&self, public_key: Option<&VerifyingKey>) -> Result<bool, Error> {
        self.0.verify(public_key)
    }

    /// Gives the packet back for editing; any change invalidates the signature.
    pub fn into_packet(self) -> PlabblePacket {
        self.0
    }
}

impl AsRef<PlabblePacket> for SignedPacket {
    fn as_ref(&self) -> &PlabblePacket {
        &self.0
    }
}
