//! RFC 5389 STUN codec, restricted to the subset an ICE relay needs.
//!
//! The relay only ever originates Binding Requests and Binding Responses,
//! but it must parse everything a browser or media server may put on the
//! wire: XOR-MAPPED-ADDRESS, USERNAME, MESSAGE-INTEGRITY, FINGERPRINT,
//! ERROR-CODE and the RFC 5245 check attributes. Unknown attribute types are
//! skipped over, padding included.
//!
//! MESSAGE-INTEGRITY and FINGERPRINT are computed the way RFC 5389 defines
//! them: the attribute is appended first so the declared message length
//! already covers it, then the digest is taken over the serialized prefix up
//! to (and not including) the attribute's own 4-byte header.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};

type HmacSha1 = Hmac<Sha1>;

/// STUN magic cookie (RFC 5389).
pub const MAGIC_COOKIE: u32 = 0x2112A442;

/// Fixed STUN header length.
pub const HEADER_LEN: usize = 20;

/// RFC 5389 transaction id length.
pub const TRANSACTION_ID_LEN: usize = 12;

/// RFC 3489 transaction id length (the magic cookie slot is part of the id).
pub const LEGACY_TRANSACTION_ID_LEN: usize = 16;

/// MESSAGE-INTEGRITY digest length (HMAC-SHA1).
pub const INTEGRITY_LEN: usize = 20;

/// Value XORed into the CRC-32 to form the FINGERPRINT attribute ("STUN").
pub const FINGERPRINT_XOR: u32 = 0x5354554E;

const ATTR_HEADER_LEN: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// STUN attribute type codes (RFC 5389 and RFC 5245).
pub mod attr_type {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const PRIORITY: u16 = 0x0024;
    pub const USE_CANDIDATE: u16 = 0x0025;
    pub const FINGERPRINT: u16 = 0x8028;
    pub const ICE_CONTROLLING: u16 = 0x802A;
    pub const NETWORK_INFO: u16 = 0xC057;
}

const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

/// STUN message types used by ICE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    BindingRequest = 0x0001,
    BindingIndication = 0x0011,
    BindingResponse = 0x0101,
    BindingErrorResponse = 0x0111,
}

impl TryFrom<u16> for MessageType {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(MessageType::BindingRequest),
            0x0011 => Ok(MessageType::BindingIndication),
            0x0101 => Ok(MessageType::BindingResponse),
            0x0111 => Ok(MessageType::BindingErrorResponse),
            other => Err(Error::BadType(other)),
        }
    }
}

/// A STUN transaction id.
///
/// Modern (RFC 5389) ids are 12 bytes and travel after the magic cookie.
/// Legacy (RFC 3489) ids are 16 bytes; the first four occupy the slot where
/// the magic cookie would otherwise be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionId {
    Modern([u8; TRANSACTION_ID_LEN]),
    Legacy([u8; LEGACY_TRANSACTION_ID_LEN]),
}

impl TransactionId {
    /// A fresh random RFC 5389 transaction id.
    pub fn random() -> Self {
        TransactionId::Modern(rand::random())
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, TransactionId::Legacy(_))
    }

    /// The 12 bytes occupying the transaction-id field of the header,
    /// which XOR-MAPPED-ADDRESS uses for IPv6 addresses.
    fn tail(&self) -> [u8; TRANSACTION_ID_LEN] {
        match self {
            TransactionId::Modern(id) => *id,
            TransactionId::Legacy(id) => {
                let mut tail = [0u8; TRANSACTION_ID_LEN];
                tail.copy_from_slice(&id[4..]);
                tail
            }
        }
    }
}

/// A decoded STUN attribute.
///
/// Address-bearing variants store the plain address; XOR transformation
/// happens during encode/decode only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    MappedAddress(SocketAddr),
    XorMappedAddress(SocketAddr),
    Username(Vec<u8>),
    MessageIntegrity([u8; INTEGRITY_LEN]),
    ErrorCode { class: u8, number: u8, reason: String },
    Fingerprint(u32),
    Priority(u32),
    UseCandidate,
    IceControlling(u64),
    NetworkInfo(u32),
}

impl Attribute {
    /// Wire attribute type code.
    pub fn type_code(&self) -> u16 {
        match self {
            Attribute::MappedAddress(_) => attr_type::MAPPED_ADDRESS,
            Attribute::XorMappedAddress(_) => attr_type::XOR_MAPPED_ADDRESS,
            Attribute::Username(_) => attr_type::USERNAME,
            Attribute::MessageIntegrity(_) => attr_type::MESSAGE_INTEGRITY,
            Attribute::ErrorCode { .. } => attr_type::ERROR_CODE,
            Attribute::Fingerprint(_) => attr_type::FINGERPRINT,
            Attribute::Priority(_) => attr_type::PRIORITY,
            Attribute::UseCandidate => attr_type::USE_CANDIDATE,
            Attribute::IceControlling(_) => attr_type::ICE_CONTROLLING,
            Attribute::NetworkInfo(_) => attr_type::NETWORK_INFO,
        }
    }

    /// Unpadded value length on the wire.
    fn value_len(&self) -> usize {
        match self {
            Attribute::MappedAddress(addr) | Attribute::XorMappedAddress(addr) => match addr {
                SocketAddr::V4(_) => 8,
                SocketAddr::V6(_) => 20,
            },
            Attribute::Username(name) => name.len(),
            Attribute::MessageIntegrity(_) => INTEGRITY_LEN,
            Attribute::ErrorCode { reason, .. } => 4 + reason.len(),
            Attribute::Fingerprint(_) | Attribute::Priority(_) | Attribute::NetworkInfo(_) => 4,
            Attribute::UseCandidate => 0,
            Attribute::IceControlling(_) => 8,
        }
    }
}

/// A complete STUN message: type, transaction id and ordered attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunMessage {
    pub message_type: MessageType,
    pub transaction_id: TransactionId,
    attributes: Vec<Attribute>,
}

impl StunMessage {
    pub fn new(message_type: MessageType, transaction_id: TransactionId) -> Self {
        Self {
            message_type,
            transaction_id,
            attributes: Vec::new(),
        }
    }

    /// A Binding Request with a fresh random transaction id.
    pub fn binding_request() -> Self {
        Self::new(MessageType::BindingRequest, TransactionId::random())
    }

    /// A Binding Response echoing the request's transaction id.
    pub fn binding_response(transaction_id: TransactionId) -> Self {
        Self::new(MessageType::BindingResponse, transaction_id)
    }

    /// Attributes in insertion (wire) order.
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Append an attribute; order is preserved on the wire.
    pub fn add_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// First attribute with the given wire type code.
    pub fn get(&self, type_code: u16) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.type_code() == type_code)
    }

    /// The USERNAME attribute as UTF-8, if present and valid.
    pub fn username(&self) -> Option<&str> {
        match self.get(attr_type::USERNAME) {
            Some(Attribute::Username(name)) => std::str::from_utf8(name).ok(),
            _ => None,
        }
    }

    /// The XOR-MAPPED-ADDRESS attribute, if present.
    pub fn xor_mapped_address(&self) -> Option<SocketAddr> {
        match self.get(attr_type::XOR_MAPPED_ADDRESS) {
            Some(Attribute::XorMappedAddress(addr)) => Some(*addr),
            _ => None,
        }
    }

    /// Body length as declared in the header: each attribute header plus its
    /// value rounded up to a 4-byte boundary.
    fn body_len(&self) -> usize {
        self.attributes
            .iter()
            .map(|a| ATTR_HEADER_LEN + pad4(a.value_len()))
            .sum()
    }

    /// Parse a STUN message from `data`.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::ShortBuffer {
                required: HEADER_LEN,
                actual: data.len(),
            });
        }
        // The two topmost bits of a STUN message are zero. RTP and RTCP set
        // the version bits there, so this also rejects misrouted media.
        if data[0] & 0xC0 != 0 {
            return Err(Error::BadType(u16::from_be_bytes([data[0], data[1]])));
        }

        let mut buf = data;
        let raw_type = buf.get_u16();
        let message_type = MessageType::try_from(raw_type)?;

        let length = buf.get_u16();
        if length % 4 != 0 {
            return Err(Error::BadLength(length));
        }
        if length as usize != buf.len() - TRANSACTION_ID_LEN - 4 {
            return Err(Error::BadLength(length));
        }

        let magic = buf.get_u32();
        let mut id_tail = [0u8; TRANSACTION_ID_LEN];
        buf.copy_to_slice(&mut id_tail);

        let transaction_id = if magic == MAGIC_COOKIE {
            TransactionId::Modern(id_tail)
        } else {
            // No magic cookie means the peer implements RFC 3489; the four
            // bytes in the cookie slot belong to the transaction id.
            let mut id = [0u8; LEGACY_TRANSACTION_ID_LEN];
            id[..4].copy_from_slice(&magic.to_be_bytes());
            id[4..].copy_from_slice(&id_tail);
            TransactionId::Legacy(id)
        };

        let mut message = StunMessage::new(message_type, transaction_id);

        while buf.len() >= ATTR_HEADER_LEN {
            let attr_type = buf.get_u16();
            let attr_len = buf.get_u16() as usize;
            let padded = pad4(attr_len);
            if buf.len() < padded {
                return Err(Error::AttributeDecode {
                    attr_type,
                    reason: "value runs past the end of the message",
                });
            }
            let value = &buf[..attr_len];
            if let Some(attribute) = decode_attribute(attr_type, value, &transaction_id)? {
                message.attributes.push(attribute);
            }
            buf.advance(padded);
        }

        Ok(message)
    }

    /// Parse a message and require the RFC 5389 magic cookie.
    pub fn decode_rfc5389(data: &[u8]) -> Result<Self> {
        let message = Self::decode(data)?;
        if let TransactionId::Legacy(id) = message.transaction_id {
            let magic = u32::from_be_bytes([id[0], id[1], id[2], id[3]]);
            return Err(Error::BadMagic(magic));
        }
        Ok(message)
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.body_len());
        buf.put_u16(self.message_type as u16);
        buf.put_u16(self.body_len() as u16);
        match self.transaction_id {
            TransactionId::Modern(id) => {
                buf.put_u32(MAGIC_COOKIE);
                buf.put_slice(&id);
            }
            TransactionId::Legacy(id) => buf.put_slice(&id),
        }
        for attribute in &self.attributes {
            buf.put_u16(attribute.type_code());
            buf.put_u16(attribute.value_len() as u16);
            encode_attribute_value(&mut buf, attribute, &self.transaction_id);
            for _ in 0..pad4(attribute.value_len()) - attribute.value_len() {
                buf.put_u8(0);
            }
        }
        buf.to_vec()
    }

    /// Append a MESSAGE-INTEGRITY attribute keyed with the peer's short-term
    /// credential. Must precede [`add_fingerprint`](Self::add_fingerprint).
    pub fn add_message_integrity(&mut self, key: &[u8]) {
        self.attributes
            .push(Attribute::MessageIntegrity([0u8; INTEGRITY_LEN]));
        let serialized = self.encode();
        let covered = serialized.len() - ATTR_HEADER_LEN - INTEGRITY_LEN;

        let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(&serialized[..covered]);
        let digest: [u8; INTEGRITY_LEN] = mac.finalize().into_bytes().into();

        if let Some(Attribute::MessageIntegrity(value)) = self.attributes.last_mut() {
            *value = digest;
        }
    }

    /// Append a FINGERPRINT attribute. Always the final attribute.
    pub fn add_fingerprint(&mut self) {
        self.attributes.push(Attribute::Fingerprint(0));
        let serialized = self.encode();
        let covered = serialized.len() - ATTR_HEADER_LEN - 4;
        let crc = CRC32.checksum(&serialized[..covered]);
        if let Some(Attribute::Fingerprint(value)) = self.attributes.last_mut() {
            *value = crc ^ FINGERPRINT_XOR;
        }
    }
}

/// Verify the MESSAGE-INTEGRITY of a raw STUN message against `key`.
///
/// Attributes after MESSAGE-INTEGRITY (FINGERPRINT in practice) are excluded
/// by rewriting the declared length to end just past the integrity attribute,
/// as RFC 5389 §15.4 prescribes.
pub fn verify_integrity(data: &[u8], key: &[u8]) -> Result<bool> {
    let (offset, value) = find_attribute(data, attr_type::MESSAGE_INTEGRITY)?;
    if value.len() != INTEGRITY_LEN {
        return Err(Error::AttributeDecode {
            attr_type: attr_type::MESSAGE_INTEGRITY,
            reason: "digest is not 20 bytes",
        });
    }

    let adjusted_len = (offset - HEADER_LEN + ATTR_HEADER_LEN + INTEGRITY_LEN) as u16;
    let mut covered = Vec::with_capacity(offset);
    covered.extend_from_slice(&data[..2]);
    covered.extend_from_slice(&adjusted_len.to_be_bytes());
    covered.extend_from_slice(&data[4..offset]);

    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(&covered);
    Ok(mac.verify_slice(value).is_ok())
}

/// Verify the FINGERPRINT of a raw STUN message.
pub fn verify_fingerprint(data: &[u8]) -> Result<bool> {
    let (offset, value) = find_attribute(data, attr_type::FINGERPRINT)?;
    if value.len() != 4 {
        return Err(Error::AttributeDecode {
            attr_type: attr_type::FINGERPRINT,
            reason: "fingerprint is not 4 bytes",
        });
    }
    let stored = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
    let crc = CRC32.checksum(&data[..offset]);
    Ok(crc ^ FINGERPRINT_XOR == stored)
}

/// Locate an attribute in raw message bytes without fully decoding.
/// Returns the byte offset of the attribute header and the value slice.
fn find_attribute(data: &[u8], wanted: u16) -> Result<(usize, &[u8])> {
    if data.len() < HEADER_LEN {
        return Err(Error::ShortBuffer {
            required: HEADER_LEN,
            actual: data.len(),
        });
    }
    let mut offset = HEADER_LEN;
    while offset + ATTR_HEADER_LEN <= data.len() {
        let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
        let attr_len = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
        let value_start = offset + ATTR_HEADER_LEN;
        let value_end = value_start + attr_len;
        if value_end > data.len() {
            return Err(Error::AttributeDecode {
                attr_type,
                reason: "value runs past the end of the message",
            });
        }
        if attr_type == wanted {
            return Ok((offset, &data[value_start..value_end]));
        }
        offset = value_start + pad4(attr_len);
    }
    Err(Error::AttributeDecode {
        attr_type: wanted,
        reason: "attribute not present",
    })
}

fn decode_attribute(
    attr_type: u16,
    value: &[u8],
    transaction_id: &TransactionId,
) -> Result<Option<Attribute>> {
    let attribute = match attr_type {
        attr_type::MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(attr_type, value)?),
        attr_type::XOR_MAPPED_ADDRESS => {
            let xored = decode_address(attr_type, value)?;
            Attribute::XorMappedAddress(unxor_address(xored, transaction_id))
        }
        attr_type::USERNAME => Attribute::Username(value.to_vec()),
        attr_type::MESSAGE_INTEGRITY => {
            let digest: [u8; INTEGRITY_LEN] = value.try_into().map_err(|_| Error::AttributeDecode {
                attr_type,
                reason: "digest is not 20 bytes",
            })?;
            Attribute::MessageIntegrity(digest)
        }
        attr_type::ERROR_CODE => {
            if value.len() < 4 {
                return Err(Error::AttributeDecode {
                    attr_type,
                    reason: "error-code shorter than 4 bytes",
                });
            }
            let bits = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
            Attribute::ErrorCode {
                class: ((bits >> 8) & 0x07) as u8,
                number: (bits & 0xFF) as u8,
                reason: String::from_utf8_lossy(&value[4..]).into_owned(),
            }
        }
        attr_type::FINGERPRINT => Attribute::Fingerprint(decode_u32(attr_type, value)?),
        attr_type::PRIORITY => Attribute::Priority(decode_u32(attr_type, value)?),
        attr_type::USE_CANDIDATE => Attribute::UseCandidate,
        attr_type::ICE_CONTROLLING => {
            if value.len() != 8 {
                return Err(Error::AttributeDecode {
                    attr_type,
                    reason: "ice-controlling is not 8 bytes",
                });
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(value);
            Attribute::IceControlling(u64::from_be_bytes(bytes))
        }
        attr_type::NETWORK_INFO => Attribute::NetworkInfo(decode_u32(attr_type, value)?),
        // Unknown attribute: skip value and padding, keep nothing.
        _ => return Ok(None),
    };
    Ok(Some(attribute))
}

fn decode_u32(attr_type: u16, value: &[u8]) -> Result<u32> {
    if value.len() != 4 {
        return Err(Error::AttributeDecode {
            attr_type,
            reason: "value is not 4 bytes",
        });
    }
    Ok(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
}

fn decode_address(attr_type: u16, value: &[u8]) -> Result<SocketAddr> {
    if value.len() < 4 {
        return Err(Error::AttributeDecode {
            attr_type,
            reason: "address shorter than 4 bytes",
        });
    }
    let family = value[1];
    let port = u16::from_be_bytes([value[2], value[3]]);
    match family {
        FAMILY_IPV4 => {
            if value.len() != 8 {
                return Err(Error::AttributeDecode {
                    attr_type,
                    reason: "ipv4 address is not 8 bytes",
                });
            }
            let octets: [u8; 4] = value[4..8].try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        FAMILY_IPV6 => {
            if value.len() != 20 {
                return Err(Error::AttributeDecode {
                    attr_type,
                    reason: "ipv6 address is not 20 bytes",
                });
            }
            let octets: [u8; 16] = value[4..20].try_into().unwrap();
            Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => Err(Error::AttributeDecode {
            attr_type,
            reason: "unknown address family",
        }),
    }
}

fn encode_attribute_value(buf: &mut BytesMut, attribute: &Attribute, tid: &TransactionId) {
    match attribute {
        Attribute::MappedAddress(addr) => encode_address(buf, *addr),
        Attribute::XorMappedAddress(addr) => encode_address(buf, xor_address(*addr, tid)),
        Attribute::Username(name) => buf.put_slice(name),
        Attribute::MessageIntegrity(digest) => buf.put_slice(digest),
        Attribute::ErrorCode { class, number, reason } => {
            buf.put_u32(((*class as u32) << 8) | *number as u32);
            buf.put_slice(reason.as_bytes());
        }
        Attribute::Fingerprint(value) | Attribute::Priority(value) | Attribute::NetworkInfo(value) => {
            buf.put_u32(*value)
        }
        Attribute::UseCandidate => {}
        Attribute::IceControlling(value) => buf.put_u64(*value),
    }
}

fn encode_address(buf: &mut BytesMut, addr: SocketAddr) {
    buf.put_u8(0);
    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(FAMILY_IPV4);
            buf.put_u16(v4.port());
            buf.put_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(FAMILY_IPV6);
            buf.put_u16(v6.port());
            buf.put_slice(&v6.ip().octets());
        }
    }
}

/// XOR an address for XOR-MAPPED-ADDRESS. The port is XORed with the high 16
/// bits of the magic cookie; IPv4 bytes with the cookie, IPv6 bytes with the
/// cookie followed by the 12 transaction-id bytes. The transform is its own
/// inverse.
fn xor_address(addr: SocketAddr, tid: &TransactionId) -> SocketAddr {
    let port = addr.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match addr.ip() {
        IpAddr::V4(ip) => {
            let bits = u32::from_be_bytes(ip.octets()) ^ MAGIC_COOKIE;
            SocketAddr::new(IpAddr::V4(Ipv4Addr::from(bits.to_be_bytes())), port)
        }
        IpAddr::V6(ip) => {
            let mut mask = [0u8; 16];
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(&tid.tail());
            let mut octets = ip.octets();
            for (byte, m) in octets.iter_mut().zip(mask) {
                *byte ^= m;
            }
            SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
        }
    }
}

fn unxor_address(addr: SocketAddr, tid: &TransactionId) -> SocketAddr {
    xor_address(addr, tid)
}

fn pad4(len: usize) -> usize {
    (len + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"VOkJxbRl1RmTxUk/WvJxBt";

    fn sample_request() -> StunMessage {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(Attribute::Username(b"s1:c1".to_vec()));
        msg.add_attribute(Attribute::Priority(2113937151));
        msg.add_attribute(Attribute::IceControlling(0x1122334455667788));
        msg.add_attribute(Attribute::UseCandidate);
        msg.add_attribute(Attribute::NetworkInfo(0x00010001));
        msg
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let mut msg = sample_request();
        msg.add_attribute(Attribute::MappedAddress("192.0.2.7:5000".parse().unwrap()));
        msg.add_attribute(Attribute::XorMappedAddress("203.0.113.10:4242".parse().unwrap()));
        let wire = msg.encode();
        let decoded = StunMessage::decode(&wire).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.encode(), wire);
    }

    #[test]
    fn round_trip_ipv6_xor_address() {
        let mut msg = StunMessage::binding_response(TransactionId::random());
        let addr: SocketAddr = "[2001:db8::42]:61000".parse().unwrap();
        msg.add_attribute(Attribute::XorMappedAddress(addr));
        let wire = msg.encode();
        let decoded = StunMessage::decode(&wire).unwrap();
        assert_eq!(decoded.xor_mapped_address(), Some(addr));
        assert_eq!(decoded.encode(), wire);
    }

    #[test]
    fn integrity_and_fingerprint_verify_after_reparse() {
        let mut msg = sample_request();
        msg.add_message_integrity(KEY);
        msg.add_fingerprint();
        let wire = msg.encode();

        assert!(verify_integrity(&wire, KEY).unwrap());
        assert!(verify_fingerprint(&wire).unwrap());
        assert!(!verify_integrity(&wire, b"wrong-password").unwrap());

        // Flipping a payload byte must break both digests.
        let mut tampered = wire.clone();
        tampered[HEADER_LEN + 4] ^= 0xFF;
        assert!(!verify_integrity(&tampered, KEY).unwrap());
        assert!(!verify_fingerprint(&tampered).unwrap());
    }

    #[test]
    fn declared_length_counts_integrity_attribute() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(Attribute::Username(b"a:b".to_vec()));
        msg.add_message_integrity(KEY);
        let wire = msg.encode();
        let declared = u16::from_be_bytes([wire[2], wire[3]]) as usize;
        // USERNAME: 4 + pad4(3) = 8; MESSAGE-INTEGRITY: 4 + 20 = 24.
        assert_eq!(declared, 32);
        assert_eq!(wire.len(), HEADER_LEN + declared);
    }

    #[test]
    fn legacy_transaction_id_survives_round_trip() {
        let mut wire = sample_request().encode();
        // Overwrite the magic cookie: the message becomes RFC 3489.
        wire[4..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let decoded = StunMessage::decode(&wire).unwrap();
        assert!(decoded.transaction_id.is_legacy());
        assert_eq!(decoded.encode(), wire);
    }

    #[test]
    fn unknown_attributes_are_skipped() {
        let mut wire = StunMessage::binding_request().encode();
        // Append SOFTWARE (0x8022) with a 5-byte value and 3 bytes padding.
        wire.extend_from_slice(&[0x80, 0x22, 0x00, 0x05]);
        wire.extend_from_slice(b"hello\0\0\0");
        let len = (wire.len() - HEADER_LEN) as u16;
        wire[2..4].copy_from_slice(&len.to_be_bytes());

        let decoded = StunMessage::decode(&wire).unwrap();
        assert!(decoded.attributes().is_empty());
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(matches!(
            StunMessage::decode(&[0u8; 10]),
            Err(Error::ShortBuffer { .. })
        ));

        let mut wire = sample_request().encode();
        wire[0] = 0x80; // looks like RTP
        assert!(matches!(StunMessage::decode(&wire), Err(Error::BadType(_))));

        let mut wire = sample_request().encode();
        wire[3] += 1; // length no longer a multiple of 4
        assert!(matches!(StunMessage::decode(&wire), Err(Error::BadLength(_))));

        let mut wire = sample_request().encode();
        wire.truncate(wire.len() - 4); // length disagrees with buffer
        assert!(matches!(StunMessage::decode(&wire), Err(Error::BadLength(_))));
    }

    #[test]
    fn strict_decode_rejects_legacy() {
        let mut wire = sample_request().encode();
        wire[4..8].copy_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        assert!(matches!(
            StunMessage::decode_rfc5389(&wire),
            Err(Error::BadMagic(0x01020304))
        ));
    }

    #[test]
    fn error_code_decodes() {
        let mut msg = StunMessage::new(
            MessageType::BindingErrorResponse,
            TransactionId::random(),
        );
        msg.add_attribute(Attribute::ErrorCode {
            class: 4,
            number: 1,
            reason: "Unauthorized".into(),
        });
        let decoded = StunMessage::decode(&msg.encode()).unwrap();
        match decoded.get(attr_type::ERROR_CODE) {
            Some(Attribute::ErrorCode { class, number, reason }) => {
                assert_eq!((*class, *number), (4, 1));
                assert_eq!(reason, "Unauthorized");
            }
            other => panic!("unexpected attribute: {other:?}"),
        }
    }

    #[test]
    fn username_helper_requires_utf8() {
        let mut msg = StunMessage::binding_request();
        msg.add_attribute(Attribute::Username(vec![0xFF, 0xFE]));
        assert_eq!(msg.username(), None);
    }
}
