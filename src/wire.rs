//! Wire codec — fixed-layout frame header + typed payloads.
//!
//! # On-the-wire layout (16 bytes, all multi-byte fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      1   version    = 2
//!    1      1   opcode     closed set, see [`Opcode`]
//!    2      1   status     closed set, see [`Status`]
//!    3      1   ex_status  command specific
//!    4      4   tag        request/reply correlation (BE u32)
//!    8      4   size       payload bytes following the header (BE u32)
//!   12      2   flags      see FLAG_* / COMP_* (BE u16)
//!   14      2   reserved   must be zero
//! ```
//!
//! # Flags
//! Bits 1..5 carry the boolean flags; bits 12-15 carry the compression
//! family (0 = none, 1 = zstd, 2 = lz4, 3 = lzma).  `FLAG_VALID_MASK`
//! rejects any other bit.  Decoders MUST reject a header whose version,
//! opcode, reserved bits, or size fall outside the negotiated limits;
//! there is no lenient mode.
//!
//! # Frame size
//! `size` is bounded by [`MAX_FRAME`]: one maximum chunk plus headroom for
//! cipher padding and compression expansion on incompressible input.

use byteorder::{BigEndian, ByteOrder};
use thiserror::Error;

/// Protocol version spoken by this client.
pub const WIRE_VERSION: u8 = 2;

/// Exact byte size of every frame header.
pub const HEADER_SIZE: usize = 16;

/// Hard upper bound on a chunk of file data.
pub const CHUNK_MAX: usize = 1024 * 1024;

/// Largest payload accepted in either direction.  CHUNK_MAX plus headroom
/// for CBC padding and worst-case compression expansion.
pub const MAX_FRAME: u32 = (CHUNK_MAX + 4096) as u32;

/// SHA-1 digest length; the identity of every chunk on the wire.
pub use crate::crypto::DIGEST_LEN;

// ── Flags ────────────────────────────────────────────────────────────────────

pub const FLAG_VERIFY_DIGEST: u16 = 1 << 1;
pub const FLAG_METADATA:      u16 = 1 << 2;
pub const FLAG_CB_OWN:        u16 = 1 << 3;
pub const FLAG_XML_REPLY:     u16 = 1 << 4;
pub const FLAG_ENCRYPTED:     u16 = 1 << 5;

/// Compression family occupies bits 12-15.
pub const COMP_ZSTD: u16 = 1 << 12;
pub const COMP_LZ4:  u16 = 2 << 12;
pub const COMP_LZMA: u16 = 3 << 12;
pub const COMP_MASK: u16 = 0xf000;

/// Every bit a well-formed header may carry.
pub const FLAG_VALID_MASK: u16 = 0xf03e;

// ── Opcode ───────────────────────────────────────────────────────────────────

/// Closed operation set.  Values are frozen on the wire; a request opcode
/// pairs with exactly one reply opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Login       = 4,
    LoginReply  = 5,
    Nop         = 10,
    NopReply    = 11,
    Exists      = 12,
    ExistsReply = 13,
    Read        = 14,
    ReadReply   = 15,
    Write       = 16,
    WriteReply  = 17,
    Xml         = 18,
    XmlReply    = 19,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            4  => Some(Opcode::Login),
            5  => Some(Opcode::LoginReply),
            10 => Some(Opcode::Nop),
            11 => Some(Opcode::NopReply),
            12 => Some(Opcode::Exists),
            13 => Some(Opcode::ExistsReply),
            14 => Some(Opcode::Read),
            15 => Some(Opcode::ReadReply),
            16 => Some(Opcode::Write),
            17 => Some(Opcode::WriteReply),
            18 => Some(Opcode::Xml),
            19 => Some(Opcode::XmlReply),
            _  => None,
        }
    }

    /// The reply opcode paired with a request opcode.
    /// Returns `None` when `self` is itself a reply.
    pub fn reply(self) -> Option<Opcode> {
        match self {
            Opcode::Nop    => Some(Opcode::NopReply),
            Opcode::Login  => Some(Opcode::LoginReply),
            Opcode::Exists => Some(Opcode::ExistsReply),
            Opcode::Read   => Some(Opcode::ReadReply),
            Opcode::Write  => Some(Opcode::WriteReply),
            Opcode::Xml    => Some(Opcode::XmlReply),
            _ => None,
        }
    }

    #[inline]
    pub fn is_reply(self) -> bool {
        self.reply().is_none()
    }
}

// ── Status ───────────────────────────────────────────────────────────────────

/// Reply status byte.  `Exists` doubles as the dedup verdict on WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok             = 0,
    Fail           = 1,
    Exists         = 2,
    DoesntExist    = 3,
    InvalidDigest  = 4,
    LoginFailed    = 5,
    Permission     = 6,
    BadXml         = 7,
    AdminCmdFailed = 8,
    InvalidComp    = 9,
}

impl Status {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Status::Ok),
            1 => Some(Status::Fail),
            2 => Some(Status::Exists),
            3 => Some(Status::DoesntExist),
            4 => Some(Status::InvalidDigest),
            5 => Some(Status::LoginFailed),
            6 => Some(Status::Permission),
            7 => Some(Status::BadXml),
            8 => Some(Status::AdminCmdFailed),
            9 => Some(Status::InvalidComp),
            _ => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum WireError {
    #[error("unsupported wire version {0} (this client speaks v{WIRE_VERSION})")]
    BadVersion(u8),
    #[error("unknown opcode {0}")]
    BadOpcode(u8),
    #[error("unknown status {0}")]
    BadStatus(u8),
    #[error("reserved flag bits set: {0:#06x}")]
    BadFlags(u16),
    #[error("reserved header field not zero")]
    BadReserved,
    #[error("frame size {0} exceeds maximum {MAX_FRAME}")]
    Oversize(u32),
    #[error("header truncated: {0} bytes of {HEADER_SIZE}")]
    Truncated(usize),
}

// ── Header ───────────────────────────────────────────────────────────────────

/// The 16-byte frame header carried by every message in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version:   u8,
    pub opcode:    Opcode,
    pub status:    Status,
    pub ex_status: u8,
    pub tag:       u32,
    pub size:      u32,
    pub flags:     u16,
}

impl Header {
    /// A request header with everything but opcode/size zeroed.
    pub fn request(opcode: Opcode, size: u32) -> Self {
        Header {
            version:   WIRE_VERSION,
            opcode,
            status:    Status::Ok,
            ex_status: 0,
            tag:       0,
            size,
            flags:     0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.opcode as u8;
        buf[2] = self.status as u8;
        buf[3] = self.ex_status;
        BigEndian::write_u32(&mut buf[4..8], self.tag);
        BigEndian::write_u32(&mut buf[8..12], self.size);
        BigEndian::write_u16(&mut buf[12..14], self.flags);
        // bytes 14..16 stay zero (reserved)
        buf
    }

    /// Decode and validate a header.
    ///
    /// Rejects wrong version, unknown opcode or status, reserved flag
    /// bits, a nonzero reserved field, and an oversize payload.  A header
    /// that fails here MUST terminate the session; nothing after it can
    /// be framed.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < HEADER_SIZE {
            return Err(WireError::Truncated(buf.len()));
        }
        let version = buf[0];
        if version != WIRE_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let opcode = Opcode::from_u8(buf[1]).ok_or(WireError::BadOpcode(buf[1]))?;
        let status = Status::from_u8(buf[2]).ok_or(WireError::BadStatus(buf[2]))?;
        let flags = BigEndian::read_u16(&buf[12..14]);
        if flags & !FLAG_VALID_MASK != 0 {
            return Err(WireError::BadFlags(flags));
        }
        if BigEndian::read_u16(&buf[14..16]) != 0 {
            return Err(WireError::BadReserved);
        }
        let size = BigEndian::read_u32(&buf[8..12]);
        if size > MAX_FRAME {
            return Err(WireError::Oversize(size));
        }
        Ok(Header {
            version,
            opcode,
            status,
            ex_status: buf[3],
            tag: BigEndian::read_u32(&buf[4..8]),
            size,
            flags,
        })
    }

    #[inline] pub fn is_metadata(&self)  -> bool { self.flags & FLAG_METADATA != 0 }
    #[inline] pub fn is_encrypted(&self) -> bool { self.flags & FLAG_ENCRYPTED != 0 }
    #[inline] pub fn comp_bits(&self)    -> u16  { self.flags & COMP_MASK }
}

// ── Typed payloads ───────────────────────────────────────────────────────────

/// NOP request/reply body: one BE u32 id.  The server echoes id + 1.
pub fn encode_nop_id(id: u32) -> [u8; 4] {
    let mut b = [0u8; 4];
    BigEndian::write_u32(&mut b, id);
    b
}

pub fn decode_nop_id(body: &[u8]) -> Result<u32, WireError> {
    if body.len() < 4 {
        return Err(WireError::Truncated(body.len()));
    }
    Ok(BigEndian::read_u32(&body[..4]))
}

/// EXISTS / READ request body and WRITE reply body: one raw digest.
pub fn decode_digest(body: &[u8]) -> Result<[u8; DIGEST_LEN], WireError> {
    if body.len() < DIGEST_LEN {
        return Err(WireError::Truncated(body.len()));
    }
    let mut d = [0u8; DIGEST_LEN];
    d.copy_from_slice(&body[..DIGEST_LEN]);
    Ok(d)
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let hdr = Header {
            version:   WIRE_VERSION,
            opcode:    Opcode::Write,
            status:    Status::Ok,
            ex_status: 7,
            tag:       0xdead_beef,
            size:      512,
            flags:     FLAG_ENCRYPTED | COMP_ZSTD,
        };
        let got = Header::decode(&hdr.encode()).unwrap();
        assert_eq!(got, hdr);
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = Header::request(Opcode::Nop, 4).encode();
        buf[0] = 1;
        assert!(matches!(Header::decode(&buf), Err(WireError::BadVersion(1))));
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut buf = Header::request(Opcode::Nop, 4).encode();
        buf[1] = 99;
        assert!(matches!(Header::decode(&buf), Err(WireError::BadOpcode(99))));
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let mut hdr = Header::request(Opcode::Write, 0);
        hdr.flags = 1 << 0; // bit 0 is not in the valid mask
        assert!(matches!(Header::decode(&hdr.encode()), Err(WireError::BadFlags(_))));
    }

    #[test]
    fn rejects_oversize_frame() {
        let hdr = Header::request(Opcode::Write, MAX_FRAME + 1);
        assert!(matches!(Header::decode(&hdr.encode()), Err(WireError::Oversize(_))));
    }

    #[test]
    fn opcode_pairing_is_closed() {
        assert_eq!(Opcode::Exists.reply(), Some(Opcode::ExistsReply));
        assert_eq!(Opcode::Read.reply(), Some(Opcode::ReadReply));
        assert_eq!(Opcode::Write.reply(), Some(Opcode::WriteReply));
        assert_eq!(Opcode::Xml.reply(), Some(Opcode::XmlReply));
        assert_eq!(Opcode::Nop.reply(), Some(Opcode::NopReply));
        assert_eq!(Opcode::Login.reply(), Some(Opcode::LoginReply));
        assert_eq!(Opcode::WriteReply.reply(), None);
    }

    #[test]
    fn header_is_exactly_sixteen_bytes() {
        assert_eq!(Header::request(Opcode::Nop, 0).encode().len(), 16);
    }
}
