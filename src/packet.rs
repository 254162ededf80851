//! Wire-format definitions for protocol segments.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire bit layout of the header ([`LAYOUT`]).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Parsing a raw byte slice back into a [`Packet`].
//! - Named, base-aware field access for tooling and tests.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! Fields are packed most-significant bit first.
//!
//! ```text
//!  0               1               2               3               4
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence Number        |     Acknowledgment Number     |S|A|F|R|Offset |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                Payload ...                                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 5 bytes.  The payload has no length
//! field; it is whatever follows the header.

use std::fmt;

use thiserror::Error;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 5;

const HEADER_BITS: u32 = (HEADER_LEN * 8) as u32;

/// One named slot of the header bit layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    /// Bit offset from the most significant bit of the header.
    pub offset: u32,
    /// Width in bits.
    pub width: u32,
}

impl Field {
    const fn new(name: &'static str, offset: u32, width: u32) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    fn mask(&self) -> u64 {
        (1u64 << self.width) - 1
    }

    fn shift(&self) -> u32 {
        HEADER_BITS - self.offset - self.width
    }
}

/// Header layout, in wire order.
pub const LAYOUT: [Field; 7] = [
    Field::new("seq_num", 0, 16),
    Field::new("ack_num", 16, 16),
    Field::new("syn", 32, 1),
    Field::new("ack", 33, 1),
    Field::new("fin", 34, 1),
    Field::new("rst", 35, 1),
    Field::new("offset", 36, 4),
];

const SEQ_NUM: Field = LAYOUT[0];
const ACK_NUM: Field = LAYOUT[1];
const SYN: Field = LAYOUT[2];
const ACK: Field = LAYOUT[3];
const FIN: Field = LAYOUT[4];
const RST: Field = LAYOUT[5];

/// Bit-flag constants accepted by [`Packet::segment`].
pub mod flags {
    /// Start of a session.
    pub const SYN: u8 = 0b0000_0001;
    /// `ack_num` is meaningful.
    pub const ACK: u8 = 0b0000_0010;
    /// End of a session.
    pub const FIN: u8 = 0b0000_0100;
    /// Session rejected.
    pub const RST: u8 = 0b0000_1000;
}

/// Look up a header field by name.
pub fn field(name: &str) -> Result<&'static Field, PacketError> {
    LAYOUT
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| PacketError::UnknownField(name.to_owned()))
}

/// Numeric base used by the string-valued field accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Base {
    Binary,
    Decimal,
    Hex,
}

impl TryFrom<u32> for Base {
    type Error = PacketError;

    fn try_from(radix: u32) -> Result<Self, Self::Error> {
        match radix {
            2 => Ok(Base::Binary),
            10 => Ok(Base::Decimal),
            16 => Ok(Base::Hex),
            other => Err(PacketError::UnsupportedBase(other)),
        }
    }
}

impl Base {
    fn radix(self) -> u32 {
        match self {
            Base::Binary => 2,
            Base::Decimal => 10,
            Base::Hex => 16,
        }
    }

    /// Binary output keeps the full slot width, zero-padded.
    fn format(self, value: u64, width: u32) -> String {
        match self {
            Base::Binary => format!("{value:0w$b}", w = width as usize),
            Base::Decimal => value.to_string(),
            Base::Hex => format!("{value:x}"),
        }
    }

    fn parse(self, text: &str) -> Result<u128, PacketError> {
        let digits = text.trim();
        let digits = match self {
            Base::Hex => digits
                .strip_prefix("0x")
                .or_else(|| digits.strip_prefix("0X"))
                .unwrap_or(digits),
            Base::Binary => digits.strip_prefix("0b").unwrap_or(digits),
            Base::Decimal => digits,
        };
        let invalid = || PacketError::InvalidValue {
            value: text.to_owned(),
            base: self,
        };
        if digits.is_empty() {
            return Err(invalid());
        }
        // Wrapping arithmetic keeps the low-order bits of values too long
        // for a u128, and only low-order bits are stored.
        let radix = self.radix();
        digits.chars().try_fold(0u128, |acc, c| -> Result<u128, PacketError> {
            let digit = c.to_digit(radix).ok_or_else(invalid)?;
            Ok(acc
                .wrapping_mul(u128::from(radix))
                .wrapping_add(u128::from(digit)))
        })
    }
}

/// A complete protocol datagram: header bits + payload bytes.
///
/// The header is kept as a 40-bit big-endian bit string in the low bits of a
/// `u64`.  Writing a value wider than a field keeps its low-order bits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    header: u64,
    pub payload: Vec<u8>,
}

impl Packet {
    /// An all-zero header with no payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a protocol segment from numeric header values and [`flags`].
    ///
    /// `seq` and `ack` are truncated to the 16-bit slots.
    pub fn segment(seq: u32, ack: u32, segment_flags: u8) -> Self {
        let mut packet = Self::new();
        packet.put(&SEQ_NUM, u64::from(seq));
        packet.put(&ACK_NUM, u64::from(ack));
        packet.put(&SYN, u64::from(segment_flags & flags::SYN != 0));
        packet.put(&ACK, u64::from(segment_flags & flags::ACK != 0));
        packet.put(&FIN, u64::from(segment_flags & flags::FIN != 0));
        packet.put(&RST, u64::from(segment_flags & flags::RST != 0));
        packet
    }

    /// Attach a payload.
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialise this packet into a newly allocated byte vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&self.header.to_be_bytes()[8 - HEADER_LEN..]);
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a [`Packet`] from a raw datagram.
    ///
    /// A buffer shorter than [`HEADER_LEN`] decodes to an all-zero header with
    /// no payload; decoding never fails.
    pub fn decode(buf: &[u8]) -> Self {
        if buf.len() < HEADER_LEN {
            return Self::new();
        }
        let header = buf[..HEADER_LEN]
            .iter()
            .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
        Self {
            header,
            payload: buf[HEADER_LEN..].to_vec(),
        }
    }

    fn get(&self, field: &Field) -> u64 {
        (self.header >> field.shift()) & field.mask()
    }

    fn put(&mut self, field: &Field, value: u64) {
        let mask = field.mask() << field.shift();
        self.header = (self.header & !mask) | ((value & field.mask()) << field.shift());
    }

    /// Numeric value of the named field.
    pub fn value(&self, name: &str) -> Result<u64, PacketError> {
        Ok(self.get(field(name)?))
    }

    /// Write the named field, truncating `value` to the slot width.
    pub fn set_value(&mut self, name: &str, value: u64) -> Result<(), PacketError> {
        let slot = field(name)?;
        self.put(slot, value);
        Ok(())
    }

    /// Read the named field rendered in `base`.
    ///
    /// Binary output is zero-padded to the field width; decimal and hex are
    /// not padded.
    pub fn get_field(&self, name: &str, base: Base) -> Result<String, PacketError> {
        let slot = field(name)?;
        Ok(base.format(self.get(slot), slot.width))
    }

    /// Parse `value` in `base` and write it into the named field.
    ///
    /// Values wider than the field keep their low-order bits.
    pub fn set_field(&mut self, name: &str, value: &str, base: Base) -> Result<(), PacketError> {
        let slot = field(name)?;
        let parsed = base.parse(value)?;
        self.put(slot, (parsed & u128::from(slot.mask())) as u64);
        Ok(())
    }

    pub fn seq_num(&self) -> u16 {
        self.get(&SEQ_NUM) as u16
    }

    pub fn ack_num(&self) -> u16 {
        self.get(&ACK_NUM) as u16
    }

    pub fn syn(&self) -> bool {
        self.get(&SYN) == 1
    }

    pub fn ack(&self) -> bool {
        self.get(&ACK) == 1
    }

    pub fn fin(&self) -> bool {
        self.get(&FIN) == 1
    }

    pub fn rst(&self) -> bool {
        self.get(&RST) == 1
    }

    /// Control bits folded back into a [`flags`] mask.
    pub fn flags(&self) -> u8 {
        let mut out = 0;
        if self.syn() {
            out |= flags::SYN;
        }
        if self.ack() {
            out |= flags::ACK;
        }
        if self.fin() {
            out |= flags::FIN;
        }
        if self.rst() {
            out |= flags::RST;
        }
        out
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq={} ack={} [", self.seq_num(), self.ack_num())?;
        let names = [
            (self.syn(), "SYN"),
            (self.ack(), "ACK"),
            (self.fin(), "FIN"),
            (self.rst(), "RST"),
        ];
        let mut first = true;
        for (set, name) in names {
            if set {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        write!(f, "] len={}", self.payload.len())
    }
}

/// Misuse of the named-field API.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("field '{0}' not found in header definition")]
    UnknownField(String),
    #[error("unsupported base {0}")]
    UnsupportedBase(u32),
    #[error("'{value}' is not a valid {base:?} number")]
    InvalidValue { value: String, base: Base },
}
