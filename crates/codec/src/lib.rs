//! ## Measurement datagram framing
//!
//! Every datagram exchanged by the UDP flow engine starts with a fixed
//! 16-byte header followed by an opaque payload:
//!
//! ```text
//! 0                   4                           12                  16
//! +-------------------+---------------------------+-------------------+
//! |      seq_no       |      send time (us)       |   total_packets   |
//! +-------------------+---------------------------+-------------------+
//! |                         payload ...                               |
//! +-------------------------------------------------------------------+
//! ```
//!
//! All header fields are big-endian. Sequence numbers at the top of the
//! u32 range are reserved for control messages; everything below
//! [`RESERVED_BASE`] is ordinary data. The sender therefore starts its
//! data sequence at 1 and must stop before the reserved range.

use std::array::TryFromSliceError;

use bytes::{BufMut, BytesMut};

/// Connection request.
pub const INIT: u32 = 0xFFFF_FFF0;

/// Connection acknowledgement.
pub const INIT_ACK: u32 = 0xFFFF_FFF1;

/// Abrupt teardown request, sent on user interrupt.
pub const FORCE_QUIT: u32 = 0xFFFF_FFF2;

/// Abrupt teardown acknowledgement, carries the peer's packet total.
pub const FORCE_QUIT_ACK: u32 = 0xFFFF_FFF3;

/// Graceful close acknowledgement, carries the peer's packet total.
pub const FIN_ACK: u32 = 0xFFFF_FFFE;

/// Graceful close request, carries the sender's packet total.
pub const FIN: u32 = 0xFFFF_FFFF;

/// Lowest reserved sequence number. Data packets must keep their
/// sequence numbers strictly below this value.
pub const RESERVED_BASE: u32 = INIT;

/// Size of the fixed packet header in bytes.
pub const HEADER_SIZE: usize = 16;

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// The message class a sequence number encodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Init,
    InitAck,
    ForceQuit,
    ForceQuitAck,
    FinAck,
    Fin,
    Data,
}

impl From<u32> for Kind {
    fn from(seq_no: u32) -> Self {
        match seq_no {
            INIT => Self::Init,
            INIT_ACK => Self::InitAck,
            FORCE_QUIT => Self::ForceQuit,
            FORCE_QUIT_ACK => Self::ForceQuitAck,
            FIN_ACK => Self::FinAck,
            FIN => Self::Fin,
            _ => Self::Data,
        }
    }
}

/// A measurement datagram.
///
/// Data packets carry a monotonically increasing `seq_no` and the send
/// time in microseconds; `total_packets` is zero. Control packets reuse
/// the same layout with a reserved `seq_no` and use `total_packets` to
/// exchange end-of-run packet totals.
#[derive(Debug)]
pub struct Packet<'a> {
    pub seq_no: u32,
    pub timestamp: u64,
    pub total_packets: u32,
    pub payload: &'a [u8],
}

impl<'a> Packet<'a> {
    /// A control packet without payload.
    pub fn control(seq_no: u32, timestamp: u64, total_packets: u32) -> Self {
        Self {
            seq_no,
            timestamp,
            total_packets,
            payload: &[],
        }
    }

    pub fn kind(&self) -> Kind {
        Kind::from(self.seq_no)
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use flowgen_codec::{HEADER_SIZE, Packet};
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// Packet {
    ///     seq_no: 7,
    ///     timestamp: 1_000_000,
    ///     total_packets: 0,
    ///     payload: b"xxxx",
    /// }
    /// .encode(&mut bytes);
    ///
    /// assert_eq!(bytes.len(), HEADER_SIZE + 4);
    /// assert_eq!(&bytes[..4], &[0x00, 0x00, 0x00, 0x07]);
    /// ```
    pub fn encode(&self, bytes: &mut BytesMut) {
        bytes.clear();
        bytes.reserve(HEADER_SIZE + self.payload.len());
        bytes.put_u32(self.seq_no);
        bytes.put_u64(self.timestamp);
        bytes.put_u32(self.total_packets);
        bytes.extend_from_slice(self.payload);
    }

    /// # Test
    ///
    /// ```
    /// use bytes::BytesMut;
    /// use flowgen_codec::Packet;
    ///
    /// let mut bytes = BytesMut::with_capacity(1500);
    ///
    /// Packet {
    ///     seq_no: 1,
    ///     timestamp: 123,
    ///     total_packets: 0,
    ///     payload: b"payload",
    /// }
    /// .encode(&mut bytes);
    ///
    /// let ret = Packet::decode(&bytes[..]).unwrap();
    ///
    /// assert_eq!(ret.seq_no, 1);
    /// assert_eq!(ret.timestamp, 123);
    /// assert_eq!(ret.payload, b"payload");
    /// ```
    pub fn decode(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        Ok(Self {
            seq_no: u32::from_be_bytes(bytes[..4].try_into()?),
            timestamp: u64::from_be_bytes(bytes[4..12].try_into()?),
            total_packets: u32::from_be_bytes(bytes[12..16].try_into()?),
            payload: &bytes[HEADER_SIZE..],
        })
    }
}
