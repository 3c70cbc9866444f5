use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

/// The session checksum exchanged in FIN payloads: polynomial
/// 0xEDB88320 (reflected), initial value 0xFFFFFFFF, final xor
/// 0xFFFFFFFF.
pub(crate) static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Header (length, type, sequence number) plus the trailing parity
/// byte. A frame carrying an empty payload is exactly this long.
pub const MIN_FRAME_LEN: usize = 10;

/// Bit 3 of the type byte separates control from data packets.
const CONTROL_BIT: u8 = 0b1000;

/// Typed view of the wire type byte. Everything outside these eight
/// values is reserved and rejected at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Data,
    Retransmit,
    Syn,
    SynAck,
    Ack,
    Nak,
    Fin,
    Rst,
}

impl PacketKind {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0b0000 => Some(PacketKind::Data),
            0b0001 => Some(PacketKind::Retransmit),
            0b1000 => Some(PacketKind::Syn),
            0b1001 => Some(PacketKind::SynAck),
            0b1010 => Some(PacketKind::Ack),
            0b1011 => Some(PacketKind::Nak),
            0b1100 => Some(PacketKind::Fin),
            0b1101 => Some(PacketKind::Rst),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            PacketKind::Data => 0b0000,
            PacketKind::Retransmit => 0b0001,
            PacketKind::Syn => 0b1000,
            PacketKind::SynAck => 0b1001,
            PacketKind::Ack => 0b1010,
            PacketKind::Nak => 0b1011,
            PacketKind::Fin => 0b1100,
            PacketKind::Rst => 0b1101,
        }
    }

    pub fn is_control(self) -> bool {
        self.to_wire() & CONTROL_BIT != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame of {0} bytes is shorter than the 10 byte minimum")]
    TooShort(usize),

    #[error("declared payload length {declared} disagrees with the {actual} bytes received")]
    LengthMismatch { declared: u32, actual: usize },

    #[error("parity byte does not match the frame contents")]
    Parity,

    #[error("unknown packet type {0:#06b}")]
    UnknownKind(u8),
}

/// One unit of communication. Immutable once built; the length field
/// and the parity byte exist only on the wire.
///
/// Frame layout, all multibyte fields big-endian:
///
/// ```text
/// length (4) | type (1) | sequence_no (4) | payload (length) | parity (1)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketKind,
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn syn(cisn: u32) -> Packet {
        Packet {
            kind: PacketKind::Syn,
            seq_no: cisn,
            payload: Vec::new(),
        }
    }

    pub fn syn_ack(sisn: u32, cisn: u32) -> Packet {
        Packet {
            kind: PacketKind::SynAck,
            seq_no: sisn,
            payload: cisn.wrapping_add(1).to_be_bytes().to_vec(),
        }
    }

    /// The ACK completing the three-way handshake, acknowledging the
    /// server's ISN.
    pub fn handshake_ack(cisn: u32, sisn: u32) -> Packet {
        Packet {
            kind: PacketKind::Ack,
            seq_no: cisn.wrapping_add(1),
            payload: sisn.wrapping_add(1).to_be_bytes().to_vec(),
        }
    }

    pub fn data(seq_no: u32, chunk: &[u8]) -> Packet {
        Packet {
            kind: PacketKind::Data,
            seq_no,
            payload: chunk.to_vec(),
        }
    }

    /// Same bytes as [`Packet::data`], marked as a resend.
    pub fn retransmit(seq_no: u32, chunk: &[u8]) -> Packet {
        Packet {
            kind: PacketKind::Retransmit,
            seq_no,
            payload: chunk.to_vec(),
        }
    }

    pub fn ack(seq_no: u32) -> Packet {
        Packet {
            kind: PacketKind::Ack,
            seq_no,
            payload: Vec::new(),
        }
    }

    pub fn nak(seq_no: u32) -> Packet {
        Packet {
            kind: PacketKind::Nak,
            seq_no,
            payload: Vec::new(),
        }
    }

    /// FIN carries the sender's running checksum over every
    /// application byte of the session.
    pub fn fin(seq_no: u32, crc: u32) -> Packet {
        Packet {
            kind: PacketKind::Fin,
            seq_no,
            payload: crc.to_be_bytes().to_vec(),
        }
    }

    pub fn rst(seq_no: u32) -> Packet {
        Packet {
            kind: PacketKind::Rst,
            seq_no,
            payload: Vec::new(),
        }
    }

    /// The 4-byte big-endian scalar some packets carry (SYN-ACK, the
    /// handshake ACK, FIN). `None` when the payload has any other
    /// length.
    pub fn payload_scalar(&self) -> Option<u32> {
        (self.payload.len() == 4).then(|| BigEndian::read_u32(&self.payload))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());

        frame
            .write_u32::<BigEndian>(self.payload.len() as u32)
            .unwrap();
        frame.write_u8(self.kind.to_wire()).unwrap();
        frame.write_u32::<BigEndian>(self.seq_no).unwrap();
        frame.extend_from_slice(&self.payload);
        frame.push(parity_byte(&frame));

        frame
    }

    pub fn decode(frame: &[u8]) -> Result<Packet, DecodeError> {
        if frame.len() < MIN_FRAME_LEN {
            return Err(DecodeError::TooShort(frame.len()));
        }

        let declared = BigEndian::read_u32(&frame[..4]);
        let actual = frame.len() - MIN_FRAME_LEN;
        if declared as usize != actual {
            return Err(DecodeError::LengthMismatch { declared, actual });
        }

        /*
        The parity byte commits to the 1-bit count of everything before
        it: 0x00 when that count is even, 0x0F when it is odd. A frame
        whose trailing byte disagrees with the recomputation was damaged
        in flight, and nothing else in it can be trusted.
        */
        let last = frame.len() - 1;
        if frame[last] != parity_byte(&frame[..last]) {
            return Err(DecodeError::Parity);
        }

        let kind =
            PacketKind::from_wire(frame[4]).ok_or(DecodeError::UnknownKind(frame[4]))?;

        Ok(Packet {
            kind,
            seq_no: BigEndian::read_u32(&frame[5..9]),
            payload: frame[9..last].to_vec(),
        })
    }
}

fn parity_byte(bytes: &[u8]) -> u8 {
    let ones: u32 = bytes.iter().map(|b| b.count_ones()).sum();

    if ones % 2 == 0 {
        0b0000_0000
    } else {
        0b0000_1111
    }
}
