//! A reliable, half-duplex, stop-and-wait transport over an unreliable
//! datagram channel.
//!
//! Sessions open with a three-way handshake carrying random initial
//! sequence numbers, move application bytes strictly one acknowledged
//! chunk at a time, and end with a four-way close in which the
//! initiator submits a CRC-32 over everything it sent and the responder
//! audits it, resetting the session on a mismatch. Every frame carries
//! a parity byte; damaged frames are NAK'd during data transfer and
//! dropped everywhere else. Each send-and-await leg retries twice
//! before the session is abandoned.
//!
//! The transport underneath is anything implementing [`Channel`]:
//! [`UdpChannel`] for real sockets, [`PipeChannel`] for in-memory
//! loopback.

mod err;
pub use err::Error;

mod stp;
pub use stp::{
    Channel, ClientSession, Close, DecodeError, Event, Packet, PacketKind, Phase, PipeChannel,
    ServerSession, UdpChannel, DEFAULT_REPLY_TIMEOUT, MIN_FRAME_LEN,
};
