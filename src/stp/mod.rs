use std::time::Duration;

mod chan;
mod client;
mod packet;
mod retry;
mod server;

pub use chan::{Channel, PipeChannel, UdpChannel};
pub use client::{ClientSession, Close};
pub use packet::{DecodeError, Packet, PacketKind, MIN_FRAME_LEN};
pub use server::{Event, ServerSession};

/*
              client                                 server

            +--------+                             +--------+
            | CLOSED |                             | CLOSED |
            +--------+                             +--------+
       open()    | snd SYN                     rcv SYN | snd SYN-ACK
                 V                                     V
           +----------+                        +--------------+
           | SYN_SENT |                        | SYN_RECEIVED |
           +----------+                        +--------------+
      rcv SYN-ACK| snd ACK                     rcv ACK |
                 V                                     V
          +-------------+      DATA / ACK      +-------------+
          | ESTABLISHED |<-------------------->| ESTABLISHED |
          +-------------+                      +-------------+
       close()   | snd FIN(crc)                rcv FIN | match:    snd ACK, FIN
                 V                                     | mismatch: snd RST
            +----------+                               V
            | FIN_SENT |                          +---------+
            +----------+                          | CLOSING |
         rcv ACK | (rcv RST: restart)             +---------+
                 V                             rcv ACK |
            +----------+                               V
            | FIN_WAIT |                         +-----------+
            +----------+                         | CLOSED_OK |
         rcv FIN | snd ACK                       +-----------+
                 V
           +-----------+
           | CLOSED_OK |
           +-----------+
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    SynSent,
    SynReceived,
    Established,
    FinSent,
    FinWait,
    Closing,
    ClosedOk,
}

/// Per-leg reply timeout. Large enough to dwarf one-way latency on the
/// links this protocol is meant for.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_millis(200);
