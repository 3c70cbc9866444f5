use std::fmt;
use std::mem;
use std::time::Duration;

use crc::Digest;
use log::{debug, trace, warn};
use rand::Rng;

use super::chan::Channel;
use super::packet::{DecodeError, Packet, PacketKind, CRC32};
use super::retry::{exchange, Reaction};
use super::{Phase, DEFAULT_REPLY_TIMEOUT};
use crate::Error;

/// What one call to [`ServerSession::recv`] produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// One chunk, delivered in submission order.
    Chunk(Vec<u8>),
    /// The peer closed and its checksum matched ours.
    EndOfStream,
    /// The peer's FIN checksum disagreed with ours. The reset exchange
    /// has already run; the next `recv` re-enters the handshake.
    ChecksumMismatch { expected: u32, received: u32 },
}

/// The passive endpoint. Accepts one session, hands chunks up one at a
/// time, and audits the peer's checksum at termination.
pub struct ServerSession<C: Channel, R: Rng> {
    chan: C,
    rng: R,
    timeout: Duration,
    phase: Phase,
    cisn: u32,
    sisn: u32,
    seq_no: u32,
    crc: Digest<'static, u32>,
    /// Retransmitted when the line goes quiet mid-transfer.
    last_ctrl: Option<Vec<u8>>,
    /// A SYN that arrived in answer to our RST; consumed by the next
    /// handshake instead of waiting for a fresh one.
    pending_syn: Option<Packet>,
}

impl<C: Channel, R: Rng> fmt::Debug for ServerSession<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSession")
            .field("timeout", &self.timeout)
            .field("phase", &self.phase)
            .field("cisn", &self.cisn)
            .field("sisn", &self.sisn)
            .field("seq_no", &self.seq_no)
            .field("last_ctrl", &self.last_ctrl)
            .field("pending_syn", &self.pending_syn)
            .finish()
    }
}

impl<C: Channel, R: Rng> ServerSession<C, R> {
    /// Block until an initiator opens a session over `chan`, with the
    /// default reply timeout.
    pub fn accept(chan: C, rng: R) -> Result<ServerSession<C, R>, Error> {
        Self::accept_with(chan, rng, DEFAULT_REPLY_TIMEOUT)
    }

    pub fn accept_with(
        chan: C,
        rng: R,
        timeout: Duration,
    ) -> Result<ServerSession<C, R>, Error> {
        let mut session = ServerSession {
            chan,
            rng,
            timeout,
            phase: Phase::Closed,
            cisn: 0,
            sisn: 0,
            seq_no: 0,
            crc: CRC32.digest(),
            last_ctrl: None,
            pending_syn: None,
        };

        let syn = session.await_syn(false)?;
        session.handshake(&syn).map_err(|e| match e {
            Error::Abandoned { attempts } => Error::HandshakeFailed { attempts },
            other => other,
        })?;

        Ok(session)
    }

    /*
    Passive open: there is nothing to say until the initiator speaks.
    The initial wait is unbounded; the wait after a reset is bounded so
    a peer that gave up cannot pin us here forever.
    */
    fn await_syn(&mut self, bounded: bool) -> Result<Packet, Error> {
        if bounded {
            return exchange(&mut self.chan, self.timeout, None, None, |reply| {
                match reply {
                    Ok(pkt) if pkt.kind == PacketKind::Syn => Reaction::Accept,
                    _ => Reaction::Ignore,
                }
            });
        }

        loop {
            let Some(frame) = self.chan.recv(self.timeout)? else {
                continue;
            };

            match Packet::decode(&frame) {
                Ok(pkt) if pkt.kind == PacketKind::Syn => return Ok(pkt),
                Ok(pkt) => trace!("ignoring {:?} while closed", pkt.kind),
                Err(err) => trace!("dropping undecodable frame while closed: {err}"),
            }
        }
    }

    fn handshake(&mut self, syn: &Packet) -> Result<(), Error> {
        self.cisn = syn.seq_no;
        self.sisn = self.rng.gen();
        self.seq_no = self.sisn;
        self.crc = CRC32.digest();
        self.last_ctrl = None;

        self.phase = Phase::SynReceived;
        debug!(
            "state <- SynReceived (cisn={:#010x}, sisn={:#010x})",
            self.cisn, self.sisn
        );

        let syn_ack = Packet::syn_ack(self.sisn, self.cisn).encode();
        self.seq_no = self.seq_no.wrapping_add(1);

        let sisn = self.sisn;
        let cisn = self.cisn;
        let again = syn_ack.clone();

        /*
        Await the ACK of our SYN-ACK. A duplicate SYN means the client
        never saw the SYN-ACK, so it is answered once more without
        charging a retry. The client's first DATA can show up here too,
        when its ACK was lost; it is deliberately left alone: our
        timeout resends the SYN-ACK and the client answers with the ACK
        this leg is waiting for.
        */
        exchange(&mut self.chan, self.timeout, Some(&syn_ack), None, |reply| {
            match reply {
                Ok(pkt)
                    if pkt.kind == PacketKind::Ack
                        && pkt.payload_scalar() == Some(sisn.wrapping_add(1)) =>
                {
                    Reaction::Accept
                }
                Ok(pkt) if pkt.kind == PacketKind::Syn && pkt.seq_no == cisn => {
                    Reaction::Reply(again.clone())
                }
                _ => Reaction::Ignore,
            }
        })?;

        self.phase = Phase::Established;
        debug!("state <- Established");

        Ok(())
    }

    /// Wait for the next thing the peer does: a chunk, a clean end of
    /// stream, or a checksum mismatch.
    pub fn recv(&mut self) -> Result<Event, Error> {
        if self.phase == Phase::ClosedOk {
            return Err(Error::Closed);
        }

        match self.next_event() {
            Ok(event) => Ok(event),
            Err(e) => {
                self.phase = Phase::ClosedOk;
                Err(e)
            }
        }
    }

    fn next_event(&mut self) -> Result<Event, Error> {
        if self.phase == Phase::Closed {
            /*
            A reset ended the previous incarnation. Pick up the SYN that
            answered the RST, or wait (bounded) for a fresh one, and run
            the handshake again before more data can flow.
            */
            let syn = match self.pending_syn.take() {
                Some(syn) => syn,
                None => self.await_syn(true)?,
            };
            self.handshake(&syn)?;
        }

        /*
        The lock-step data phase. Whatever control packet we sent last
        is what a timeout puts back on the wire; a damaged frame is
        answered with a NAK, which then takes that role; stray control
        packets are ignored without an answer.
        */
        let nak = Packet::nak(self.seq_no).encode();
        let last_ctrl = self.last_ctrl.clone();

        let pkt = exchange(
            &mut self.chan,
            self.timeout,
            None,
            last_ctrl.as_deref(),
            |reply| match reply {
                Ok(pkt) => match pkt.kind {
                    PacketKind::Data | PacketKind::Retransmit | PacketKind::Fin => {
                        Reaction::Accept
                    }
                    _ => Reaction::Ignore,
                },
                Err(DecodeError::Parity) => {
                    warn!("frame arrived damaged, answering with NAK");
                    Reaction::Fail(Some(nak.clone()))
                }
                Err(_) => Reaction::Ignore,
            },
        )?;

        match pkt.kind {
            PacketKind::Data | PacketKind::Retransmit => {
                self.crc.update(&pkt.payload);

                let ack = Packet::ack(self.seq_no).encode();
                self.seq_no = self.seq_no.wrapping_add(1);
                self.chan.send(&ack)?;
                self.last_ctrl = Some(ack);

                trace!("delivering {} byte chunk", pkt.payload.len());
                Ok(Event::Chunk(pkt.payload))
            }
            _ => self.terminate(&pkt),
        }
    }

    fn terminate(&mut self, fin: &Packet) -> Result<Event, Error> {
        let expected = mem::replace(&mut self.crc, CRC32.digest()).finalize();
        let received = fin.payload_scalar();
        self.last_ctrl = None;

        if received == Some(expected) {
            self.phase = Phase::Closing;
            debug!("state <- Closing (crc={expected:#010x})");

            /*
            Checksums agree: acknowledge the FIN, send our own, and wait
            for it to be acknowledged in turn. A duplicate of the
            client's FIN means our ACK was lost; it is answered again
            without charging a retry.
            */
            let ack = Packet::ack(self.seq_no).encode();
            self.seq_no = self.seq_no.wrapping_add(1);
            self.chan.send(&ack)?;

            let our_fin = Packet::fin(self.seq_no, expected).encode();
            self.seq_no = self.seq_no.wrapping_add(1);

            let again = ack.clone();
            exchange(&mut self.chan, self.timeout, Some(&our_fin), None, |reply| {
                match reply {
                    Ok(pkt) if pkt.kind == PacketKind::Ack => Reaction::Accept,
                    Ok(pkt) if pkt.kind == PacketKind::Fin => Reaction::Reply(again.clone()),
                    _ => Reaction::Ignore,
                }
            })?;

            self.phase = Phase::ClosedOk;
            debug!("state <- ClosedOk");

            Ok(Event::EndOfStream)
        } else {
            let received = received.unwrap_or(0);
            warn!(
                "checksum mismatch: expected {expected:#010x}, \
                 received {received:#010x}; resetting"
            );

            let rst = Packet::rst(self.seq_no).encode();
            self.seq_no = self.seq_no.wrapping_add(1);

            /*
            The reset is answered either by an ACK (the client is giving
            up) or by a fresh SYN (the client is restarting). A
            duplicate FIN means the RST itself was lost.
            */
            let reply = exchange(&mut self.chan, self.timeout, Some(&rst), None, |reply| {
                match reply {
                    Ok(pkt) if matches!(pkt.kind, PacketKind::Ack | PacketKind::Syn) => {
                        Reaction::Accept
                    }
                    Ok(pkt) if pkt.kind == PacketKind::Fin => Reaction::Fail(None),
                    _ => Reaction::Ignore,
                }
            })?;

            self.phase = Phase::Closed;
            debug!("state <- Closed (awaiting restart)");

            if reply.kind == PacketKind::Syn {
                self.pending_syn = Some(reply);
            }

            Ok(Event::ChecksumMismatch { expected, received })
        }
    }
}
