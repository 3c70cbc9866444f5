use std::fmt;
use std::mem;
use std::time::Duration;

use crc::Digest;
use log::{debug, warn};
use rand::Rng;

use super::chan::Channel;
use super::packet::{Packet, PacketKind, CRC32};
use super::retry::{exchange, Reaction};
use super::{Phase, DEFAULT_REPLY_TIMEOUT};
use crate::Error;

/// Outcome of a graceful close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Close {
    /// The FIN exchange completed and the peer's checksum matched.
    Completed,
    /// The peer reset the session over a checksum mismatch. The
    /// handshake has already been re-run and the session is established
    /// again; `bytes_sent` is how much this side believes it delivered
    /// before the reset. Whether to replay it is the caller's decision.
    RestartRequired { bytes_sent: u64 },
}

/// The initiating endpoint. Data flows strictly from here to the peer,
/// one acknowledged chunk at a time.
pub struct ClientSession<C: Channel, R: Rng> {
    chan: C,
    rng: R,
    timeout: Duration,
    phase: Phase,
    cisn: u32,
    sisn: u32,
    seq_no: u32,
    crc: Digest<'static, u32>,
    first_data_sent: bool,
    bytes_sent: u64,
}

impl<C: Channel, R: Rng> fmt::Debug for ClientSession<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("timeout", &self.timeout)
            .field("phase", &self.phase)
            .field("cisn", &self.cisn)
            .field("sisn", &self.sisn)
            .field("seq_no", &self.seq_no)
            .field("first_data_sent", &self.first_data_sent)
            .field("bytes_sent", &self.bytes_sent)
            .finish()
    }
}

impl<C: Channel, R: Rng> ClientSession<C, R> {
    /// Open a session over `chan` with the default reply timeout.
    pub fn open(chan: C, rng: R) -> Result<ClientSession<C, R>, Error> {
        Self::open_with(chan, rng, DEFAULT_REPLY_TIMEOUT)
    }

    pub fn open_with(
        chan: C,
        rng: R,
        timeout: Duration,
    ) -> Result<ClientSession<C, R>, Error> {
        let mut session = ClientSession {
            chan,
            rng,
            timeout,
            phase: Phase::Closed,
            cisn: 0,
            sisn: 0,
            seq_no: 0,
            crc: CRC32.digest(),
            first_data_sent: false,
            bytes_sent: 0,
        };

        session.handshake().map_err(|e| match e {
            Error::Abandoned { attempts } => Error::HandshakeFailed { attempts },
            other => other,
        })?;

        Ok(session)
    }

    fn handshake(&mut self) -> Result<(), Error> {
        self.cisn = self.rng.gen();
        self.crc = CRC32.digest();
        self.first_data_sent = false;
        self.bytes_sent = 0;

        self.phase = Phase::SynSent;
        debug!("state <- SynSent (cisn={:#010x})", self.cisn);

        let syn = Packet::syn(self.cisn).encode();
        let cisn = self.cisn;

        /*
        Only a SYN-ACK whose payload acknowledges our ISN moves the
        handshake forward. Anything else merely elapses the wait.
        */
        let syn_ack = exchange(&mut self.chan, self.timeout, Some(&syn), None, |reply| {
            match reply {
                Ok(pkt)
                    if pkt.kind == PacketKind::SynAck
                        && pkt.payload_scalar() == Some(cisn.wrapping_add(1)) =>
                {
                    Reaction::Accept
                }
                _ => Reaction::Ignore,
            }
        })?;

        self.sisn = syn_ack.seq_no;
        self.seq_no = self.cisn.wrapping_add(1);

        /*
        The ACK completing the handshake is not itself acknowledged; the
        server confirms it implicitly by accepting the first DATA. If it
        is lost, the server keeps retransmitting its SYN-ACK and each
        copy is answered again during the first data leg.
        */
        self.chan
            .send(&Packet::handshake_ack(self.cisn, self.sisn).encode())?;
        self.seq_no = self.seq_no.wrapping_add(1);

        self.phase = Phase::Established;
        debug!("state <- Established (sisn={:#010x})", self.sisn);

        Ok(())
    }

    /// Transfer one chunk. Blocks until the peer acknowledges it, and
    /// gives up after three failures (timeouts and NAKs combined).
    pub fn send(&mut self, chunk: &[u8]) -> Result<(), Error> {
        if self.phase != Phase::Established {
            return Err(Error::Closed);
        }

        match self.send_chunk(chunk) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.phase = Phase::Closed;
                Err(e)
            }
        }
    }

    fn send_chunk(&mut self, chunk: &[u8]) -> Result<(), Error> {
        let data = Packet::data(self.seq_no, chunk).encode();
        let retrans = Packet::retransmit(self.seq_no, chunk).encode();
        self.seq_no = self.seq_no.wrapping_add(1);

        let handshake_ack = Packet::handshake_ack(self.cisn, self.sisn).encode();
        let first_data_sent = self.first_data_sent;
        let cisn = self.cisn;

        /*
        Stop-and-wait: the chunk is alone on the wire until the server
        acknowledges it. A NAK means the frame arrived damaged; it and a
        timeout both charge the same counter and put the RETRANSMIT
        variant on the wire. A retransmitted SYN-ACK showing up before
        our first chunk was ever acknowledged means the handshake ACK
        was lost, so it is answered again, free of charge.
        */
        exchange(
            &mut self.chan,
            self.timeout,
            Some(&data),
            Some(&retrans),
            |reply| match reply {
                Ok(pkt) => match pkt.kind {
                    PacketKind::Ack => Reaction::Accept,
                    PacketKind::Nak => {
                        warn!("chunk arrived damaged, retransmitting");
                        Reaction::Fail(None)
                    }
                    PacketKind::SynAck
                        if !first_data_sent
                            && pkt.payload_scalar() == Some(cisn.wrapping_add(1)) =>
                    {
                        debug!("SYN-ACK seen again, repeating the handshake ACK");
                        Reaction::Reply(handshake_ack.clone())
                    }
                    _ => Reaction::Ignore,
                },
                Err(_) => Reaction::Ignore,
            },
        )?;

        self.crc.update(chunk);
        self.bytes_sent += chunk.len() as u64;
        self.first_data_sent = true;

        Ok(())
    }

    /// Terminate the session gracefully, submitting the running
    /// checksum for the peer to audit.
    pub fn close(&mut self) -> Result<Close, Error> {
        if self.phase != Phase::Established {
            return Err(Error::Closed);
        }

        match self.close_session() {
            Ok(close) => Ok(close),
            Err(e) => {
                self.phase = Phase::Closed;
                Err(e)
            }
        }
    }

    fn close_session(&mut self) -> Result<Close, Error> {
        let crc = mem::replace(&mut self.crc, CRC32.digest()).finalize();
        let fin = Packet::fin(self.seq_no, crc).encode();
        self.seq_no = self.seq_no.wrapping_add(1);

        self.phase = Phase::FinSent;
        debug!("state <- FinSent (crc={crc:#010x})");

        /*
        The first termination leg normally ends with the server's ACK.
        Two shortcuts are possible: the server's FIN arriving here means
        that ACK was lost, and an RST here means the checksum comparison
        already failed.
        */
        let reply = exchange(&mut self.chan, self.timeout, Some(&fin), None, |reply| {
            match reply {
                Ok(pkt)
                    if matches!(
                        pkt.kind,
                        PacketKind::Ack | PacketKind::Fin | PacketKind::Rst
                    ) =>
                {
                    Reaction::Accept
                }
                _ => Reaction::Ignore,
            }
        })?;

        let fin_or_rst = if reply.kind == PacketKind::Ack {
            self.phase = Phase::FinWait;
            debug!("state <- FinWait");

            /*
            Nothing of ours is outstanding any more, so there is nothing
            to retransmit while waiting for the server's FIN or RST;
            timeouts only run the counter down.
            */
            exchange(&mut self.chan, self.timeout, None, None, |reply| {
                match reply {
                    Ok(pkt) if matches!(pkt.kind, PacketKind::Fin | PacketKind::Rst) => {
                        Reaction::Accept
                    }
                    _ => Reaction::Ignore,
                }
            })?
        } else {
            reply
        };

        if fin_or_rst.kind == PacketKind::Fin {
            // Fire and forget: the server re-sends its FIN if this gets
            // lost, and every copy earns the same answer.
            self.chan.send(&Packet::ack(self.seq_no).encode())?;
            self.seq_no = self.seq_no.wrapping_add(1);

            self.phase = Phase::ClosedOk;
            debug!("state <- ClosedOk");

            Ok(Close::Completed)
        } else {
            let bytes_sent = self.bytes_sent;
            warn!(
                "peer reset the session over a checksum mismatch \
                 ({bytes_sent} bytes believed delivered); restarting"
            );

            self.handshake()?;

            Ok(Close::RestartRequired { bytes_sent })
        }
    }

    /// Bytes acknowledged by the peer since the session (or its latest
    /// restart) was established.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }
}
