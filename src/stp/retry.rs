use std::time::{Duration, Instant};

use log::{trace, warn};

use super::chan::Channel;
use super::packet::{DecodeError, Packet};
use crate::Error;

/// A leg gives up after this many failed attempts: the initial
/// transmission plus two retries.
pub(crate) const MAX_TRIES: u32 = 3;

/// What the calling state machine wants done with a frame that arrived
/// while a leg was waiting.
pub(crate) enum Reaction {
    /// The reply the leg was waiting for; hand it back.
    Accept,
    /// Not meaningful here. Keep waiting; the timeout window keeps
    /// running.
    Ignore,
    /// Answer with this frame and keep waiting. Not charged as a
    /// failure.
    Reply(Vec<u8>),
    /// Charge one failure and retransmit. A frame given here replaces
    /// the retransmitted frame from now on.
    Fail(Option<Vec<u8>>),
}

/// One send-and-await leg of the protocol.
///
/// `first` is transmitted before the wait begins; `retrans` is what a
/// charged failure puts back on the wire (falling back to `first`, so
/// control packets are byte-identical on retry). Which replies are
/// acceptable, which are ignored, and which count against the leg is
/// entirely the caller's call via `classify`. Three charged failures,
/// timeouts and rejections combined, end the leg.
pub(crate) fn exchange<C: Channel>(
    chan: &mut C,
    timeout: Duration,
    first: Option<&[u8]>,
    retrans: Option<&[u8]>,
    mut classify: impl FnMut(Result<&Packet, &DecodeError>) -> Reaction,
) -> Result<Packet, Error> {
    let mut pending: Option<Vec<u8>> = retrans.or(first).map(<[u8]>::to_vec);
    let mut failures = 0;

    if let Some(frame) = first {
        chan.send(frame)?;
    }

    let mut deadline = Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let frame = if remaining.is_zero() {
            None
        } else {
            chan.recv(remaining)?
        };

        let Some(frame) = frame else {
            trace!("leg timed out");
            charge(chan, &mut failures, &mut pending, None)?;
            deadline = Instant::now() + timeout;
            continue;
        };

        match Packet::decode(&frame) {
            Ok(pkt) => match classify(Ok(&pkt)) {
                Reaction::Accept => {
                    trace!("accepted {:?} (seq {})", pkt.kind, pkt.seq_no);
                    return Ok(pkt);
                }
                Reaction::Ignore => {
                    trace!("ignoring {:?} (seq {})", pkt.kind, pkt.seq_no);
                }
                Reaction::Reply(f) => {
                    chan.send(&f)?;
                }
                Reaction::Fail(swap) => {
                    charge(chan, &mut failures, &mut pending, swap)?;
                    deadline = Instant::now() + timeout;
                }
            },
            Err(err) => match classify(Err(&err)) {
                // An undecodable frame can at most be charged (the
                // server answers parity failures with a NAK); it can
                // never be the reply a leg was waiting for.
                Reaction::Fail(swap) => {
                    charge(chan, &mut failures, &mut pending, swap)?;
                    deadline = Instant::now() + timeout;
                }
                _ => trace!("dropping undecodable frame: {err}"),
            },
        }
    }
}

fn charge<C: Channel>(
    chan: &mut C,
    failures: &mut u32,
    pending: &mut Option<Vec<u8>>,
    swap: Option<Vec<u8>>,
) -> Result<(), Error> {
    *failures += 1;
    if *failures >= MAX_TRIES {
        warn!("leg gave up after {} attempts", *failures);
        return Err(Error::Abandoned {
            attempts: *failures,
        });
    }

    if let Some(f) = swap {
        *pending = Some(f);
    }
    if let Some(f) = pending.as_deref() {
        trace!("retransmitting {} byte frame", f.len());
        chan.send(f)?;
    }

    Ok(())
}
