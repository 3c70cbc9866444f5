use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use log::trace;

const MAX_DATAGRAM: usize = 65535;

/// An unreliable, point-to-point datagram channel. Frames may be lost
/// or arrive damaged; duplicates are tolerated by the state machines
/// on top.
pub trait Channel {
    /// Queue one frame toward the peer. Delivery is not guaranteed.
    fn send(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Wait up to `timeout` for the next frame. `Ok(None)` means the
    /// wait timed out; an error means the transport itself is broken.
    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>>;
}

/// UDP-backed channel. The initiator names its peer up front; the
/// responder locks onto the source of the first datagram it sees and
/// drops everything from other sources afterwards.
#[derive(Debug)]
pub struct UdpChannel {
    sock: UdpSocket,
    peer: Option<SocketAddr>,
}

impl UdpChannel {
    pub fn connect(peer: impl ToSocketAddrs) -> io::Result<UdpChannel> {
        let peer = peer
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no peer address"))?;
        let sock = UdpSocket::bind(("0.0.0.0", 0))?;

        Ok(UdpChannel {
            sock,
            peer: Some(peer),
        })
    }

    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<UdpChannel> {
        Ok(UdpChannel {
            sock: UdpSocket::bind(addr)?,
            peer: None,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.local_addr()
    }
}

impl Channel for UdpChannel {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        let Some(peer) = self.peer else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no peer locked in yet",
            ));
        };

        self.sock.send_to(frame, peer)?;

        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; MAX_DATAGRAM];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.sock.set_read_timeout(Some(remaining))?;

            match self.sock.recv_from(&mut buf) {
                Ok((n, src)) => {
                    match self.peer {
                        None => {
                            trace!("locking onto peer {src}");
                            self.peer = Some(src);
                        }
                        Some(peer) if peer != src => {
                            trace!("dropping datagram from foreign source {src}");
                            continue;
                        }
                        Some(_) => {}
                    }

                    return Ok(Some(buf[..n].to_vec()));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// In-memory channel pair. Lossless on its own; tests wrap it to
/// inject loss and corruption.
#[derive(Debug)]
pub struct PipeChannel {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl PipeChannel {
    pub fn pair() -> (PipeChannel, PipeChannel) {
        let (atx, brx) = mpsc::channel();
        let (btx, arx) = mpsc::channel();

        (
            PipeChannel { tx: atx, rx: arx },
            PipeChannel { tx: btx, rx: brx },
        )
    }
}

impl Channel for PipeChannel {
    fn send(&mut self, frame: &[u8]) -> io::Result<()> {
        self.tx
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer endpoint is gone"))
    }

    fn recv(&mut self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer endpoint is gone",
            )),
        }
    }
}
