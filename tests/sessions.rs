use std::thread;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use hdstp::{
    Channel, ClientSession, Close, Error, Event, Packet, PacketKind, PipeChannel, ServerSession,
    UdpChannel,
};

const TIMEOUT: Duration = Duration::from_millis(50);

/// Applies a scripted fault to every frame sent through it; the
/// receiving direction is untouched.
struct Faulty<C> {
    inner: C,
    fault: Box<dyn FnMut(Vec<u8>) -> Option<Vec<u8>> + Send>,
}

impl<C: Channel> Channel for Faulty<C> {
    fn send(&mut self, frame: &[u8]) -> std::io::Result<()> {
        match (self.fault)(frame.to_vec()) {
            Some(frame) => self.inner.send(&frame),
            None => Ok(()),
        }
    }

    fn recv(&mut self, timeout: Duration) -> std::io::Result<Option<Vec<u8>>> {
        self.inner.recv(timeout)
    }
}

fn kind_of(frame: &[u8]) -> u8 {
    frame[4]
}

fn refresh_parity(frame: &mut [u8]) {
    let last = frame.len() - 1;
    let ones: u32 = frame[..last].iter().map(|b| b.count_ones()).sum();
    frame[last] = if ones % 2 == 0 { 0x00 } else { 0x0F };
}

/// Drives a server session until the stream ends and returns every
/// event it produced.
fn run_server<C: Channel + Send + 'static>(chan: C, seed: u64) -> thread::JoinHandle<Vec<Event>> {
    thread::spawn(move || {
        let mut session =
            ServerSession::accept_with(chan, StdRng::seed_from_u64(seed), TIMEOUT).unwrap();

        let mut events = Vec::new();
        loop {
            let event = session.recv().unwrap();
            let done = event == Event::EndOfStream;
            events.push(event);

            if done {
                assert!(matches!(session.recv(), Err(Error::Closed)));
                return events;
            }
        }
    })
}

#[test]
fn one_chunk_end_to_end() {
    let (c, s) = PipeChannel::pair();
    let server = run_server(s, 1);

    let mut session = ClientSession::open_with(c, StdRng::seed_from_u64(2), TIMEOUT).unwrap();
    session.send(b"HI").unwrap();
    assert_eq!(session.bytes_sent(), 2);
    assert_eq!(session.close().unwrap(), Close::Completed);
    assert!(matches!(session.send(b"more"), Err(Error::Closed)));

    assert_eq!(server.join().unwrap(), vec![
        Event::Chunk(b"HI".to_vec()),
        Event::EndOfStream,
    ]);
}

#[test]
fn chunks_arrive_in_submission_order() {
    let (c, s) = PipeChannel::pair();
    let server = run_server(s, 3);

    let mut session = ClientSession::open_with(c, StdRng::seed_from_u64(4), TIMEOUT).unwrap();
    for chunk in [&b"lock"[..], b"step", b"and", b"wait"] {
        session.send(chunk).unwrap();
    }
    assert_eq!(session.close().unwrap(), Close::Completed);

    assert_eq!(server.join().unwrap(), vec![
        Event::Chunk(b"lock".to_vec()),
        Event::Chunk(b"step".to_vec()),
        Event::Chunk(b"and".to_vec()),
        Event::Chunk(b"wait".to_vec()),
        Event::EndOfStream,
    ]);
}

#[test]
fn damaged_chunk_is_nakd_and_retransmitted() {
    let (c, s) = PipeChannel::pair();
    let server = run_server(s, 5);

    let mut corrupted = false;
    let c = Faulty {
        inner: c,
        fault: Box::new(move |mut frame| {
            if !corrupted && kind_of(&frame) == PacketKind::Data.to_wire() {
                corrupted = true;
                let last = frame.len() - 1;
                frame[last] ^= 0x01;
            }
            Some(frame)
        }),
    };

    let mut session = ClientSession::open_with(c, StdRng::seed_from_u64(6), TIMEOUT).unwrap();
    session.send(b"HI").unwrap();
    assert_eq!(session.close().unwrap(), Close::Completed);

    // The damaged copy was NAK'd, the RETRANSMIT delivered; one chunk.
    assert_eq!(server.join().unwrap(), vec![
        Event::Chunk(b"HI".to_vec()),
        Event::EndOfStream,
    ]);
}

#[test]
fn lost_syn_ack_is_answered_again() {
    let (c, s) = PipeChannel::pair();

    let mut dropped = false;
    let s = Faulty {
        inner: s,
        fault: Box::new(move |frame| {
            if !dropped && kind_of(&frame) == PacketKind::SynAck.to_wire() {
                dropped = true;
                return None;
            }
            Some(frame)
        }),
    };
    let server = run_server(s, 7);

    let mut session = ClientSession::open_with(c, StdRng::seed_from_u64(8), TIMEOUT).unwrap();
    session.send(b"HI").unwrap();
    assert_eq!(session.close().unwrap(), Close::Completed);

    assert_eq!(server.join().unwrap(), vec![
        Event::Chunk(b"HI".to_vec()),
        Event::EndOfStream,
    ]);
}

#[test]
fn lost_handshake_ack_is_repeated_during_the_first_data_leg() {
    let (c, s) = PipeChannel::pair();
    let server = run_server(s, 9);

    // The first ACK the client ever sends is the handshake ACK.
    let mut dropped = false;
    let c = Faulty {
        inner: c,
        fault: Box::new(move |frame| {
            if !dropped && kind_of(&frame) == PacketKind::Ack.to_wire() {
                dropped = true;
                return None;
            }
            Some(frame)
        }),
    };

    let mut session = ClientSession::open_with(c, StdRng::seed_from_u64(10), TIMEOUT).unwrap();
    session.send(b"HI").unwrap();
    assert_eq!(session.close().unwrap(), Close::Completed);

    // The server answered its retransmitted SYN-ACK with a repeated
    // handshake ACK and still delivered the chunk exactly once.
    assert_eq!(server.join().unwrap(), vec![
        Event::Chunk(b"HI".to_vec()),
        Event::EndOfStream,
    ]);
}

#[test]
fn checksum_mismatch_resets_and_restarts_the_session() {
    let (c, s) = PipeChannel::pair();
    let server = run_server(s, 11);

    // Damage one bit of the first FIN's checksum payload, keeping the
    // parity byte consistent so only the CRC comparison can object.
    let mut corrupted = false;
    let c = Faulty {
        inner: c,
        fault: Box::new(move |mut frame| {
            if !corrupted && kind_of(&frame) == PacketKind::Fin.to_wire() {
                corrupted = true;
                frame[9] ^= 0x01;
                refresh_parity(&mut frame);
            }
            Some(frame)
        }),
    };

    let mut session = ClientSession::open_with(c, StdRng::seed_from_u64(12), TIMEOUT).unwrap();
    session.send(b"HI").unwrap();

    assert_eq!(
        session.close().unwrap(),
        Close::RestartRequired { bytes_sent: 2 }
    );

    // The session is established again; replay and close for real.
    session.send(b"HI").unwrap();
    assert_eq!(session.close().unwrap(), Close::Completed);

    assert_eq!(server.join().unwrap(), vec![
        Event::Chunk(b"HI".to_vec()),
        Event::ChecksumMismatch {
            expected: 0x0D4A_1185,
            received: 0x0C4A_1185,
        },
        Event::Chunk(b"HI".to_vec()),
        Event::EndOfStream,
    ]);
}

#[test]
fn handshake_gives_up_after_three_syns() {
    let (c, _s) = PipeChannel::pair();

    let c = Faulty {
        inner: c,
        fault: Box::new(|_| None),
    };

    let err = ClientSession::open_with(
        c,
        StdRng::seed_from_u64(13),
        Duration::from_millis(10),
    )
    .unwrap_err();

    assert!(matches!(err, Error::HandshakeFailed { attempts: 3 }));
}

#[test]
fn data_leg_gives_up_after_three_mixed_failures() {
    let (c, mut s) = PipeChannel::pair();
    let long = Duration::from_millis(500);

    // A hand-driven peer: complete the handshake, NAK the first chunk,
    // then go silent and let the client's timeouts do the rest.
    let puppet = thread::spawn(move || {
        let syn = Packet::decode(&s.recv(long).unwrap().unwrap()).unwrap();
        assert_eq!(syn.kind, PacketKind::Syn);
        s.send(&Packet::syn_ack(100, syn.seq_no).encode()).unwrap();

        let ack = Packet::decode(&s.recv(long).unwrap().unwrap()).unwrap();
        assert_eq!(ack.kind, PacketKind::Ack);
        assert_eq!(ack.payload_scalar(), Some(101));

        let data = Packet::decode(&s.recv(long).unwrap().unwrap()).unwrap();
        assert_eq!(data.kind, PacketKind::Data);
        s.send(&Packet::nak(101).encode()).unwrap();

        // One NAK plus two timeouts exhaust the leg; everything the
        // client puts on the wire meanwhile is a RETRANSMIT.
        let mut resends = 0;
        while let Ok(Some(frame)) = s.recv(Duration::from_millis(200)) {
            assert_eq!(
                Packet::decode(&frame).unwrap().kind,
                PacketKind::Retransmit
            );
            resends += 1;
        }
        resends
    });

    let mut session = ClientSession::open_with(c, StdRng::seed_from_u64(14), TIMEOUT).unwrap();
    let err = session.send(b"HI").unwrap_err();

    assert!(matches!(err, Error::Abandoned { attempts: 3 }));
    assert!(matches!(session.send(b"HI"), Err(Error::Closed)));
    assert_eq!(puppet.join().unwrap(), 2);
}

#[test]
fn udp_sessions_complete_end_to_end() {
    let server_chan = UdpChannel::bind("127.0.0.1:0").unwrap();
    let addr = server_chan.local_addr().unwrap();
    let server = run_server(server_chan, 15);

    let chan = UdpChannel::connect(addr).unwrap();
    let mut session = ClientSession::open_with(chan, StdRng::seed_from_u64(16), TIMEOUT).unwrap();
    session.send(b"over the wire").unwrap();
    assert_eq!(session.close().unwrap(), Close::Completed);

    assert_eq!(server.join().unwrap(), vec![
        Event::Chunk(b"over the wire".to_vec()),
        Event::EndOfStream,
    ]);
}
