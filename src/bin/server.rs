use hdstp::{Event, ServerSession, UdpChannel};

fn main() {
    env_logger::init();

    let chan = UdpChannel::bind("127.0.0.1:9090").unwrap();

    println!(">>> Waiting for a session...");
    let mut session = ServerSession::accept(chan, rand::thread_rng()).unwrap();
    println!(">>> Session established");

    loop {
        match session.recv().unwrap() {
            Event::Chunk(chunk) => {
                println!(">>> Read: {:?}", String::from_utf8_lossy(&chunk));
            }
            Event::ChecksumMismatch { expected, received } => {
                println!(
                    ">>> Checksum mismatch (ours {expected:#010x}, theirs {received:#010x}), restarting"
                );
            }
            Event::EndOfStream => {
                println!(">>> Stream ended cleanly");
                break;
            }
        }
    }
}
