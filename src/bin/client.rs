use std::env;

use hdstp::{ClientSession, Close, UdpChannel};

fn main() {
    env_logger::init();

    let chan = UdpChannel::connect("127.0.0.1:9090").unwrap();

    println!(">>> Opening session...");
    let mut session = ClientSession::open(chan, rand::thread_rng()).unwrap();
    println!(">>> Session established");

    let chunks: Vec<String> = if env::args().len() > 1 {
        env::args().skip(1).collect()
    } else {
        vec!["HI".to_string()]
    };

    for chunk in &chunks {
        session.send(chunk.as_bytes()).unwrap();
        println!(">>> Sent: {:?}", chunk);
    }

    match session.close().unwrap() {
        Close::Completed => println!(">>> Closed, checksum confirmed"),
        Close::RestartRequired { bytes_sent } => {
            println!(">>> Reset after {bytes_sent} bytes, replaying...");

            for chunk in &chunks {
                session.send(chunk.as_bytes()).unwrap();
            }
            session.close().unwrap();
        }
    }
}
