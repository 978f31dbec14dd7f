//! Integration tests for the in-memory transport across threads.

use std::io::{ErrorKind, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use minibridge_core::memconn::{DEFAULT_BUFFER_SIZE, Listener};

#[test]
fn test_transfer_larger_than_buffer_is_ordered() {
    let listener = Listener::new();
    let server = {
        let listener = listener.clone();
        thread::spawn(move || {
            let mut conn = listener.accept().unwrap();
            let mut received = Vec::new();
            conn.read_to_end(&mut received).unwrap();
            received
        })
    };

    let payload: Vec<u8> = (0..DEFAULT_BUFFER_SIZE * 5).map(|i| (i % 251) as u8).collect();
    let mut client = listener.dial("client").unwrap();
    for chunk in payload.chunks(1000) {
        client.write_all(chunk).unwrap();
    }
    client.close();

    assert_eq!(server.join().unwrap(), payload);
}

#[test]
fn test_echo_over_accepted_connection() {
    let listener = Listener::new();
    let server = {
        let listener = listener.clone();
        thread::spawn(move || {
            let mut conn = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = conn.read(&mut buf).unwrap();
            conn.write_all(&buf[..n]).unwrap();
        })
    };

    let mut client = listener.dial("client").unwrap();
    client.write_all(b"hello").unwrap();
    let mut buf = [0u8; 5];
    client.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"hello");
    server.join().unwrap();
}

#[test]
fn test_read_deadline_keeps_connection_usable() {
    let listener = Listener::new();
    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || listener.accept().unwrap())
    };
    let mut client = listener.dial("client").unwrap();
    let mut server = acceptor.join().unwrap();

    server
        .set_read_deadline(Some(Instant::now() + Duration::from_millis(50)))
        .unwrap();
    let mut buf = [0u8; 4];
    let err = server.read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TimedOut);
    assert!(!server.is_closed());

    server.set_read_deadline(None).unwrap();
    client.write_all(b"ping").unwrap();
    server.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn test_close_unblocks_peer_on_other_thread() {
    let listener = Listener::new();
    let acceptor = {
        let listener = listener.clone();
        thread::spawn(move || listener.accept().unwrap())
    };
    let client = listener.dial("client").unwrap();
    let mut server = acceptor.join().unwrap();

    let reader = thread::spawn(move || {
        let mut buf = [0u8; 8];
        server.read(&mut buf).unwrap()
    });

    thread::sleep(Duration::from_millis(20));
    client.close();
    assert_eq!(reader.join().unwrap(), 0);
}
