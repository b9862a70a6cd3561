//! Channel resource tests: teardown, exclusion and liveness probing.

mod common;

use cachelink::{socket_okay, ChannelResource, ChannelRole, Error, PAGE_SIZE};
use common::{init_tracing, tcp_pair};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn close_is_idempotent() {
    init_tracing();
    let channel = ChannelResource::allocate(ChannelRole::Data).unwrap();

    // Closing an empty channel is fine too
    channel.close();
    assert!(!channel.is_open());

    let (stream, _peer) = tcp_pair();
    channel.attach(stream).unwrap();
    assert!(channel.is_open());

    for _ in 0..3 {
        channel.close();
        assert!(!channel.is_open());
        assert!(channel.lock().stream().is_none());
    }
}

#[test]
fn attach_to_occupied_channel_fails() {
    init_tracing();
    let channel = ChannelResource::allocate(ChannelRole::Meta).unwrap();
    let (first, _first_peer) = tcp_pair();
    let (second, _second_peer) = tcp_pair();

    channel.attach(first).unwrap();
    let err = channel.attach(second).unwrap_err();
    assert!(matches!(err, Error::ChannelOccupied(ChannelRole::Meta)));

    channel.close();
    let (third, _third_peer) = tcp_pair();
    channel.attach(third).unwrap();
}

#[test]
fn buffers_are_page_sized() {
    let channel = ChannelResource::allocate(ChannelRole::Data).unwrap();
    assert_eq!(channel.role(), ChannelRole::Data);
    assert_eq!(channel.lock().send_buf_mut().len(), PAGE_SIZE);
}

#[test]
fn liveness_peek_is_non_destructive() {
    init_tracing();
    let (stream, mut peer) = tcp_pair();
    peer.write_all(b"ping").unwrap();
    thread::sleep(Duration::from_millis(50));

    let mut slot = Some(stream);
    assert!(socket_okay(&mut slot));

    let mut stream = slot.unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ping");
}

#[test]
fn idle_socket_is_alive_and_stays_blocking() {
    init_tracing();
    let (stream, _peer) = tcp_pair();
    let mut slot = Some(stream);
    assert!(socket_okay(&mut slot));

    // A read on the checked socket still waits for its timeout
    let mut stream = slot.unwrap();
    stream.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let start = Instant::now();
    let mut buf = [0u8; 1];
    let err = stream.read(&mut buf).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn check_alive_leaves_served_reader_blocking() {
    init_tracing();
    let channel = Arc::new(ChannelResource::allocate(ChannelRole::Data).unwrap());
    let (stream, mut peer) = tcp_pair();
    channel.attach(stream).unwrap();

    // The reader has no timeout, so it only ever sees data, EOF or a
    // would-block caused by someone flipping the socket's mode
    let served = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || {
            let mut reader = channel.reader().unwrap().unwrap();
            let mut spurious = 0;
            loop {
                match channel.recv(&mut reader) {
                    Ok(Some(bytes)) => return (bytes, spurious),
                    Ok(None) => return (Vec::new(), spurious),
                    Err(err) if err.is_timeout() => spurious += 1,
                    Err(err) => panic!("unexpected error: {err}"),
                }
            }
        })
    };

    let deadline = Instant::now() + Duration::from_millis(300);
    while Instant::now() < deadline {
        assert!(channel.check_alive());
    }
    peer.write_all(b"x").unwrap();

    let (bytes, spurious) = served.join().unwrap();
    assert_eq!(bytes, b"x");
    assert_eq!(spurious, 0);
}

#[test]
fn dead_socket_is_released() {
    init_tracing();
    let (stream, peer) = tcp_pair();
    drop(peer);
    thread::sleep(Duration::from_millis(50));

    let mut slot = Some(stream);
    assert!(!socket_okay(&mut slot));
    assert!(slot.is_none());

    // An empty slot is never alive
    assert!(!socket_okay(&mut slot));
}

#[test]
fn check_alive_releases_dead_channel() {
    init_tracing();
    let channel = ChannelResource::allocate(ChannelRole::Data).unwrap();
    let (stream, peer) = tcp_pair();
    channel.attach(stream).unwrap();
    assert!(channel.check_alive());

    drop(peer);
    thread::sleep(Duration::from_millis(50));
    assert!(!channel.check_alive());
    assert!(!channel.is_open());
}

#[test]
fn send_on_empty_channel_reports_closed() {
    init_tracing();
    let channel = ChannelResource::allocate(ChannelRole::Data).unwrap();
    assert!(!channel.send(b"payload").unwrap());
    assert!(channel.reader().unwrap().is_none());
}

#[test]
fn send_larger_than_a_page() {
    init_tracing();
    let sender = ChannelResource::allocate(ChannelRole::Data).unwrap();
    let receiver = ChannelResource::allocate(ChannelRole::Data).unwrap();
    let (a, b) = tcp_pair();
    sender.attach(a).unwrap();
    receiver.attach(b).unwrap();

    let payload: Vec<u8> = (0..PAGE_SIZE * 2 + 123).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = thread::spawn(move || {
        assert!(sender.send(&payload).unwrap());
        sender
    });

    let mut reader = receiver.reader().unwrap().unwrap();
    let mut received = Vec::new();
    while received.len() < expected.len() {
        let chunk = receiver.recv(&mut reader).unwrap().unwrap();
        assert!(chunk.len() <= PAGE_SIZE);
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, expected);

    let _sender = writer.join().unwrap();
}

#[test]
fn recv_reports_peer_close() {
    init_tracing();
    let channel = ChannelResource::allocate(ChannelRole::Meta).unwrap();
    let (stream, peer) = tcp_pair();
    channel.attach(stream).unwrap();
    drop(peer);

    let mut reader = channel.reader().unwrap().unwrap();
    assert!(channel.recv(&mut reader).unwrap().is_none());
}

#[test]
fn close_ends_blocked_read() {
    init_tracing();
    let channel = Arc::new(ChannelResource::allocate(ChannelRole::Data).unwrap());
    let (stream, _peer) = tcp_pair();
    channel.attach(stream).unwrap();

    let blocked = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || {
            let mut reader = channel.reader().unwrap().unwrap();
            channel.recv(&mut reader)
        })
    };

    thread::sleep(Duration::from_millis(100));
    channel.close();

    let result = blocked.join().unwrap();
    assert!(result.unwrap().is_none());
}

#[test]
fn close_excludes_concurrent_send() {
    init_tracing();
    let channel = Arc::new(ChannelResource::allocate(ChannelRole::Data).unwrap());
    let (stream, mut peer) = tcp_pair();
    channel.attach(stream).unwrap();

    // Keep the peer draining so sends never stall
    let drain = thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match peer.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    let sender = {
        let channel = Arc::clone(&channel);
        thread::spawn(move || {
            let payload = [7u8; 1000];
            let mut results = Vec::new();
            let deadline = Instant::now() + Duration::from_secs(5);
            while Instant::now() < deadline {
                let sent = channel.send(&payload).expect("send must not see a half-closed socket");
                results.push(sent);
                if results.iter().filter(|sent| !**sent).count() >= 10 {
                    break;
                }
            }
            results
        })
    };

    thread::sleep(Duration::from_millis(50));
    channel.close();

    let results = sender.join().unwrap();
    drain.join().unwrap();

    // Every send before the close went out, every send after saw no socket
    let first_closed = results.iter().position(|sent| !sent).unwrap();
    assert!(results[..first_closed].iter().all(|sent| *sent));
    assert!(results[first_closed..].iter().all(|sent| !*sent));
}
