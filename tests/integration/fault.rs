use crate::*;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use cinerender_net::{JobState, PassthroughEncoder, ProtocolError, WorkerJob};

// ── Corrupting proxy ──────────────────────────────────────────────────────────

/// Which direction gets a flipped bit, and at which absolute stream offset.
#[derive(Debug, Clone, Copy)]
pub enum Corrupt {
    Nothing,
    Request(usize),
    Reply(usize),
}

/// Forwards one connection to `upstream`, flipping the low bit of a single
/// byte as configured. Returns the address to connect to.
pub fn corrupting_proxy(upstream: &str, corrupt: Corrupt) -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?.to_string();
    let upstream = upstream.to_string();

    thread::spawn(move || -> Result<()> {
        let (client, _) = listener.accept()?;
        let server = TcpStream::connect(&upstream)?;

        let (req_flip, rep_flip) = match corrupt {
            Corrupt::Nothing => (None, None),
            Corrupt::Request(at) => (Some(at), None),
            Corrupt::Reply(at) => (None, Some(at)),
        };

        let up = {
            let (from, to) = (client.try_clone()?, server.try_clone()?);
            thread::spawn(move || pump(from, to, req_flip))
        };
        pump(server, client, rep_flip);
        let _ = up.join();
        Ok(())
    });

    Ok(addr)
}

fn pump(mut from: TcpStream, mut to: TcpStream, flip_at: Option<usize>) {
    let mut buf = vec![0u8; 64 * 1024];
    let mut offset = 0usize;
    loop {
        let n = match from.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        if let Some(at) = flip_at {
            if (offset..offset + n).contains(&at) {
                buf[at - offset] ^= 0x01;
            }
        }
        offset += n;
        if to.write_all(&buf[..n]).is_err() {
            break;
        }
    }
    let _ = to.shutdown(Shutdown::Write);
}

// ── Data faults ───────────────────────────────────────────────────────────────

/// A single corrupted byte deep inside a 2 MiB payload must surface as a
/// digest mismatch, never as a successful render.
#[test]
fn test_corrupted_payload_is_digest_mismatch() {
    let worker = spawn_worker(Arc::new(PassthroughEncoder)).unwrap();
    let job = flat_job(2 << 20);
    let header_len = job.to_metadata().unwrap().len();

    let offset = 4 + header_len + 1_500_000;
    let proxy = corrupting_proxy(&worker.addr, Corrupt::Request(offset)).unwrap();

    let mut run = WorkerJob::new(proxy, &test_config());
    let err = run.run(&job).unwrap_err();

    assert!(matches!(err, ProtocolError::DigestMismatch), "{err:?}");
    assert!(err.is_data_fault());
    assert_eq!(run.state(), JobState::Failed);
}

#[test]
fn test_corrupted_reply_is_digest_mismatch() {
    let worker = spawn_worker(Arc::new(PassthroughEncoder)).unwrap();
    let job = flat_job(64 * 1024);

    // 4-byte result header, then the frame.
    let proxy = corrupting_proxy(&worker.addr, Corrupt::Reply(4 + 1000)).unwrap();

    let err = WorkerJob::new(proxy, &test_config()).run(&job).unwrap_err();
    assert!(matches!(err, ProtocolError::DigestMismatch), "{err:?}");
}

#[test]
fn test_clean_proxy_is_transparent() {
    let worker = spawn_worker(Arc::new(PassthroughEncoder)).unwrap();
    let job = flat_job(2 << 20);
    let proxy = corrupting_proxy(&worker.addr, Corrupt::Nothing).unwrap();

    let result = WorkerJob::new(proxy, &test_config()).run(&job).unwrap();
    assert_eq!(&result.data[..], job.input.binary());
}

#[test]
fn test_worker_recovers_after_rejecting() {
    let worker = spawn_worker(Arc::new(PassthroughEncoder)).unwrap();
    let job = flat_job(4096);
    let header_len = job.to_metadata().unwrap().len();

    let proxy = corrupting_proxy(&worker.addr, Corrupt::Request(4 + header_len + 10)).unwrap();
    assert!(WorkerJob::new(proxy, &test_config()).run(&job).is_err());

    let result = WorkerJob::new(worker.addr.clone(), &test_config()).run(&job).unwrap();
    assert_eq!(result.len(), 4096);
}

// ── Transport faults ──────────────────────────────────────────────────────────

#[test]
fn test_silent_worker_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    // Accept and hold the connection without ever replying.
    let holder = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });

    let mut config = test_config();
    config.network.io_timeout_secs = 1;
    let mut run = WorkerJob::new(addr, &config);

    let started = Instant::now();
    let err = run.run(&flat_job(1024)).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, ProtocolError::ReadTimeout), "{err:?}");
    assert!(err.is_transport_fault());
    assert!(elapsed >= Duration::from_millis(900), "gave up after {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    assert_eq!(run.state(), JobState::Failed);

    holder.join().unwrap();
}

#[test]
fn test_no_worker_is_connection_refused() {
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let err = WorkerJob::new(format!("127.0.0.1:{port}"), &test_config())
        .run(&flat_job(16))
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionRefused(_)), "{err:?}");
}

#[test]
fn test_worker_dropping_mid_reply_is_connection_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let job = flat_job(100);
    let request_len = 4 + job.to_metadata().unwrap().len() + 100 + 32;

    let fake = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut request = vec![0u8; request_len];
        stream.read_exact(&mut request).unwrap();
        stream.write_all(&500u32.to_be_bytes()).unwrap();
        stream.write_all(&[0u8; 100]).unwrap();
    });

    let err = WorkerJob::new(addr, &test_config()).run(&job).unwrap_err();
    fake.join().unwrap();
    assert!(matches!(err, ProtocolError::ConnectionClosed), "{err:?}");
}
