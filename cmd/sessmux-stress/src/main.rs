//! Stress test - many concurrent echo clients
//!
//! Opens a crowd of TCP connections against a running sessmux-echo server,
//! pumps messages through every one of them and verifies each echo. This
//! exercises the server's re-partitioning and re-arm paths far harder than
//! a single interactive client ever would.
//!
//! Usage:
//!     cargo run -p sessmux-echo 9999          # in one terminal
//!     cargo run -p sessmux-stress 9999 200 50 # connections, rounds

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    println!("=== Sessmux Echo Stress Test ===\n");

    let mut args = std::env::args().skip(1);
    let port: u16 = args.next().and_then(|s| s.parse().ok()).unwrap_or(9999);
    let connections: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(100);
    let rounds: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(50);

    println!(
        "Target: 127.0.0.1:{port}, {connections} connections x {rounds} rounds\n"
    );

    let echoed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let start = Instant::now();

    let clients: Vec<_> = (0..connections)
        .map(|client_id| {
            let echoed = Arc::clone(&echoed);
            let failed = Arc::clone(&failed);

            std::thread::spawn(move || {
                let stream = match TcpStream::connect(("127.0.0.1", port)) {
                    Ok(stream) => stream,
                    Err(err) => {
                        eprintln!("client {client_id}: connect failed: {err}");
                        failed.fetch_add(rounds as u64, Ordering::Relaxed);
                        return;
                    }
                };

                stream
                    .set_read_timeout(Some(Duration::from_secs(5)))
                    .expect("set_read_timeout");
                stream.set_nodelay(true).expect("set_nodelay");

                let mut stream = stream;
                let payload = format!("client-{client_id}-payload");
                let mut buf = vec![0u8; payload.len()];

                for round in 0..rounds {
                    if let Err(err) = stream.write_all(payload.as_bytes()) {
                        eprintln!("client {client_id}: write failed in round {round}: {err}");
                        failed.fetch_add((rounds - round) as u64, Ordering::Relaxed);
                        return;
                    }

                    if let Err(err) = stream.read_exact(&mut buf) {
                        eprintln!("client {client_id}: read failed in round {round}: {err}");
                        failed.fetch_add((rounds - round) as u64, Ordering::Relaxed);
                        return;
                    }

                    if buf != payload.as_bytes() {
                        eprintln!("client {client_id}: echo mismatch in round {round}");
                        failed.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }

                    echoed.fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();

    for client in clients {
        let _ = client.join();
    }

    let elapsed = start.elapsed();
    let ok = echoed.load(Ordering::Relaxed);
    let bad = failed.load(Ordering::Relaxed);
    let expected = (connections * rounds) as u64;

    println!("=== Results ===");
    println!("Echoed:     {ok}/{expected}");
    println!("Failed:     {bad}");
    println!("Elapsed:    {elapsed:?}");
    println!(
        "Throughput: {:.0} echoes/sec",
        ok as f64 / elapsed.as_secs_f64()
    );

    if bad > 0 || ok != expected {
        std::process::exit(1);
    }

    println!("\n=== Stress Test Complete ===");
}
