//! Load-generating benchmark client for the echo daemon.
//!
//! Each pass starts a fixed number of concurrent clients together. Every
//! client sends one random printable payload, reads the echo back, verifies
//! it and records the round-trip time in microseconds. Per-slot averages over
//! all passes are written as `<slot> <avg-us>` lines.
//!
//! Any failure aborts the whole run: a partial latency report is worse than
//! none.

use bytes::{Bytes, BytesMut};
use clap::Parser;
use rand::Rng;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Barrier;
use tracing::{debug, info};

/// Lowest payload byte (space).
const PAYLOAD_MIN: u8 = 0x20;
/// One past the highest payload byte; DEL (0x7F) is never sent.
const PAYLOAD_END: u8 = 0x7F;

/// Command-line arguments for the benchmark client
#[derive(Parser, Debug, Clone)]
#[command(name = "kecho-bench")]
#[command(author = "kecho authors")]
#[command(version = "0.1.0")]
#[command(about = "Round-trip latency benchmark for the kecho daemon", long_about = None)]
pub struct BenchArgs {
    /// Daemon address
    #[arg(short, long, default_value = "127.0.0.1:12345")]
    pub target: SocketAddr,

    /// Number of passes to average over
    #[arg(short, long, default_value_t = 10)]
    pub passes: usize,

    /// Concurrent clients per pass
    #[arg(short, long, default_value_t = 1000)]
    pub clients: usize,

    /// Maximum payload length in bytes
    #[arg(short = 'm', long, default_value_t = 32)]
    pub max_payload: usize,

    /// Results file
    #[arg(short, long, default_value = "bench.txt")]
    pub output: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Benchmark failures. All of them end the run.
#[derive(Debug)]
pub enum BenchError {
    Connect(SocketAddr, io::Error),
    Io(io::Error),
    /// The echoed bytes differ from what was sent.
    Mismatch {
        slot: usize,
        sent: Bytes,
        received: Bytes,
    },
    Task(tokio::task::JoinError),
    Report(PathBuf, io::Error),
}

impl fmt::Display for BenchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BenchError::Connect(addr, e) => write!(f, "Failed to connect to {addr}: {e}"),
            BenchError::Io(e) => write!(f, "I/O error: {e}"),
            BenchError::Mismatch {
                slot,
                sent,
                received,
            } => write!(
                f,
                "Echo mismatch on client {slot}: sent {:?}, received {:?}",
                String::from_utf8_lossy(sent),
                String::from_utf8_lossy(received)
            ),
            BenchError::Task(e) => write!(f, "Client task failed: {e}"),
            BenchError::Report(path, e) => {
                write!(f, "Failed to write report '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for BenchError {}

impl From<io::Error> for BenchError {
    fn from(e: io::Error) -> Self {
        BenchError::Io(e)
    }
}

/// Random payload of 1..=`max_len` printable ASCII bytes, never DEL.
pub fn generate_payload<R: Rng>(rng: &mut R, max_len: usize) -> Bytes {
    let len = rng.random_range(1..=max_len.max(1));
    (0..len)
        .map(|_| rng.random_range(PAYLOAD_MIN..PAYLOAD_END))
        .collect::<Vec<u8>>()
        .into()
}

/// One connection, one round trip. Returns elapsed microseconds.
pub async fn round_trip(target: SocketAddr, slot: usize, payload: Bytes) -> Result<u64, BenchError> {
    let mut stream = TcpStream::connect(target)
        .await
        .map_err(|e| BenchError::Connect(target, e))?;

    let start = Instant::now();
    stream.write_all(&payload).await?;

    let mut reply = BytesMut::with_capacity(payload.len());
    while reply.len() < payload.len() {
        if stream.read_buf(&mut reply).await? == 0 {
            break;
        }
    }
    let elapsed = start.elapsed().as_micros() as u64;

    if reply[..] != payload[..] {
        return Err(BenchError::Mismatch {
            slot,
            sent: payload,
            received: reply.freeze(),
        });
    }

    Ok(elapsed)
}

/// Run `clients` concurrent round trips; latencies are indexed by slot.
pub async fn run_pass(
    target: SocketAddr,
    clients: usize,
    max_payload: usize,
) -> Result<Vec<u64>, BenchError> {
    let payloads: Vec<Bytes> = {
        let mut rng = rand::rng();
        (0..clients)
            .map(|_| generate_payload(&mut rng, max_payload))
            .collect()
    };

    // Hold every client until all have been spawned
    let barrier = Arc::new(Barrier::new(clients));
    let mut tasks: Vec<_> = payloads
        .into_iter()
        .enumerate()
        .map(|(slot, payload)| {
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                round_trip(target, slot, payload).await
            })
        })
        .collect();

    let mut latencies = Vec::with_capacity(clients);
    for i in 0..tasks.len() {
        let outcome = match (&mut tasks[i]).await {
            Ok(Ok(elapsed)) => Ok(elapsed),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(BenchError::Task(e)),
        };
        match outcome {
            Ok(elapsed) => latencies.push(elapsed),
            Err(e) => {
                for task in &tasks[i + 1..] {
                    task.abort();
                }
                return Err(e);
            }
        }
    }

    Ok(latencies)
}

/// Run every pass and write the per-slot averages to `args.output`.
pub async fn run(args: &BenchArgs) -> Result<Vec<u64>, BenchError> {
    info!(
        addr = %args.target,
        passes = args.passes,
        clients = args.clients,
        max_payload = args.max_payload,
        "Starting benchmark"
    );

    let mut totals = vec![0u64; args.clients];
    for pass in 0..args.passes {
        let latencies = run_pass(args.target, args.clients, args.max_payload).await?;
        for (total, elapsed) in totals.iter_mut().zip(&latencies) {
            *total += elapsed;
        }
        debug!(
            pass,
            max_us = latencies.iter().max().copied().unwrap_or(0),
            "Pass complete"
        );
    }

    let passes = args.passes.max(1) as u64;
    let averages: Vec<u64> = totals.iter().map(|total| total / passes).collect();

    write_report(&args.output, &averages)?;
    info!(output = %args.output.display(), "Benchmark complete");

    Ok(averages)
}

/// One `<slot> <average-us>` line per client slot.
pub fn format_report(averages: &[u64]) -> String {
    averages
        .iter()
        .enumerate()
        .map(|(slot, avg)| format!("{slot} {avg}\n"))
        .collect()
}

pub fn write_report(path: &Path, averages: &[u64]) -> Result<(), BenchError> {
    std::fs::write(path, format_report(averages)).map_err(|e| BenchError::Report(path.to_path_buf(), e))
}
