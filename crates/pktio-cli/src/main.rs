//! pktio command-line tool
//!
//! Drives the two ends of an IPC link, runs a loopback self-test and dumps
//! the handshake block of a link.

mod config;
mod frame;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use config::Config;
use pktio::ipc::{IPC_MTU, PeerSnapshot, read_info};
use pktio::loopback::{LOOP_DEVNAME, QUEUE_MULTI_MAX};
use pktio::{PktioEntry, PktioError, PktioParam, PktioRegistry, StatsSnapshot};
use pktio_shm::segment::current_pid;
use pktio_shm::{Packet, Pool, PoolParams};

/// Packets moved per send or receive call
const BURST: usize = 32;

/// pktio - packet I/O over shared memory, loopback and NICs
#[derive(Parser)]
#[command(name = "pktio")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    /// Create a link, wait for the slave and send frames to it
    Master {
        /// Link name
        #[arg(long, default_value = "ipc:pktio0")]
        dev: String,

        /// Frames to send
        #[arg(short = 'n', long, default_value_t = 1000)]
        count: u64,

        /// Frame size in bytes
        #[arg(short, long, default_value_t = 128,
              value_parser = clap::value_parser!(u32).range(frame::MIN_FRAME as i64..=IPC_MTU as i64))]
        size: u32,
    },

    /// Attach to a master's link and receive its frames
    Slave {
        /// Master process id
        #[arg(long)]
        pid: u32,

        /// Link name, with or without the `ipc:` prefix
        #[arg(long, default_value = "pktio0")]
        dev: String,

        /// Frames to wait for
        #[arg(short, long, default_value_t = 1000)]
        expect: u64,
    },

    /// Send frames through the loopback interface and check them
    Loop {
        /// Frames to send
        #[arg(short = 'n', long, default_value_t = 1000)]
        count: u64,
    },

    /// Show the handshake block of a link
    Info {
        /// Master process id
        #[arg(long)]
        pid: u32,

        /// Link name, with or without the `ipc:` prefix
        #[arg(long, default_value = "pktio0")]
        dev: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };

    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.validate()?;

    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStopping...");
            flag.store(true, Ordering::Relaxed);
        }
    });

    let command = cli.command.clone();
    tokio::task::spawn_blocking(move || run(command, &config, &stop))
        .await
        .context("command thread panicked")?
}

fn run(command: Commands, config: &Config, stop: &AtomicBool) -> anyhow::Result<()> {
    match command {
        Commands::Master { dev, count, size } => run_master(config, &dev, count, size, stop),
        Commands::Slave { pid, dev, expect } => run_slave(config, pid, &dev, expect, stop),
        Commands::Loop { count } => run_loop(config, count, stop),
        Commands::Info { pid, dev } => show_info(config, pid, &dev),
    }
}

fn link_name(dev: &str) -> &str {
    dev.strip_prefix("ipc:").unwrap_or(dev)
}

fn idle(config: &Config) {
    std::thread::sleep(Duration::from_micros(config.run.poll_interval_us));
}

/// Start `entry`, retrying while the peer is not ready
fn start_when_ready(entry: &PktioEntry, config: &Config, stop: &AtomicBool) -> anyhow::Result<()> {
    let deadline = Instant::now() + Duration::from_secs(config.run.peer_timeout_secs);
    loop {
        match entry.start() {
            Ok(()) => return Ok(()),
            Err(PktioError::PeerNotReady(reason)) => {
                if stop.load(Ordering::Relaxed) {
                    anyhow::bail!("interrupted while waiting for peer");
                }
                if Instant::now() >= deadline {
                    anyhow::bail!("peer did not start in time: {reason}");
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn print_stats(name: &str, stats: &StatsSnapshot) {
    println!(
        "{name}: rx {} pkts / {} bytes ({} errors, {} discards), tx {} pkts / {} bytes",
        stats.in_packets,
        stats.in_octets,
        stats.in_errors,
        stats.in_discards,
        stats.out_packets,
        stats.out_octets
    );
}

/// Build frames `next..` into `pending` until it holds `burst` packets
fn refill(pool: &Pool, pending: &mut Vec<Packet>, next: &mut u64, count: u64, size: u32, burst: usize) {
    while pending.len() < burst && *next < count {
        let Some(mut pkt) = pool.alloc(size) else {
            break;
        };
        frame::fill(pkt.data_mut(), *next);
        pending.push(pkt);
        *next += 1;
    }
}

fn run_master(
    config: &Config,
    dev: &str,
    count: u64,
    size: u32,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let dev = format!("ipc:{}", link_name(dev));
    let registry = PktioRegistry::new(config.pktio.clone())?;
    let pool = Pool::create(
        registry.namespace(),
        &PoolParams::new("pktio_master", config.run.pool_blocks, size),
    )?;
    let entry = registry.open(&dev, &pool, PktioParam::default())?;
    println!(
        "{dev}: master pid {}, run `pktio slave --pid {} --dev {}`",
        current_pid(),
        current_pid(),
        link_name(&dev)
    );

    start_when_ready(&entry, config, stop)?;
    println!("{dev}: slave attached, sending {count} frames of {size} bytes");

    let started = Instant::now();
    let mut next = 0;
    let mut pending = Vec::with_capacity(BURST);
    let mut scratch = Vec::new();
    while (next < count || !pending.is_empty()) && !stop.load(Ordering::Relaxed) {
        refill(&pool, &mut pending, &mut next, count, size, BURST);
        if entry.send(0, &mut pending)? == 0 {
            entry.recv(0, &mut scratch, BURST)?;
            scratch.clear();
            idle(config);
        }
    }

    // every block comes back once the slave has copied it
    let deadline = Instant::now() + Duration::from_secs(config.run.peer_timeout_secs);
    while pool.available() + pending.len() < pool.capacity()
        && !stop.load(Ordering::Relaxed)
        && Instant::now() < deadline
    {
        entry.recv(0, &mut scratch, BURST)?;
        scratch.clear();
        idle(config);
    }
    let elapsed = started.elapsed();
    drop(pending);

    print_stats(&dev, &entry.stats()?);
    println!("{dev}: done in {:.3}s", elapsed.as_secs_f64());
    entry.stop()?;
    registry.close(&entry)?;
    Ok(())
}

fn run_slave(
    config: &Config,
    pid: u32,
    dev: &str,
    expect: u64,
    stop: &AtomicBool,
) -> anyhow::Result<()> {
    let devname = format!("ipc:{pid}:{}", link_name(dev));
    let registry = PktioRegistry::new(config.pktio.clone())?;
    let pool = Pool::create(
        registry.namespace(),
        &PoolParams::new("pktio_slave", config.run.pool_blocks, IPC_MTU),
    )?;
    let entry = registry
        .open(&devname, &pool, PktioParam::default())
        .with_context(|| format!("attaching to {devname}"))?;
    start_when_ready(&entry, config, stop)?;
    println!("{devname}: attached, expecting {expect} frames");

    let mut received = 0u64;
    let mut corrupt = 0u64;
    let mut out_of_order = 0u64;
    let mut out = Vec::with_capacity(BURST);
    let mut last_rx = Instant::now();
    let timeout = Duration::from_secs(config.run.peer_timeout_secs);
    while received < expect && !stop.load(Ordering::Relaxed) {
        if entry.recv(0, &mut out, BURST)? == 0 {
            if last_rx.elapsed() > timeout {
                tracing::warn!("{}: no traffic for {:?}, giving up", devname, timeout);
                break;
            }
            idle(config);
            continue;
        }
        last_rx = Instant::now();
        for pkt in out.drain(..) {
            match frame::check(pkt.data()) {
                Some(seq) if seq == received => {}
                Some(seq) => {
                    tracing::debug!("{}: frame {} arrived as #{}", devname, seq, received);
                    out_of_order += 1;
                }
                None => corrupt += 1,
            }
            received += 1;
        }
    }

    print_stats(&devname, &entry.stats()?);
    println!("{devname}: {received}/{expect} frames, {corrupt} corrupt, {out_of_order} out of order");
    entry.stop()?;
    registry.close(&entry)?;

    if received < expect || corrupt > 0 || out_of_order > 0 {
        anyhow::bail!("link check failed");
    }
    Ok(())
}

fn run_loop(config: &Config, count: u64, stop: &AtomicBool) -> anyhow::Result<()> {
    let registry = PktioRegistry::new(config.pktio.clone())?;
    let pool = Pool::create(
        registry.namespace(),
        &PoolParams::new("pktio_loop", config.run.pool_blocks, 256),
    )?;
    let entry = registry.open(LOOP_DEVNAME, &pool, PktioParam::default())?;
    entry.start()?;

    let mut next = 0;
    let mut expected = 0;
    let mut pending = Vec::with_capacity(QUEUE_MULTI_MAX);
    let mut out = Vec::with_capacity(QUEUE_MULTI_MAX);
    while expected < count && !stop.load(Ordering::Relaxed) {
        refill(&pool, &mut pending, &mut next, count, 64, QUEUE_MULTI_MAX);
        entry.send(0, &mut pending)?;
        entry.recv(0, &mut out, QUEUE_MULTI_MAX)?;
        for pkt in out.drain(..) {
            if frame::check(pkt.data()) != Some(expected) {
                anyhow::bail!("{LOOP_DEVNAME}: frame #{expected} came back damaged");
            }
            expected += 1;
        }
    }

    print_stats(LOOP_DEVNAME, &entry.stats()?);
    println!("{LOOP_DEVNAME}: {expected}/{count} frames returned intact");
    entry.stop()?;
    registry.close(&entry)?;
    Ok(())
}

fn print_peer(side: &str, peer: &PeerSnapshot) {
    if peer.init_done {
        println!(
            "  {side:<6} ready, pool {} of pid {} (block {} bytes, base {:#x})",
            peer.pool_name, peer.pid, peer.block_size, peer.base_addr
        );
    } else {
        println!("  {side:<6} not ready");
    }
}

fn show_info(config: &Config, pid: u32, dev: &str) -> anyhow::Result<()> {
    let dev = format!("ipc:{}", link_name(dev));
    let info = read_info(&config.pktio.namespace(), &dev, pid)
        .with_context(|| format!("reading handshake block of {dev} (pid {pid})"))?;
    println!("{dev} (master pid {pid}):");
    print_peer("master", &info.master);
    print_peer("slave", &info.slave);
    Ok(())
}
