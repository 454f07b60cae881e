//! # Shared Memory Channel Producer
//!
//! Creates the channel and pushes `count, count-1, ..., 1` followed by one
//! `0` terminator per consumer.
//!
//! # Usage
//!
//! ```bash
//! # Default channel on the POSIX backend, one million elements
//! shm_producer
//!
//! # System V backend, stale markers removed first
//! shm_producer --backend xsi --clean --count 5
//! ```

use clap::Parser;
use shm_channel::{ChannelMode, CondVar};
use shm_channel_demo::{ChannelArgs, DemoQueue};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Shared memory channel producer
#[derive(Parser, Debug)]
#[command(name = "shm_producer")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Push a descending sequence into a shared memory channel")]
struct Args {
    #[command(flatten)]
    channel: ChannelArgs,

    /// Number of elements before the terminator
    #[arg(long, default_value_t = 1_000_000)]
    count: u32,

    /// Number of `0` terminators, one per consumer
    #[arg(long, default_value_t = 1)]
    consumers: u32,

    /// Remove stale sentinel markers before creating
    #[arg(long)]
    clean: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("Producer failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = args.channel.init()?;
    if args.clean {
        config.channel.clean = true;
    }

    let channel = DemoQueue::from_config(&config.channel, ChannelMode::CREATE)?;
    let region = channel.queue();
    info!(
        "Producing {} elements into {} ({} backend, capacity {})",
        args.count,
        channel.name(),
        channel.backend(),
        region.capacity()
    );

    let publish = |value: u32| -> Result<(), Box<dyn std::error::Error>> {
        if args.channel.blocking {
            let mutex = region.mutex(0).ok_or("channel has no slot 0")?;
            let cond = region.cond(0).ok_or("channel has no slot 0")?;
            loop {
                let guard = mutex.lock()?;
                if region.try_push(value).is_ok() {
                    cond.notify_all()?;
                    return Ok(());
                }
                drop(guard);
                thread::sleep(Duration::from_micros(10));
            }
        }
        while region.try_push(value).is_err() {
            thread::sleep(Duration::from_micros(10));
        }
        Ok(())
    };

    for value in (1..=args.count).rev() {
        publish(value)?;
    }
    for _ in 0..args.consumers {
        publish(0)?;
    }
    debug!("Queue length after producing: {}", region.len());

    println!("Producer finished pushing {} elements.", args.count);
    Ok(())
}
