//! # Shared Memory Channel Consumer
//!
//! Attaches exclusively to a channel created by `shm_producer`, sums every
//! element up to the `0` terminator and reports the sum and the average time
//! per element.

use clap::Parser;
use shm_channel::{ChannelMode, CondVar};
use shm_channel_demo::{ChannelArgs, DemoQueue};
use std::time::Instant;
use tracing::{error, info, warn};

/// Shared memory channel consumer
#[derive(Parser, Debug)]
#[command(name = "shm_consumer")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Sum the elements of a shared memory channel until the 0 terminator")]
struct Args {
    #[command(flatten)]
    channel: ChannelArgs,
}

fn main() {
    if let Err(e) = run() {
        error!("Consumer failed: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = args.channel.init()?;

    let channel = DemoQueue::open(
        &config.channel.name,
        ChannelMode::ATTACH_EXCLUSIVE,
        config.channel.backend,
    )?;
    let region = channel.queue();
    info!(
        "Consuming from {} ({} backend, generation {})",
        channel.name(),
        channel.backend(),
        channel.generation()
    );

    let next = || -> Result<u32, Box<dyn std::error::Error>> {
        if args.channel.blocking {
            let mutex = region.mutex(0).ok_or("channel has no slot 0")?;
            let cond = region.cond(0).ok_or("channel has no slot 0")?;
            let mut guard = mutex.lock()?;
            loop {
                if let Some(value) = region.try_pop() {
                    return Ok(value);
                }
                cond.wait(&mut guard)?;
            }
        }
        loop {
            if let Some(value) = region.try_pop() {
                return Ok(value);
            }
            std::hint::spin_loop();
        }
    };

    let mut sum: u64 = 0;
    let mut received: u64 = 0;
    let start = Instant::now();
    loop {
        let value = next()?;
        if value == 0 {
            break;
        }
        sum += u64::from(value);
        received += 1;
    }
    let elapsed = start.elapsed();

    if !channel.is_current() {
        warn!("Channel was re-initialized while consuming; the sum mixes two runs");
    }

    println!("Consumer computed sum: {sum}");
    if received > 0 {
        println!(
            "Average time per element (μs): {}",
            elapsed.as_micros() as f64 / received as f64
        );
    }
    Ok(())
}
