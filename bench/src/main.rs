use std::error::Error;
use std::thread;
use std::time::Instant;

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use shmcast::{Session, SessionConfig, ShmcastError};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmcast-bench.toml")]
    config: String,
    #[clap(short = 'n', long = "messages", default_value = "100000")]
    messages: usize,
    #[clap(short = 'r', long = "readers", default_value = "1")]
    readers: usize,
    /// Check that every reader saw every message, in order.
    #[clap(long)]
    verify: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct BenchConfig {
    session: SessionConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: BenchConfig = confy::load_path(&opts.config)?;
    println!("{:?}", &cfg.session);

    let mut writer = Session::create(cfg.session.clone())?;
    writer.join("bench-writer")?;
    let mut readers = Vec::with_capacity(opts.readers);
    for i in 0..opts.readers {
        let mut reader = Session::attach(cfg.session.clone())?;
        reader.join(&format!("bench-reader-{}", i))?;
        readers.push(reader);
    }

    let start = Instant::now();
    let handles: Vec<_> = readers
        .into_iter()
        .map(|reader| {
            let messages = opts.messages;
            let verify = opts.verify;
            thread::spawn(move || read_all(reader, messages, verify))
        })
        .collect();

    let retries = write_all(&writer, opts.messages)?;
    let mut mismatches = 0usize;
    for handle in handles {
        mismatches += handle.join().map_err(|_| "reader thread panicked")??;
    }
    let duration = start.elapsed();

    let ops = ((opts.messages as f64) / (duration.as_millis().max(1) as f64)) * 1_000f64;
    println!(
        "\n{:#?}K messages broadcast/s to {} reader(s). Total time: {:#?}, {} retries on a full pool",
        (ops / 1000f64) as u64,
        opts.readers,
        duration,
        retries
    );
    println!("{}", writer.stats());
    writer.teardown(true)?;

    if mismatches > 0 {
        return Err(format!("{} message(s) arrived out of order", mismatches).into());
    }
    Ok(())
}

fn write_all(writer: &Session, messages: usize) -> Result<usize, ShmcastError> {
    let mut retries = 0usize;
    let mut sent = 0usize;
    while sent < messages {
        match writer.send(&sent.to_string()) {
            Ok(()) => {
                sent += 1;
                if sent % 10_000 == 0 {
                    eprint!("\rTotal {} messages", sent);
                }
            }
            Err(e) if e.is_capacity_exhausted() => {
                // The writer is on the roster too, so it has to consume its own copies.
                writer.receive(|_| {})?;
                retries += 1;
                thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
    while writer.receive(|_| {})? > 0 {}
    Ok(retries)
}

fn read_all(reader: Session, messages: usize, verify: bool) -> Result<usize, ShmcastError> {
    let mut received = 0usize;
    let mut mismatches = 0usize;
    while received < messages {
        let n = reader.receive(|m| {
            if verify && m.text != received.to_string() {
                mismatches += 1;
            }
            received += 1;
        })?;
        if n == 0 {
            thread::yield_now();
        }
    }
    reader.teardown(false)?;
    Ok(mismatches)
}
