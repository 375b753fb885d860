use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use shmcast::{Session, SessionConfig, StoredMessage};

const SERVER_NAME: &str = "Server";
const ROSTER_INTERVAL: Duration = Duration::from_secs(10);

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmcast-server.toml")]
    config: String,
    /// Remove a segment left behind by a server that did not shut down cleanly.
    #[clap(long)]
    force: bool,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ServerConfig {
    session: SessionConfig,
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ServerConfig = confy::load_path(&opts.config)?;
    info!(config = ?cfg.session, "starting chat server");

    let term = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGTERM, SIGHUP, SIGQUIT] {
        signal_hook::flag::register(signal, Arc::clone(&term))?;
    }

    if opts.force && Session::remove_stale(&cfg.session)? {
        warn!(link = %cfg.session.link_path().display(), "removed leftover segment");
    }

    let mut session = Session::create(cfg.session)?;
    session.join(SERVER_NAME)?;
    session.send("Chat server is now online")?;
    println!("Chat server started. Press Ctrl+C to exit.");

    let result = run(&session, &term);
    println!("\nShutting down chat server...");
    session.teardown(true)?;
    result
}

fn run(session: &Session, term: &AtomicBool) -> Result<(), Box<dyn Error>> {
    let poll_interval = Duration::from_millis(session.config().poll_interval_ms);
    let mut last_roster = Instant::now();
    while !term.load(Ordering::Relaxed) {
        session.receive(print_message)?;
        for evicted in session.check_liveness()? {
            info!(username = %evicted.username, pid = evicted.pid, "participant timed out");
        }
        if last_roster.elapsed() >= ROSTER_INTERVAL {
            print_roster(session);
            last_roster = Instant::now();
        }
        thread::sleep(poll_interval);
    }
    Ok(())
}

fn print_message(message: &StoredMessage) {
    println!("[{}] {}", message.sender, message.text);
}

fn print_roster(session: &Session) {
    let active = session.list_active();
    println!("\nActive participants ({}):", active.len());
    for username in active.iter() {
        println!("- {}", username);
    }
    println!("{}\n", session.stats());
}
