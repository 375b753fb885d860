use std::error::Error;
use std::io::{self, BufRead};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::{self, Parser};
use serde_derive::{Deserialize, Serialize};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use shmcast::{Session, SessionConfig, ShmcastError, StoredMessage};

#[derive(clap::Parser)]
#[clap()]
struct Opts {
    #[clap(short = 'c', long = "config", default_value = "shmcast-client.toml")]
    config: String,
    username: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ClientConfig {
    session: SessionConfig,
}

enum Input {
    Message(String),
    List,
    Quit,
    Empty,
}

impl Input {
    fn parse(line: &str) -> Input {
        match line.trim_end_matches(['\r', '\n']) {
            "" => Input::Empty,
            "/exit" | "/quit" => Input::Quit,
            "/list" => Input::List,
            text => Input::Message(text.to_string()),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let opts: Opts = Opts::parse();
    let cfg: ClientConfig = confy::load_path(&opts.config)?;

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&term))?;

    println!("Joining chat as '{}'...", opts.username);
    let mut session = Session::attach(cfg.session)?;
    session.join(&opts.username)?;
    println!("Joined chat. Type your messages and press Enter. Type /list to see who is here, /quit to leave.");
    session.send("has joined the chat")?;

    let result = run(&session, &term);

    if let Err(e) = session.send("has left the chat") {
        warn!(error = %e, "could not announce leaving");
    }
    session.teardown(false)?;
    println!("Left chat");
    result
}

fn run(session: &Session, term: &AtomicBool) -> Result<(), Box<dyn Error>> {
    // Stdin blocks, so it is read on its own thread and handed over line by line.
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let poll_interval = Duration::from_millis(session.config().poll_interval_ms);
    while !term.load(Ordering::Relaxed) {
        match session.receive(print_message) {
            Ok(_) => {}
            Err(ShmcastError::Evicted(_)) => {
                println!("Disconnected from chat (timeout)");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        let line = match rx.recv_timeout(poll_interval) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        match Input::parse(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::List => print_roster(session),
            Input::Message(text) => {
                if let Err(e) = session.send(&text) {
                    eprintln!("Failed to send message: {}", e);
                }
            }
        }
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
    println!();
}
