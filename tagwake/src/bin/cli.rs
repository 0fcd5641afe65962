//! Command-line interface for tagwake.
//!
//! Inspects and clears the persisted alarm episode, and runs an interactive
//! demo of the full alarm flow against in-process triggers, feedback and
//! scanning.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use time::OffsetDateTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use tagwake::actor::{AlarmActor, AlarmHandle, ScanAttempt};
use tagwake::clock::{Clock, SystemClock};
use tagwake::config::AlarmConfig;
use tagwake::credential::Credential;
use tagwake::feedback::LogFeedback;
use tagwake::machine::{Collaborators, EpisodeStateMachine, ScanVerdict, StopOutcome};
use tagwake::scan::ChannelScanner;
use tagwake::store::{EpisodeStore, FileBackend, Loaded};
use tagwake::trigger::{LocalTriggerService, schedule_alarm};

const LOCAL_TRIGGER_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        usage();
        std::process::exit(1);
    }

    let config = AlarmConfig::from_env().context("invalid configuration")?;
    let command = &args[1];

    match command.as_str() {
        "status" => cmd_status(&config).await?,
        "clear" => cmd_clear(&config).await?,
        "demo" => {
            let Some(tag) = args.get(2) else {
                eprintln!("Usage: tagwake-cli demo <tag> [delay_secs]");
                std::process::exit(1);
            };
            let delay = match args.get(3) {
                Some(secs) => Duration::from_secs(
                    secs.parse()
                        .with_context(|| format!("invalid delay: {secs}"))?,
                ),
                None => Duration::ZERO,
            };
            cmd_demo(config, Credential::new(tag.as_str()), delay).await?
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            eprintln!("Run without arguments to see usage.");
            std::process::exit(1);
        }
    }

    Ok(())
}

fn usage() {
    eprintln!("Usage: tagwake-cli <command>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  status                   Show the persisted alarm episode");
    eprintln!("  clear                    Remove the persisted alarm episode");
    eprintln!("  demo <tag> [delay_secs]  Ring an alarm dismissed by <tag>");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  TAGWAKE_STATE_DIR              Store directory (default: $XDG_STATE_HOME/tagwake)");
    eprintln!("  TAGWAKE_STALENESS_SECS         Episode expiry (default: 600)");
    eprintln!("  TAGWAKE_FALLBACK_OFFSETS_SECS  Fallback delays, comma separated (default: 5)");
    eprintln!("  TAGWAKE_MAX_FALLBACKS          Fallbacks per episode (default: unlimited)");
    eprintln!("  TAGWAKE_CANCEL_SUPERSEDED      Cancel earlier fallbacks on stop (default: false)");
    eprintln!("  TAGWAKE_STORE_WRITE_ATTEMPTS   Store write attempts (default: 3)");
    eprintln!("  RUST_LOG                       Log filter for demo (default: tagwake=info)");
}

fn open_store(config: &AlarmConfig) -> EpisodeStore {
    EpisodeStore::new(
        Arc::new(FileBackend::new(&config.state_dir)),
        Arc::new(SystemClock),
        config.staleness_window,
    )
}

/// Print the persisted episode. An expired or unreadable record is removed.
async fn cmd_status(config: &AlarmConfig) -> Result<()> {
    let store = open_store(config);

    match store.inspect().await? {
        Loaded::Empty => println!("State:   idle"),
        Loaded::Corrupt => println!("State:   idle (unreadable record discarded)"),
        Loaded::Expired(episode) => {
            println!("State:   idle (episode {} expired and discarded)", episode.id());
        }
        Loaded::Active(episode) => {
            let age = episode.age(SystemClock.now());
            println!("Episode:   {}", episode.id());
            println!("State:     {}", episode.state());
            println!("Age:       {} s", age.as_secs());
            println!("Fallbacks: {}", episode.fallback_count());
        }
    }

    Ok(())
}

async fn cmd_clear(config: &AlarmConfig) -> Result<()> {
    open_store(config).clear().await?;
    println!("Cleared.");
    Ok(())
}

/// Schedule an alarm and drive it from stdin.
async fn cmd_demo(config: AlarmConfig, tag: Credential, delay: Duration) -> Result<()> {
    tagwake::tracing::init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let triggers = Arc::new(LocalTriggerService::new(clock.clone(), LOCAL_TRIGGER_CAPACITY));
    let scanner = Arc::new(ChannelScanner::new());
    let machine = EpisodeStateMachine::new(
        &config,
        Collaborators {
            backend: Arc::new(FileBackend::new(&config.state_dir)),
            triggers: triggers.clone(),
            feedback: Arc::new(LogFeedback::new()),
            clock: clock.clone(),
        },
    );

    let cancellation = CancellationToken::new();
    let (handle, actor) = AlarmActor::spawn(machine, scanner.clone(), cancellation.clone());

    let fire_at = OffsetDateTime::now_utc() + delay;
    schedule_alarm(triggers.as_ref(), fire_at, tag.clone()).await?;
    println!("Alarm set for {} s from now; dismiss with tag {}.", delay.as_secs(), tag);
    println!("Commands: stop | scan | tag <id> | quit");

    let mut states = handle.subscribe();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            println!("[state] {}", state);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("stop"), None) => match handle.stop().await? {
                StopOutcome::Acknowledged { fallback, .. } => {
                    println!("Acknowledged; fallback: {:?}", fallback)
                }
                StopOutcome::NoActiveEpisode => println!("Nothing is ringing."),
            },
            (Some("scan"), None) => spawn_scan(handle.clone()),
            (Some("tag"), Some(id)) => {
                if !scanner.present_tag(Credential::new(id)) {
                    println!("No scan in progress; type 'scan' first.");
                }
            }
            (Some("quit"), None) => break,
            (None, _) => {}
            _ => println!("Commands: stop | scan | tag <id> | quit"),
        }
    }

    cancellation.cancel();
    actor.await.context("alarm actor panicked")?;
    printer.abort();

    if let Some(episode) = open_store(&config).load().await? {
        println!("Episode {} left {}; it resumes on next start.", episode.id(), episode.state());
    }
    Ok(())
}

fn spawn_scan(handle: AlarmHandle) {
    println!("Scanning; present a tag with 'tag <id>'.");
    tokio::spawn(async move {
        match handle.scan().await {
            Ok(ScanAttempt::Verdict(ScanVerdict::Resolved(id))) => println!("Dismissed episode {id}."),
            Ok(ScanAttempt::Verdict(ScanVerdict::InvalidCredential)) => {
                println!("Wrong tag. Scan again.")
            }
            Ok(ScanAttempt::Verdict(ScanVerdict::NoActiveEpisode)) => {
                println!("No alarm to dismiss.")
            }
            Ok(ScanAttempt::Failed(e)) => println!("Scan failed: {e}"),
            Err(e) => println!("Scan error: {e}"),
        }
    });
}

