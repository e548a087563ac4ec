//! # Traceroute Race CLI
//!
//! ## Commands
//! - `serve`: seed the default challenge, run the observer feed, log events
//! - `probe TARGET [--player ID]`: trace a path, printing SSE frames
//! - `register NAME [--player ID]`: register or rename a participant
//! - `scoreboard` / `export` / `stats`: JSON reports
//! - `locate IP` / `whereami`: geolocation lookups
//! - `challenge create|enable|disable`: manage challenges
//!
//! `probe`, `register` and `challenge` are sent to a running `serve` on the
//! observer address when one answers, so its observers see the resulting
//! events. `--local` runs them in this process instead.
//!
//! ## Environment Variables
//! - `TRACEROUTE_RACE_DB`: database path override
//! - `TRACEROUTE_RACE_OBSERVER_BIND`: observer feed bind address override

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info};

use traceroute_race::core::orchestrator::ProbeRequest;
use traceroute_race::core::protocol::ProbeEvent;
use traceroute_race::service::config::Config;
use traceroute_race::service::control::ControlClient;
use traceroute_race::service::directory::NewChallenge;
use traceroute_race::service::logging::init_logging;
use traceroute_race::service::RaceService;

#[derive(Parser)]
#[command(version, about = "Race network paths into a geofence")]
struct Cli {
    /// Config file (default: ./traceroute_race.toml, then next to the binary)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Never hand requests to a running server
    #[arg(long, global = true)]
    local: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the observer feed until interrupted
    Serve,

    /// Trace a path to TARGET; races when --player is in an active challenge
    Probe {
        target: String,
        #[arg(short, long)]
        player: Option<String>,
    },

    /// Register a participant (or rename the one given by --player)
    Register {
        name: String,
        #[arg(short, long)]
        player: Option<String>,
    },

    /// Standings of the active challenge
    Scoreboard,

    /// All results of the active (or latest) challenge
    Export,

    /// Geolocate one address
    Locate { ip: String },

    /// Geolocate this machine's public address
    Whereami,

    /// Counts and status
    Stats,

    /// Manage challenges
    #[command(subcommand)]
    Challenge(ChallengeCommand),
}

#[derive(Subcommand)]
enum ChallengeCommand {
    /// Create a challenge starting now
    Create {
        #[arg(long)]
        city: String,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
        #[arg(long)]
        radius_km: Option<f64>,
        #[arg(long, default_value = "8.8.8.8")]
        target: String,
        #[arg(long)]
        hours: Option<i64>,
    },
    /// Turn challenge mode on
    Enable,
    /// Turn challenge mode off
    Disable,
}

impl Commands {
    /// Commands that change race state
    fn routes_to_server(&self) -> bool {
        matches!(
            self,
            Commands::Probe { .. } | Commands::Register { .. } | Commands::Challenge(_)
        )
    }
}

impl ChallengeCommand {
    fn into_new_challenge(self) -> Option<NewChallenge> {
        match self {
            ChallengeCommand::Create {
                city,
                lat,
                lon,
                radius_km,
                target,
                hours,
            } => Some(NewChallenge {
                city_name: city,
                city_lat: lat,
                city_lon: lon,
                radius_km,
                target_host: target,
                duration_hours: hours,
            }),
            ChallengeCommand::Enable | ChallengeCommand::Disable => None,
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_probe<E>(events: impl IntoIterator<Item = Result<ProbeEvent, E>>) -> Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    let mut out = io::stdout().lock();
    for event in events {
        let event = event?;
        out.write_all(event.to_sse_frame()?.as_bytes())?;
        out.flush()?;
        if event.is_end() {
            break;
        }
    }
    Ok(())
}

fn print_mode(enabled: bool) {
    if enabled {
        println!("Challenge mode enabled");
    } else {
        println!("Challenge mode disabled");
    }
}

/// Run a state-changing command on the server behind `client`
fn run_remote(client: &mut ControlClient, cmd: Commands) -> Result<()> {
    match cmd {
        Commands::Probe { target, player } => {
            let mut request = ProbeRequest::new(target);
            request.participant_id = player;
            print_probe(client.probe(request)?)
        }
        Commands::Register { name, player } => {
            print_json(&client.register(player.as_deref(), &name)?)
        }
        Commands::Challenge(ChallengeCommand::Enable) => {
            client.set_challenge_mode(true)?;
            print_mode(true);
            Ok(())
        }
        Commands::Challenge(ChallengeCommand::Disable) => {
            client.set_challenge_mode(false)?;
            print_mode(false);
            Ok(())
        }
        Commands::Challenge(create) => match create.into_new_challenge() {
            Some(new) => print_json(&client.create_challenge(new)?),
            None => Ok(()),
        },
        _ => anyhow::bail!("command is not sent to the server"),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("loading config")?;
    init_logging(config.logging.console, config.log_file());

    if !cli.local && cli.cmd.routes_to_server() {
        match ControlClient::connect(&config.observer.bind) {
            Ok(mut client) => return run_remote(&mut client, cli.cmd),
            Err(e) => debug!(error = %e, "[CTL] No running server, handling locally"),
        }
    }

    let service = Arc::new(RaceService::open(config).context("opening race service")?);

    match cli.cmd {
        Commands::Serve => {
            if service.config().challenge.seed_default {
                service.seed_default_challenge()?;
            }
            let events = service.subscribe();
            let _observer = service
                .start_observer()
                .context("starting observer feed")?;
            info!("Traceroute race serving; press Ctrl+C to stop");
            for event in events.iter() {
                info!(event = event.kind(), "[RACE] Broadcast");
            }
        }
        Commands::Probe { target, player } => {
            let mut request = ProbeRequest::new(target);
            request.participant_id = player;
            let events = service.probe(request)?;
            print_probe(events.iter().map(Ok::<_, std::convert::Infallible>))?;
        }
        Commands::Register { name, player } => {
            print_json(&service.register(player.as_deref(), &name)?)?;
        }
        Commands::Scoreboard => match service.scoreboard() {
            Some(board) => print_json(&board)?,
            None => println!("No active challenge"),
        },
        Commands::Export => match service.export()? {
            Some(report) => print_json(&report)?,
            None => println!("No challenge found"),
        },
        Commands::Locate { ip } => match service.locate(&ip)? {
            Some(location) => print_json(&location)?,
            None => println!("Location unknown"),
        },
        Commands::Whereami => match service.public_location() {
            Some(location) => print_json(&location)?,
            None => println!("Public location unavailable"),
        },
        Commands::Stats => print_json(&service.stats()?)?,
        Commands::Challenge(ChallengeCommand::Enable) => {
            service.set_challenge_mode(true)?;
            print_mode(true);
        }
        Commands::Challenge(ChallengeCommand::Disable) => {
            service.set_challenge_mode(false)?;
            print_mode(false);
        }
        Commands::Challenge(create) => {
            if let Some(new) = create.into_new_challenge() {
                print_json(&service.create_challenge(new)?)?;
            }
        }
    }
    Ok(())
}
