#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

use clap::Parser;
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use romstatsd::Result;
use romstatsd::config::Config;
use romstatsd::consent::ConsentStore;
use romstatsd::prefs::{PREF_NEXT_ALARM, Prefs};
use romstatsd::service;

mod cli;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let cli = Cli::parse();
    let config = Arc::new(Config::load_or_init()?);

    match cli.command {
        Command::Run => {
            let (entry, listener) = service::build_agent(config)?;
            service::run_daemon(entry, listener).await?;
            Ok(())
        }
        Command::Once => {
            let (entry, _listener) = service::build_agent(config)?;
            let scheduler = entry.scheduler();
            if !scheduler.is_eligible() {
                println!("reporting disabled (opt-out or unconfigured endpoint)");
                return Ok(());
            }
            if scheduler.submit_once().await {
                println!("checkin accepted");
            } else {
                println!("checkin failed; retry scheduled");
            }
            Ok(())
        }
        Command::Status => print_status(&config),
        Command::OptIn => set_opt_in(&config, true),
        Command::OptOut => set_opt_in(&config, false),
    }
}

fn open_consent(config: &Config) -> Result<(Arc<Prefs>, ConsentStore)> {
    let prefs = Arc::new(Prefs::open(&config.state_dir.join("prefs.json"))?);
    let consent = ConsentStore::new(Arc::clone(&prefs), config.opt_out_marker.clone());
    Ok((prefs, consent))
}

fn print_status(config: &Config) -> Result<()> {
    let (prefs, consent) = open_consent(config)?;
    let record = consent.get_checkin_record();

    println!(
        "endpoint:         {}",
        config.endpoint_base().as_deref().unwrap_or("(not configured)")
    );
    println!("rom:              {} {}", config.rom_name, config.rom_version);
    println!("reporting:        {}", if consent.is_reporting_allowed() { "allowed" } else { "disabled" });
    println!("first boot done:  {}", !consent.first_boot_pending());
    println!(
        "last checkin:     {}",
        record
            .last_checked_at
            .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
    );
    println!(
        "reported version: {}",
        record.last_reported_version_hash.as_deref().unwrap_or("none")
    );
    if let Some(ms) = prefs.get_i64(PREF_NEXT_ALARM) {
        if let Some(at) = chrono::TimeZone::timestamp_millis_opt(&chrono::Utc, ms).single() {
            println!("next wake:        {}", at.to_rfc3339());
        }
    }
    Ok(())
}

fn set_opt_in(config: &Config, opted_in: bool) -> Result<()> {
    let (_prefs, consent) = open_consent(config)?;
    consent.set_opted_in(opted_in)?;
    // An explicit choice also settles the first-run prompt.
    consent.mark_first_boot_done()?;
    if opted_in {
        println!("anonymous reporting enabled");
    } else {
        println!("anonymous reporting disabled");
    }
    Ok(())
}
