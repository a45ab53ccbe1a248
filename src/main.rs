use clap::{Arg, Command};
use guardia::handler::GuardIAHandler;
use guardia::heuristics::HeuristicEngine;
use guardia::Config;
use log::LevelFilter;
use std::io::Read;
use std::process;

#[tokio::main]
async fn main() {
    let matches = Command::new("guardia")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Staged phishing detection gateway: heuristics, ML classifier and LLM rationale")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/guardia.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate configuration and compile the rule set")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Run one email file through the pipeline without side effects")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show processing statistics")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        match Config::default().to_file(generate_path) {
            Ok(()) => {
                println!("Default configuration written to {generate_path}");
                return;
            }
            Err(e) => {
                eprintln!("Failed to write configuration: {e}");
                process::exit(1);
            }
        }
    }

    let config_path = matches.get_one::<String>("config").unwrap();
    let config = match Config::from_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from {config_path}: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        // from_file already validated; compiling the rules surfaces pattern
        // problems the same way startup would.
        let engine = HeuristicEngine::from_config(&config);
        let _ = engine;
        println!("Configuration OK: {} rule(s) declared", config.rules.len());
        return;
    }

    if matches.get_flag("stats") {
        let Some(stats_config) = &config.statistics else {
            eprintln!("Statistics are not configured");
            process::exit(1);
        };
        match guardia::statistics::load_counters(&stats_config.database_path) {
            Ok(counters) if counters.is_empty() => println!("No statistics recorded yet"),
            Ok(counters) => {
                for (name, value) in counters {
                    println!("{name:<32} {value}");
                }
            }
            Err(e) => {
                eprintln!("Failed to read statistics: {e}");
                process::exit(1);
            }
        }
        return;
    }

    if let Some(email_path) = matches.get_one::<String>("test-email") {
        let raw = match std::fs::read(email_path) {
            Ok(raw) => raw,
            Err(e) => {
                eprintln!("Failed to read {email_path}: {e}");
                process::exit(1);
            }
        };
        let handler = match GuardIAHandler::dry_run(&config) {
            Ok(handler) => handler,
            Err(e) => {
                eprintln!("Failed to initialize pipeline: {e}");
                process::exit(1);
            }
        };
        run_one(&handler, &raw).await;
        return;
    }

    // Default mode: process one raw message from stdin (gateway hook).
    let mut raw = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut raw) {
        eprintln!("Failed to read message from stdin: {e}");
        process::exit(1);
    }

    let handler = match GuardIAHandler::from_config(&config) {
        Ok(handler) => handler,
        Err(e) => {
            eprintln!("Failed to initialize gateway: {e}");
            process::exit(1);
        }
    };
    run_one(&handler, &raw).await;
}

async fn run_one(handler: &GuardIAHandler, raw: &[u8]) {
    match handler.handle(raw).await {
        Ok(outcome) => match serde_json::to_string_pretty(&outcome) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("Failed to encode outcome: {e}");
                process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Processing failed: {e}");
            process::exit(1);
        }
    }
}
