//! Skein discovery node.
//!
//! Runs a discovery node from a JSON config, or generates a new identity
//! seed.
//!
//! Usage:
//!   skein-node --config node.json              # run a node
//!   skein-node --config node.json --seed n.key # run with a stable identity
//!   skein-node keygen --out seed.key           # generate a seed file

use std::path::PathBuf;

use skein_core::security::identity::{derive, generate_seed, load_seed, save_seed};
use skein_core::{NodeConfig, NodeServer};

fn print_usage() {
    println!("Skein Discovery Node v0.1.0");
    println!();
    println!("Usage:");
    println!("  skein-node --config <PATH>              Run a discovery node");
    println!("  skein-node keygen --out <PATH>          Generate a new seed file");
    println!();
    println!("Options:");
    println!("  --config <PATH>     Node config JSON (default: node.json)");
    println!("  --seed <PATH>       Seed file for a stable node identity");
    println!("                      (a fresh identity is generated when omitted)");
    println!("  --help, -h          Show this help");
    println!();
    println!("Config file format:");
    println!("  {{ \"listen\": \"0.0.0.0:9200\", \"peers\": {{ \"alice\": \"token\" }} }}");
}

fn run_keygen(args: &[String]) -> Result<(), String> {
    let out = args
        .windows(2)
        .find(|w| w[0] == "--out")
        .map(|w| PathBuf::from(&w[1]))
        .ok_or_else(|| "--out is required".to_string())?;

    if out.exists() {
        return Err(format!("file already exists: {}", out.display()));
    }

    let seed = generate_seed();
    save_seed(&out, &seed).map_err(|e| e.to_string())?;
    let keys = derive(&seed).map_err(|e| e.to_string())?;

    println!("Seed written to {}", out.display());
    println!("Endpoint ID: {}", keys.node_id);
    println!("KeyId: {}", keys.key_id);
    Ok(())
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if args.first().map(String::as_str) == Some("keygen") {
        if let Err(e) = run_keygen(&args[1..]) {
            eprintln!("keygen error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_usage();
        return;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config_path = args
        .windows(2)
        .find(|w| w[0] == "--config")
        .map(|w| PathBuf::from(&w[1]))
        .unwrap_or_else(|| PathBuf::from("node.json"));

    let config = match NodeConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("load config: {}", e);
            std::process::exit(1);
        }
    };

    let seed = match args.windows(2).find(|w| w[0] == "--seed") {
        Some(w) => match load_seed(&PathBuf::from(&w[1])) {
            Ok(seed) => seed,
            Err(e) => {
                eprintln!("load seed: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            println!("Generated new node identity (use --seed to persist)");
            generate_seed()
        }
    };

    let keys = match derive(&seed) {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("derive keys: {}", e);
            std::process::exit(1);
        }
    };

    let allowed: Vec<String> = config.peers.keys().cloned().collect();
    let server = match NodeServer::start(&keys, config).await {
        Ok(server) => server,
        Err(e) => {
            eprintln!("start node: {}", e);
            std::process::exit(1);
        }
    };

    println!("Node started");
    println!("Endpoint ID: {}", server.node_id());
    match server.ticket().await {
        Ok(ticket) => println!("Ticket: {}", ticket),
        Err(e) => eprintln!("ticket unavailable: {}", e),
    }
    println!("Allowed peers: {:?}", allowed);

    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("signal error: {}", e);
    }

    println!("\nShutting down...");
    server.shutdown();
}
