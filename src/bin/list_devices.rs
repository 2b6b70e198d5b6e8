//! Show the audio devices the router can see and how the capture route
//! would be chosen.
//!
//! Usage:
//!     list_devices [--router pactl] [-v]

use std::process;

use clap::Parser;

use autoid::cli::{self, Verbosity, EXIT_FAILURE};
use autoid::{CommandRouter, Config, DeviceRouter};

/// List audio devices and the capture route for the current output
#[derive(Parser, Debug)]
#[command(name = "list_devices", author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    verbosity: Verbosity,

    /// Device router: switchaudiosource or pactl
    #[arg(long)]
    router: Option<String>,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(&args.verbosity);

    let mut config = cli::load_saved_config();
    config.merge(&Config {
        router: args.router.clone(),
        ..Config::default()
    });

    let router = match CommandRouter::from_config(&config) {
        Ok(router) => router,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(EXIT_FAILURE);
        }
    };

    println!("=== Audio devices ({}) ===", router.backend().as_str());

    let outputs = router.list_outputs().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        process::exit(EXIT_FAILURE);
    });
    let inputs = router.list_inputs().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        process::exit(EXIT_FAILURE);
    });

    println!();
    println!("Outputs:");
    for device in &outputs {
        println!("  {}", device);
    }
    println!();
    println!("Inputs:");
    for device in &inputs {
        println!("  {}", device);
    }

    let current = router.current_output();
    println!();
    println!("Current output:   {}", current);
    println!("Capture route:    {}", router.capture_route_for(&current));
    match router.loopback_input() {
        Ok(input) => println!("Loopback input:   {}", input),
        Err(e) => println!("Loopback input:   {}", e),
    }
}
