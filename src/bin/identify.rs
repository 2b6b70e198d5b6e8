//! Identify whatever is currently playing.
//!
//! Reroutes the system output through the capture route, records from the
//! loopback input, runs the fingerprinting engine (retrying with longer
//! samples) and switches the output back. With `--wantlist` the matched
//! album is added to the Discogs want-list.
//!
//! Usage:
//!     identify [-v] [--engine ./sample] [--wantlist] [--save-config]

use std::path::PathBuf;
use std::process;

use clap::Parser;

use autoid::cli::{self, ConsoleAuthorizer, Verbosity, EXIT_FAILURE, EXIT_OK};
use autoid::discogs::{add_match_to_wantlist, CatalogClient, DiscogsClient};
use autoid::{
    session_sound_path, CommandRecorder, CommandRouter, Config, EngineFingerprinter,
    IdentificationSession, IdentifyError, Outcome, RetryPolicy, TrackInfo, WavSampleWriter,
};

/// Identify the music playing on this machine
#[derive(Parser, Debug)]
#[command(name = "identify", author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    verbosity: Verbosity,

    /// Device router: switchaudiosource or pactl
    #[arg(long)]
    router: Option<String>,

    /// Capture backend: sox, pw-record or arecord
    #[arg(long)]
    capture: Option<String>,

    /// Preferred output device
    #[arg(long)]
    output: Option<String>,

    /// Loopback input to record from
    #[arg(long)]
    loopback: Option<String>,

    /// Directory for the temporary sound file
    #[arg(long)]
    recordings_dir: Option<PathBuf>,

    /// Length of the first sample in seconds
    #[arg(long)]
    duration: Option<u32>,

    /// Seconds added to the sample after each miss
    #[arg(long)]
    increment: Option<u32>,

    /// Retries after the first attempt
    #[arg(long)]
    retries: Option<u32>,

    /// Fingerprinting engine executable
    #[arg(long)]
    engine: Option<String>,

    /// Engine argument (repeatable); `{file}` is replaced by the sample path
    #[arg(long = "engine-arg", allow_hyphen_values = true)]
    engine_args: Vec<String>,

    /// Engine output format: result-json or songrec
    #[arg(long)]
    engine_format: Option<String>,

    /// Look the match up on Discogs and print the master release
    #[arg(long)]
    discogs: bool,

    /// Add the matched album to the Discogs want-list
    #[arg(long)]
    wantlist: bool,

    /// Save the given options as defaults
    #[arg(long)]
    save_config: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,
}

impl Args {
    fn overrides(&self) -> Config {
        Config {
            router: self.router.clone(),
            capture: self.capture.clone(),
            preferred_output: self.output.clone(),
            loopback_input: self.loopback.clone(),
            recordings_dir: self.recordings_dir.clone(),
            base_duration: self.duration,
            duration_increment: self.increment,
            max_retries: self.retries,
            engine_program: self.engine.clone(),
            engine_args: if self.engine_args.is_empty() { None } else { Some(self.engine_args.clone()) },
            engine_format: self.engine_format.clone(),
            ..Config::default()
        }
    }
}

fn main() {
    let args = Args::parse();
    cli::init_logging(&args.verbosity);

    let overrides = args.overrides();
    let mut config = cli::load_saved_config();
    config.merge(&overrides);

    if args.save_config {
        let mut saved = cli::load_saved_config();
        saved.merge(&overrides);
        match saved.save() {
            Ok(()) => println!("Defaults saved."),
            Err(e) => eprintln!("Error saving defaults: {}", e),
        }
    }

    if args.show_config {
        config.print("Effective configuration");
        process::exit(EXIT_OK);
    }

    let (router, recorder, engine, policy) = match build_collaborators(&config) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(EXIT_FAILURE);
        }
    };
    let writer = WavSampleWriter;
    let sound_file = session_sound_path(&config.recordings_dir());

    let session = IdentificationSession::new(
        &router,
        &recorder,
        &writer,
        &engine,
        policy,
        sound_file,
    );

    match session.run() {
        Ok(Outcome::Matched { track, attempts }) => {
            println!("{}", track.pretty());
            log::info!("Identified after {} attempt(s)", attempts);
            if args.discogs || args.wantlist {
                lookup(&config, &track, args.wantlist);
            }
            process::exit(EXIT_OK);
        }
        Ok(Outcome::GaveUp { attempts }) => {
            println!("The track could not be identified ({} attempts).", attempts);
            process::exit(EXIT_OK);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            if let IdentifyError::RestoreFailed { prior, .. } = &e {
                match prior.as_ref() {
                    Ok(Outcome::Matched { track, .. }) => println!("{}", track.pretty()),
                    Ok(outcome) => println!("{}", outcome),
                    Err(cause) => eprintln!("Before that: {}", cause),
                }
            }
            process::exit(cli::exit_code_for(&e));
        }
    }
}

fn build_collaborators(
    config: &Config,
) -> Result<(CommandRouter, CommandRecorder, EngineFingerprinter, RetryPolicy), IdentifyError> {
    Ok((
        CommandRouter::from_config(config)?,
        CommandRecorder::from_config(config)?,
        EngineFingerprinter::from_config(config)?,
        config.retry_policy()?,
    ))
}

/// Post-match Discogs step. Failures are reported but do not change the exit code.
fn lookup(config: &Config, track: &TrackInfo, add: bool) {
    let (artist, album) = match track.artist_album() {
        Some(pair) => pair,
        None => {
            eprintln!("The match has no artist/album; skipping Discogs.");
            return;
        }
    };

    let (consumer, store) = match cli::discogs_setup(config) {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Discogs: {}", e);
            return;
        }
    };
    let authorizer = ConsoleAuthorizer;
    let client = DiscogsClient::new(consumer, &store, &authorizer);

    let result = if add {
        add_match_to_wantlist(&client, artist, album).map(|addition| {
            println!("Discogs master: {} ({})", addition.master.title, addition.master.url);
            if addition.added() {
                println!("Release {} added to your want-list.", addition.release_id);
            } else {
                eprintln!("Adding release {} returned HTTP {}", addition.release_id, addition.status);
            }
        })
    } else {
        client.find_master(artist, album).map(|master| {
            println!("Discogs master: {} ({})", master.title, master.url);
        })
    };

    if let Err(e) = result {
        eprintln!("Discogs: {}", e);
    }
}
