//! Add an album to the Discogs want-list without recording anything.
//!
//! Usage:
//!     wantlist_add "DJ Shadow" "Endtroducing....." [--dry-run]

use std::process;

use clap::Parser;

use autoid::cli::{self, ConsoleAuthorizer, Verbosity, EXIT_FAILURE, EXIT_OK};
use autoid::discogs::{add_match_to_wantlist, CatalogClient, DiscogsClient};

/// Find an album on Discogs and add its main release to your want-list
#[derive(Parser, Debug)]
#[command(name = "wantlist_add", author, version, about, long_about = None)]
struct Args {
    #[command(flatten)]
    verbosity: Verbosity,

    /// Artist name
    artist: String,

    /// Album title
    album: String,

    /// Only look the album up, do not change the want-list
    #[arg(long)]
    dry_run: bool,
}

fn main() {
    let args = Args::parse();
    cli::init_logging(&args.verbosity);

    let config = cli::load_saved_config();
    let (consumer, store) = match cli::discogs_setup(&config) {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Set DISCOGS_CONSUMER_KEY and DISCOGS_CONSUMER_SECRET or add them to the config file.");
            process::exit(EXIT_FAILURE);
        }
    };
    let authorizer = ConsoleAuthorizer;
    let client = DiscogsClient::new(consumer, &store, &authorizer);

    if args.dry_run {
        match client
            .find_master(&args.artist, &args.album)
            .and_then(|master| client.resolve_release(master.id).map(|release| (master, release)))
        {
            Ok((master, release)) => {
                println!("Master:  {} ({})", master.title, master.url);
                println!("Release: {}", release);
                process::exit(EXIT_OK);
            }
            Err(e) => {
                eprintln!("Error: {}", e);
                process::exit(EXIT_FAILURE);
            }
        }
    }

    match add_match_to_wantlist(&client, &args.artist, &args.album) {
        Ok(addition) => {
            println!("Master:  {} ({})", addition.master.title, addition.master.url);
            if addition.added() {
                println!("Release {} added to your want-list.", addition.release_id);
                process::exit(EXIT_OK);
            }
            eprintln!("Discogs returned HTTP {} for release {}", addition.status, addition.release_id);
            process::exit(EXIT_FAILURE);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(EXIT_FAILURE);
        }
    }
}
