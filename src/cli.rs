//! Pieces shared by the command-line tools: logging flags, exit codes and
//! the interactive Discogs authorization.

use std::io::{self, BufRead, Write};
use std::process::{Command, Stdio};

use clap::Args;
use log::{debug, LevelFilter};

use crate::config::Config;
use crate::credentials::FileTokenStore;
use crate::discogs::{Authorizer, ConsumerCredentials};
use crate::error::{CatalogError, IdentifyError};

/// The session returned (matched or gave up).
pub const EXIT_OK: i32 = 0;
/// The session failed; the output device was restored.
pub const EXIT_FAILURE: i32 = 1;
/// The original output device could not be restored.
pub const EXIT_NOT_RESTORED: i32 = 2;

/// Verbosity flags, flattened into every tool's arguments.
#[derive(Args, Debug, Clone, Default)]
pub struct Verbosity {
    /// Increase logging verbosity (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl Verbosity {
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize env_logger: our own modules at the requested level, dependencies at warn.
pub fn init_logging(verbosity: &Verbosity) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module("autoid", verbosity.log_level());
    // HTTP internals only at -vvv
    if verbosity.verbose >= 3 {
        builder.filter_module("ureq", verbosity.log_level());
    }
    builder.format_timestamp_millis().init();
}

/// Exit code for a failed session.
pub fn exit_code_for(error: &IdentifyError) -> i32 {
    match error {
        IdentifyError::RestoreFailed { .. } => EXIT_NOT_RESTORED,
        _ => EXIT_FAILURE,
    }
}

/// Saved config file, or an empty one when it is missing or unreadable.
pub fn load_saved_config() -> Config {
    match Config::load() {
        Ok(config) => config,
        Err(e) => {
            debug!("No saved config loaded: {}", e);
            Config::new()
        }
    }
}

/// Consumer credentials plus the default token store.
pub fn discogs_setup(config: &Config) -> Result<(ConsumerCredentials, FileTokenStore), CatalogError> {
    let (key, secret) = config.discogs_consumer().ok_or(CatalogError::MissingCredentials)?;
    let store = FileTokenStore::default_location()?;
    Ok((ConsumerCredentials { key, secret }, store))
}

/// [`Authorizer`] that opens the browser and reads the code from stdin.
pub struct ConsoleAuthorizer;

impl Authorizer for ConsoleAuthorizer {
    fn verifier(&self, authorize_url: &str) -> Result<String, CatalogError> {
        println!("Authorize this application with Discogs:");
        println!("  {}", authorize_url);
        open_in_browser(authorize_url);

        print!("Enter the verification code: ");
        io::stdout().flush().ok();

        let mut code = String::new();
        io::stdin()
            .lock()
            .read_line(&mut code)
            .map_err(|e| CatalogError::Authorization(e.to_string()))?;
        let code = code.trim().to_string();
        if code.is_empty() {
            return Err(CatalogError::Authorization("no verification code entered".to_string()));
        }
        Ok(code)
    }
}

fn open_in_browser(url: &str) {
    let opener = if cfg!(target_os = "macos") { "open" } else { "xdg-open" };
    let spawned = Command::new(opener)
        .arg(url)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    if let Err(e) = spawned {
        debug!("Could not launch {}: {}", opener, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level() {
        let mut v = Verbosity::default();
        assert_eq!(v.log_level(), LevelFilter::Warn);
        v.verbose = 2;
        assert_eq!(v.log_level(), LevelFilter::Debug);
        v.quiet = true;
        assert_eq!(v.log_level(), LevelFilter::Error);
    }

    #[test]
    fn test_exit_codes() {
        let restore = IdentifyError::RestoreFailed {
            route: "Built-in Output".to_string(),
            reason: "exit status: 1".to_string(),
            prior: Box::new(Err(IdentifyError::Engine("x".to_string()))),
        };
        assert_eq!(exit_code_for(&restore), EXIT_NOT_RESTORED);
        assert_eq!(exit_code_for(&IdentifyError::Engine("x".to_string())), EXIT_FAILURE);
    }
}
