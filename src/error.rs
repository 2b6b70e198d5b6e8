//! Error types for identification sessions and catalog lookups.
//!
//! Session errors ([`IdentifyError`]) are surfaced only after the audio
//! output has been restored. Catalog errors ([`CatalogError`]) belong to the
//! optional post-match step and never influence restoration.

use std::path::PathBuf;

use crate::session::Outcome;

/// Errors raised by the capture-and-identify session and its collaborators.
#[derive(Debug, thiserror::Error)]
pub enum IdentifyError {
    /// A named audio device does not exist.
    #[error("audio device not found: {name}")]
    DeviceNotFound { name: String },

    /// A device exists but could not be opened or queried.
    #[error("audio device unavailable: {name} - {reason}")]
    DeviceUnavailable { name: String, reason: String },

    /// The OS refused to switch the active output.
    #[error("could not switch audio output to '{route}': {reason}")]
    RouteSwitchFailed { route: String, reason: String },

    /// The sound file could not be persisted.
    #[error("could not write sound file {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },

    /// The fingerprinting engine reported an error.
    #[error("fingerprinting engine error: {0}")]
    Engine(String),

    /// The fingerprinting engine could not be started at all.
    #[error("could not run fingerprinting engine '{program}': {reason}")]
    EngineLaunch { program: String, reason: String },

    /// The return switch failed. Carries whatever the session produced
    /// before restoration so a match is never silently dropped.
    #[error("could not restore audio output to '{route}' ({reason}); switch it back manually")]
    RestoreFailed {
        route: String,
        reason: String,
        prior: Box<Result<Outcome, IdentifyError>>,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Errors from the Discogs catalog client.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("no Discogs master release found for '{artist}' - '{album}'")]
    NotFound { artist: String, album: String },

    #[error("Discogs master {master_id} has no release")]
    NoRelease { master_id: u64 },

    #[error("Discogs consumer key/secret not configured")]
    MissingCredentials,

    #[error("Discogs authorization failed: {0}")]
    Authorization(String),

    #[error("Discogs returned HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("Discogs request failed: {0}")]
    Transport(String),

    #[error("could not parse Discogs response: {0}")]
    Parse(String),

    #[error("credential store error: {0}")]
    TokenStore(String),
}

impl From<ureq::Error> for CatalogError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(status, response) => CatalogError::Http {
                status,
                url: response.get_url().to_string(),
            },
            ureq::Error::Transport(t) => CatalogError::Transport(t.to_string()),
        }
    }
}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for CatalogError {
    fn from(err: serde_json::Error) -> Self {
        CatalogError::Parse(err.to_string())
    }
}
