pub mod capture;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod discogs;
pub mod error;
pub mod fingerprint;
pub mod rate_limiter;
pub mod router;
pub mod session;
pub mod wavfile;

pub use capture::{AudioRecorder, CaptureBackend, CommandRecorder, Sample};
pub use config::Config;
pub use credentials::{FileTokenStore, TokenPair, TokenStore};
pub use discogs::{add_match_to_wantlist, Authorizer, CatalogClient, DiscogsClient, MasterRelease};
pub use error::{CatalogError, IdentifyError};
pub use fingerprint::{EngineFingerprinter, EngineFormat, Fingerprinter, MatchResult, TrackInfo};
pub use router::{AudioRoute, CommandRouter, DeviceRouter, RouterBackend};
pub use session::{IdentificationSession, Outcome, RetryPolicy, SessionPhase};
pub use wavfile::{session_sound_path, SampleWriter, WavSampleWriter};
