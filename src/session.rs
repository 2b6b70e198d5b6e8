//! The capture-and-identify session.
//!
//! A session reroutes the system output through the capture route, records
//! progressively longer samples from the loopback input until the engine
//! recognises one (or the retry ceiling is reached), and then puts the
//! original output back. Restoration happens on every path out of the
//! session once the outbound switch succeeded: the returned paths call
//! [`RestoreGuard::restore`] explicitly, and the guard's `Drop` covers a
//! panic unwinding through a collaborator.
//!
//! ```text
//! Idle → Routed → Recording → Fingerprinting → Matched           → Restoring → Done
//!                    ↑               │       → ExhaustedAttempts →           → Failed
//!                    └── Retrying ←──┘       → Failed            →
//! ```

use std::cell::Cell;
use std::fmt;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};

use crate::capture::AudioRecorder;
use crate::error::IdentifyError;
use crate::fingerprint::{Fingerprinter, MatchResult, TrackInfo};
use crate::router::{AudioRoute, DeviceRouter};
use crate::wavfile::SampleWriter;

/// Longest sample any attempt may record, in seconds.
pub const MAX_SAMPLE_SECS: u32 = 300;
/// Most retries a policy may ask for.
pub const MAX_RETRIES: u32 = 10;

/// How sample length grows after each miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Length of the first sample, in seconds.
    pub base_secs: u32,
    /// Added to the sample length after every unmatched attempt.
    pub increment_secs: u32,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_secs: 6,
            increment_secs: 3,
            max_retries: 2,
        }
    }
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Sample lengths of every attempt the policy allows, in order.
    pub fn durations(&self) -> Vec<u32> {
        (0..self.total_attempts())
            .map(|n| self.base_secs.saturating_add(n.saturating_mul(self.increment_secs)))
            .collect()
    }

    /// Reject policies that record nothing, retry without bound or ask for
    /// samples longer than [`MAX_SAMPLE_SECS`].
    pub fn validate(&self) -> Result<(), IdentifyError> {
        if self.base_secs == 0 {
            return Err(IdentifyError::Config("sample duration must be at least 1s".to_string()));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(IdentifyError::Config(format!(
                "{} retries requested, at most {} allowed",
                self.max_retries, MAX_RETRIES
            )));
        }
        let longest = self
            .max_retries
            .checked_mul(self.increment_secs)
            .and_then(|extra| extra.checked_add(self.base_secs))
            .filter(|secs| *secs <= MAX_SAMPLE_SECS);
        match longest {
            Some(_) => Ok(()),
            None => Err(IdentifyError::Config(format!(
                "samples of {}s + {}s x {} retries exceed the {}s limit",
                self.base_secs, self.increment_secs, self.max_retries, MAX_SAMPLE_SECS
            ))),
        }
    }
}

/// Retry bookkeeping for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    attempt: u32,
    duration_secs: u32,
    ceiling: u32,
    increment_secs: u32,
}

impl SessionState {
    pub fn new(policy: &RetryPolicy) -> Self {
        SessionState {
            attempt: 0,
            duration_secs: policy.base_secs,
            ceiling: policy.max_retries,
            increment_secs: policy.increment_secs,
        }
    }

    /// Retries used so far (0 during the first attempt).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn attempts_made(&self) -> u32 {
        self.attempt + 1
    }

    pub fn duration_secs(&self) -> u32 {
        self.duration_secs
    }

    pub fn ceiling(&self) -> u32 {
        self.ceiling
    }

    /// Move to the next, longer attempt. Returns `false` once the ceiling
    /// has been reached, leaving the state untouched.
    pub fn escalate(&mut self) -> bool {
        if self.attempt >= self.ceiling {
            return false;
        }
        self.attempt += 1;
        self.duration_secs = self.duration_secs.saturating_add(self.increment_secs);
        true
    }
}

/// How a session that ran to completion ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Matched { track: TrackInfo, attempts: u32 },
    GaveUp { attempts: u32 },
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Matched { track, attempts } => {
                write!(f, "identified {} after {} attempt(s)", track, attempts)
            }
            Outcome::GaveUp { attempts } => {
                write!(f, "not identified after {} attempt(s)", attempts)
            }
        }
    }
}

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Idle,
    Routed,
    Recording,
    Fingerprinting,
    Retrying,
    Matched,
    ExhaustedAttempts,
    Restoring,
    Done,
    Failed,
}

/// Puts the original output back and deletes the sound file.
///
/// Call [`restore`](RestoreGuard::restore) on every normal exit; if the guard
/// is dropped without it (a panic unwinding), the drop does the same work
/// and logs any failure.
pub struct RestoreGuard<'a> {
    router: &'a dyn DeviceRouter,
    writer: &'a dyn SampleWriter,
    original: AudioRoute,
    sound_file: PathBuf,
    armed: bool,
}

impl<'a> RestoreGuard<'a> {
    pub fn new(
        router: &'a dyn DeviceRouter,
        writer: &'a dyn SampleWriter,
        original: AudioRoute,
        sound_file: &Path,
    ) -> Self {
        RestoreGuard {
            router,
            writer,
            original,
            sound_file: sound_file.to_path_buf(),
            armed: true,
        }
    }

    pub fn restore(mut self) -> Result<(), IdentifyError> {
        self.armed = false;
        self.run()
    }

    fn run(&self) -> Result<(), IdentifyError> {
        debug!("Restoring output to '{}'", self.original);
        let switched = self.router.switch_to(&self.original);
        if let Err(e) = self.writer.remove(&self.sound_file) {
            warn!("{}", e);
        }
        switched
    }
}

impl Drop for RestoreGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.armed = false;
            if let Err(e) = self.run() {
                error!("{}", e);
            }
        }
    }
}

/// One identification attempt sequence over borrowed collaborators.
pub struct IdentificationSession<'a> {
    router: &'a dyn DeviceRouter,
    recorder: &'a dyn AudioRecorder,
    writer: &'a dyn SampleWriter,
    fingerprinter: &'a dyn Fingerprinter,
    policy: RetryPolicy,
    sound_file: PathBuf,
    phase: Cell<SessionPhase>,
}

impl<'a> IdentificationSession<'a> {
    pub fn new(
        router: &'a dyn DeviceRouter,
        recorder: &'a dyn AudioRecorder,
        writer: &'a dyn SampleWriter,
        fingerprinter: &'a dyn Fingerprinter,
        policy: RetryPolicy,
        sound_file: PathBuf,
    ) -> Self {
        IdentificationSession {
            router,
            recorder,
            writer,
            fingerprinter,
            policy,
            sound_file,
            phase: Cell::new(SessionPhase::Idle),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.get()
    }

    fn enter(&self, phase: SessionPhase) {
        debug!("Session: {:?} -> {:?}", self.phase.get(), phase);
        self.phase.set(phase);
    }

    /// Run the session to completion.
    ///
    /// `Ok` means the output was restored and the session either matched or
    /// gave up. Any `Err` other than [`IdentifyError::RestoreFailed`] was
    /// raised after restoration succeeded (or before anything was changed).
    pub fn run(&self) -> Result<Outcome, IdentifyError> {
        if let Err(e) = self.policy.validate() {
            self.enter(SessionPhase::Failed);
            return Err(e);
        }
        debug!("Planned sample lengths: {:?}s", self.policy.durations());

        let original = self.router.current_output();
        let capture = self.router.capture_route_for(&original);
        info!("Switching output from '{}' to '{}'", original, capture);

        if let Err(e) = self.router.switch_to(&capture) {
            self.enter(SessionPhase::Failed);
            return Err(e);
        }
        self.enter(SessionPhase::Routed);

        let guard = RestoreGuard::new(self.router, self.writer, original.clone(), &self.sound_file);
        let result = self.identify();

        self.enter(SessionPhase::Restoring);
        match guard.restore() {
            Ok(()) => {
                self.enter(if result.is_ok() { SessionPhase::Done } else { SessionPhase::Failed });
                result
            }
            Err(e) => {
                self.enter(SessionPhase::Failed);
                if let Err(prior) = &result {
                    error!("{}", prior);
                }
                Err(IdentifyError::RestoreFailed {
                    route: original.name,
                    reason: e.to_string(),
                    prior: Box::new(result),
                })
            }
        }
    }

    /// The record → write → fingerprint loop, run while the capture route is active.
    fn identify(&self) -> Result<Outcome, IdentifyError> {
        let result = self.attempts();
        if result.is_err() {
            self.enter(SessionPhase::Failed);
        }
        result
    }

    fn attempts(&self) -> Result<Outcome, IdentifyError> {
        let input = self.router.loopback_input()?;
        let mut state = SessionState::new(&self.policy);

        loop {
            match self.attempt(&input, &state)? {
                MatchResult::Matched(track) => {
                    self.enter(SessionPhase::Matched);
                    return Ok(Outcome::Matched {
                        track,
                        attempts: state.attempts_made(),
                    });
                }
                MatchResult::Unmatched => {
                    info!("The track was not identified.");
                    if !state.escalate() {
                        self.enter(SessionPhase::ExhaustedAttempts);
                        return Ok(Outcome::GaveUp {
                            attempts: state.attempts_made(),
                        });
                    }
                    self.enter(SessionPhase::Retrying);
                    info!("Retrying with a {}s sample...", state.duration_secs());
                }
                MatchResult::EngineError(msg) => return Err(IdentifyError::Engine(msg)),
            }
        }
    }

    fn attempt(&self, input: &AudioRoute, state: &SessionState) -> Result<MatchResult, IdentifyError> {
        self.enter(SessionPhase::Recording);
        debug!(
            "Attempt {}/{}: {}s from '{}'",
            state.attempts_made(),
            state.ceiling() + 1,
            state.duration_secs(),
            input
        );
        let sample = self.recorder.record(input, state.duration_secs())?;

        // A failed write costs this attempt only; never fingerprint a stale file.
        let path = match self.writer.persist(&sample, &self.sound_file) {
            Ok(path) => path,
            Err(e) => {
                warn!("Error writing the sound file: {}", e);
                return Ok(MatchResult::Unmatched);
            }
        };

        self.enter(SessionPhase::Fingerprinting);
        self.fingerprinter.identify(&path)
    }
}
