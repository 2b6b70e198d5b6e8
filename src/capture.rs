//! Fixed-duration PCM capture from the loopback input.
//!
//! Capture runs an external recorder that writes raw little-endian PCM to
//! stdout (`sox`, `pw-record` or `arecord`) and reads it in fixed-size
//! chunks. Recording blocks the calling thread for its whole duration.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::IdentifyError;
use crate::router::AudioRoute;
use crate::session::MAX_SAMPLE_SECS;

pub const CHANNELS: u16 = 2;
pub const SAMPLE_RATE: u32 = 44100;
pub const BITS_PER_SAMPLE: u16 = 16;
/// Frames per read.
pub const CHUNK_FRAMES: usize = 1024;

/// A block of captured interleaved signed 16-bit PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    samples: Vec<i16>,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
}

impl Sample {
    pub fn new(samples: Vec<i16>, channels: u16, sample_rate: u32) -> Self {
        Sample {
            samples,
            channels,
            sample_rate,
            bits_per_sample: BITS_PER_SAMPLE,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn bits_per_sample(&self) -> u16 {
        self.bits_per_sample
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Captures a fixed-duration block of audio from an input device.
pub trait AudioRecorder {
    fn record(&self, input: &AudioRoute, seconds: u32) -> Result<Sample, IdentifyError>;
}

/// Number of whole chunks that cover `seconds` of audio at the fixed rate.
pub fn chunks_for(seconds: u32) -> usize {
    (SAMPLE_RATE as f64 / CHUNK_FRAMES as f64 * seconds as f64) as usize
}

/// External program used to read raw PCM from the loopback device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CaptureBackend {
    /// `sox -t coreaudio <device>` (macOS)
    #[default]
    Sox,
    /// `pw-record --target <device>` (PipeWire)
    PwRecord,
    /// `arecord -D <device>` (ALSA)
    Arecord,
}

impl CaptureBackend {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "sox" | "coreaudio" => Ok(CaptureBackend::Sox),
            "pw-record" | "pwrecord" | "pipewire" => Ok(CaptureBackend::PwRecord),
            "arecord" | "alsa" => Ok(CaptureBackend::Arecord),
            _ => Err(format!("Unsupported capture backend: {}", s)),
        }
    }

    pub fn program(&self) -> &str {
        match self {
            CaptureBackend::Sox => "sox",
            CaptureBackend::PwRecord => "pw-record",
            CaptureBackend::Arecord => "arecord",
        }
    }

    fn command(&self, device: &str) -> Command {
        let mut cmd = Command::new(self.program());
        match self {
            CaptureBackend::Sox => {
                cmd.arg("-q")
                    .arg("-t").arg("coreaudio").arg(device)
                    .arg("-t").arg("raw")
                    .arg("-r").arg(SAMPLE_RATE.to_string())
                    .arg("-c").arg(CHANNELS.to_string())
                    .arg("-b").arg(BITS_PER_SAMPLE.to_string())
                    .arg("-e").arg("signed-integer")
                    .arg("-L")
                    .arg("-");
            }
            CaptureBackend::PwRecord => {
                cmd.arg("--target").arg(device)
                    .arg("--rate").arg(SAMPLE_RATE.to_string())
                    .arg("--channels").arg(CHANNELS.to_string())
                    .arg("--format").arg("s16")
                    .arg("-");
            }
            CaptureBackend::Arecord => {
                cmd.arg("-q")
                    .arg("-D").arg(device)
                    .arg("-r").arg(SAMPLE_RATE.to_string())
                    .arg("-c").arg(CHANNELS.to_string())
                    .arg("-f").arg("S16_LE")
                    .arg("-t").arg("raw");
            }
        }
        cmd
    }
}

/// A running capture subprocess. The child is killed and reaped on drop, so
/// the device is released however recording ends.
struct CaptureStream {
    device: String,
    process: Child,
    /// Drains stderr while recording so a chatty tool never blocks on a full pipe.
    stderr: Option<JoinHandle<String>>,
}

impl CaptureStream {
    fn open(backend: CaptureBackend, device: &str) -> Result<Self, IdentifyError> {
        let cmd = backend.command(device);
        debug!("Starting capture: {:?}", cmd);
        Self::spawn(cmd, device).map_err(|e| IdentifyError::DeviceUnavailable {
            name: device.to_string(),
            reason: format!("failed to start {}: {}", backend.program(), e),
        })
    }

    fn spawn(mut cmd: Command, device: &str) -> std::io::Result<Self> {
        let mut process = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr = process.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = pipe.read_to_string(&mut text);
                text
            })
        });

        Ok(CaptureStream {
            device: device.to_string(),
            process,
            stderr,
        })
    }

    /// Read exactly one chunk of interleaved samples, or `None` at end of stream.
    fn read_chunk(&mut self, buffer: &mut [u8]) -> Option<Vec<i16>> {
        let stdout = self.process.stdout.as_mut()?;
        if stdout.read_exact(buffer).is_err() {
            return None;
        }
        let mut samples = vec![0i16; buffer.len() / 2];
        LittleEndian::read_i16_into(buffer, &mut samples);
        Some(samples)
    }

    /// Stop the recorder and collect whatever it wrote to stderr.
    fn stop(&mut self) -> String {
        let _ = self.process.kill();
        let _ = self.process.wait();
        self.stderr
            .take()
            .and_then(|reader| reader.join().ok())
            .map(|text| text.trim().to_string())
            .unwrap_or_default()
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

/// [`AudioRecorder`] that shells out to a raw-PCM capture tool.
pub struct CommandRecorder {
    backend: CaptureBackend,
}

impl CommandRecorder {
    pub fn new(backend: CaptureBackend) -> Self {
        CommandRecorder { backend }
    }

    pub fn from_config(config: &Config) -> Result<Self, IdentifyError> {
        let backend = config.capture_backend().map_err(IdentifyError::Config)?;
        Ok(Self::new(backend))
    }
}

impl AudioRecorder for CommandRecorder {
    fn record(&self, input: &AudioRoute, seconds: u32) -> Result<Sample, IdentifyError> {
        let chunks = chunks_for(seconds);
        let chunk_bytes = CHUNK_FRAMES * CHANNELS as usize * (BITS_PER_SAMPLE / 8) as usize;

        let mut stream = CaptureStream::open(self.backend, &input.id)?;
        info!("Recording for {} seconds...", seconds);

        let mut buffer = vec![0u8; chunk_bytes];
        let reserve = chunks.min(chunks_for(MAX_SAMPLE_SECS));
        let mut samples: Vec<i16> = Vec::with_capacity(reserve * CHUNK_FRAMES * CHANNELS as usize);
        for _ in 0..chunks {
            match stream.read_chunk(&mut buffer) {
                Some(chunk) => samples.extend_from_slice(&chunk),
                None => break,
            }
        }

        let stderr = stream.stop();
        if samples.is_empty() && chunks > 0 {
            return Err(IdentifyError::DeviceUnavailable {
                name: stream.device.clone(),
                reason: if stderr.is_empty() {
                    format!("{} produced no audio", self.backend.program())
                } else {
                    stderr
                },
            });
        }

        let sample = Sample::new(samples, CHANNELS, SAMPLE_RATE);
        if sample.frames() < chunks * CHUNK_FRAMES {
            warn!(
                "Capture ended early: {:.1}s of {}s recorded",
                sample.duration_secs(),
                seconds
            );
        }
        Ok(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_for_matches_fixed_format() {
        // 44100 / 1024 * 6 = 258.39...
        assert_eq!(chunks_for(6), 258);
        assert_eq!(chunks_for(9), 387);
        assert_eq!(chunks_for(0), 0);
    }

    #[test]
    fn test_sample_accessors() {
        let sample = Sample::new(vec![0, 1, 2, 3, 4, 5, 6, 7], 2, 4);
        assert_eq!(sample.frames(), 4);
        assert_eq!(sample.channels(), 2);
        assert_eq!(sample.bits_per_sample(), 16);
        assert!((sample.duration_secs() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_capture_backend_from_str() {
        assert_eq!(CaptureBackend::from_str("sox").unwrap(), CaptureBackend::Sox);
        assert_eq!(CaptureBackend::from_str("pipewire").unwrap(), CaptureBackend::PwRecord);
        assert_eq!(CaptureBackend::from_str("ALSA").unwrap(), CaptureBackend::Arecord);
        assert!(CaptureBackend::from_str("portaudio").is_err());
    }

    #[test]
    fn test_sox_command_line() {
        let cmd = CaptureBackend::Sox.command("Soundflower (2ch)");
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(cmd.get_program(), "sox");
        assert!(args.windows(3).any(|w| w == ["-t", "coreaudio", "Soundflower (2ch)"]));
        assert!(args.windows(2).any(|w| w == ["-r", "44100"]));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[cfg(unix)]
    #[test]
    fn test_stream_decodes_little_endian_pcm() {
        // printf emits two stereo frames: (1, -1), (256, 0)
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("printf '\\001\\000\\377\\377\\000\\001\\000\\000'");
        let mut stream = CaptureStream::spawn(cmd, "test").unwrap();
        let mut buffer = vec![0u8; 8];
        assert_eq!(stream.read_chunk(&mut buffer), Some(vec![1, -1, 256, 0]));
        assert_eq!(stream.read_chunk(&mut buffer), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_noisy_stderr_does_not_stall_capture() {
        // 256 KiB of diagnostics before any audio, well past a pipe buffer
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            "i=0; while [ $i -lt 4096 ]; do \
               printf '%063d\\n' 0 >&2; i=$((i+1)); \
             done; \
             printf 'warning: overrun\\n' >&2; \
             printf '\\001\\000\\002\\000'",
        );
        let mut stream = CaptureStream::spawn(cmd, "test").unwrap();
        let mut buffer = vec![0u8; 4];
        assert_eq!(stream.read_chunk(&mut buffer), Some(vec![1, 2]));
        assert!(stream.stop().ends_with("warning: overrun"));
    }

    #[test]
    fn test_missing_program_is_device_unavailable() {
        // arecord may exist on Linux hosts; a bogus device must still fail
        let recorder = CommandRecorder::new(CaptureBackend::Arecord);
        let result = recorder.record(&AudioRoute::named("autoid-test-no-such-device"), 1);
        assert!(matches!(result, Err(IdentifyError::DeviceUnavailable { .. })));
    }
}
