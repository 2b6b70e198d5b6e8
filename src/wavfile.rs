//! Persisting captured samples as WAV files for the fingerprinting engine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use log::debug;

use crate::capture::Sample;
use crate::error::IdentifyError;

/// Writes a [`Sample`] to disk and removes it afterwards.
pub trait SampleWriter {
    /// Write `sample` to `path`, returning the path written.
    fn persist(&self, sample: &Sample, path: &Path) -> Result<PathBuf, IdentifyError>;

    /// Delete `path`. A file that is already gone is not an error.
    fn remove(&self, path: &Path) -> Result<(), IdentifyError>;
}

/// The time-stamped temporary sound file for a session, e.g.
/// `~/Music/recordings/temp_1700000000.wav`.
pub fn session_sound_path(recordings_dir: &Path) -> PathBuf {
    recordings_dir.join(format!("temp_{}.wav", Utc::now().timestamp()))
}

/// [`SampleWriter`] producing canonical 16-bit PCM WAV files.
#[derive(Debug, Default, Clone, Copy)]
pub struct WavSampleWriter;

impl WavSampleWriter {
    fn write(sample: &Sample, path: &Path) -> Result<(), hound::Error> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let spec = hound::WavSpec {
            channels: sample.channels(),
            sample_rate: sample.sample_rate(),
            bits_per_sample: sample.bits_per_sample(),
            sample_format: hound::SampleFormat::Int,
        };

        let mut writer = hound::WavWriter::create(path, spec)?;
        {
            let mut samples = writer.get_i16_writer(sample.samples().len() as u32);
            for &s in sample.samples() {
                samples.write_sample(s);
            }
            samples.flush()?;
        }
        writer.finalize()
    }
}

impl SampleWriter for WavSampleWriter {
    fn persist(&self, sample: &Sample, path: &Path) -> Result<PathBuf, IdentifyError> {
        debug!("Writing {:.1}s sample to {}", sample.duration_secs(), path.display());

        Self::write(sample, path).map_err(|e| {
            // Never leave a truncated file behind for the engine to pick up.
            let _ = fs::remove_file(path);
            IdentifyError::Write {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        Ok(path.to_path_buf())
    }

    fn remove(&self, path: &Path) -> Result<(), IdentifyError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(IdentifyError::Write {
                path: path.to_path_buf(),
                reason: format!("could not remove: {}", e),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stereo_sample(frames: usize) -> Sample {
        let samples = (0..frames * 2).map(|i| (i as i16).wrapping_mul(100)).collect();
        Sample::new(samples, 2, 44100)
    }

    #[test]
    fn test_persist_writes_header_and_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recordings").join("temp_1.wav");
        let sample = stereo_sample(5);

        let written = WavSampleWriter.persist(&sample, &path).unwrap();
        assert_eq!(written, path);

        // 44-byte canonical header + 10 samples * 2 bytes
        assert_eq!(fs::metadata(&path).unwrap().len(), 64);

        let reader = hound::WavReader::open(&path).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.sample_rate, 44100);
        assert_eq!(spec.bits_per_sample, 16);
        let read: Vec<i16> = reader.into_samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(read, sample.samples());
    }

    #[test]
    fn test_persist_overwrites_previous_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.wav");

        WavSampleWriter.persist(&stereo_sample(100), &path).unwrap();
        WavSampleWriter.persist(&stereo_sample(5), &path).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), 64);
    }

    #[test]
    fn test_persist_into_unwritable_location_is_write_error() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is expected
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("temp.wav");

        let err = WavSampleWriter.persist(&stereo_sample(5), &path).unwrap_err();
        assert!(matches!(err, IdentifyError::Write { .. }));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("temp.wav");
        WavSampleWriter.persist(&stereo_sample(5), &path).unwrap();

        WavSampleWriter.remove(&path).unwrap();
        assert!(!path.exists());
        WavSampleWriter.remove(&path).unwrap();
    }

    #[test]
    fn test_session_sound_path_is_timestamped() {
        let path = session_sound_path(Path::new("/music/recordings"));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("temp_"));
        assert!(name.ends_with(".wav"));
        assert!(name["temp_".len()..name.len() - 4].parse::<i64>().is_ok());
        assert_eq!(path.parent().unwrap(), Path::new("/music/recordings"));
    }
}
