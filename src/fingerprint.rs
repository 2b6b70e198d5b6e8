//! Fingerprinting through an external matching engine.
//!
//! The engine is a separate program that takes a sound file and prints one
//! JSON object on stdout. Two output dialects are understood:
//!
//! * `result-json`: `{"result": {...}}` on a match, `{"result": null}` on a
//!   miss and `{"error": "..."}` when the engine itself failed.
//! * `songrec`: the output of `songrec audio-file-to-recognized-song`, where
//!   a `track` object signals a match.
//!
//! The matched payload is passed through untouched; [`TrackInfo`] only pulls
//! out the few fields the rest of the program needs, tolerating the key
//! names used by different engine versions.

use std::fmt;
use std::path::Path;
use std::process::{Command, Stdio};

use log::debug;
use serde_json::{Map, Value};

use crate::config::Config;
use crate::error::IdentifyError;

const ARTIST_KEYS: &[&str] = &["artist", "artist_name", "artistName"];
const ALBUM_KEYS: &[&str] = &["album", "album_name", "albumName", "release"];
const TITLE_KEYS: &[&str] = &["track", "title", "track_name", "trackName"];

/// A matched recording as reported by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackInfo {
    pub artist: Option<String>,
    pub album: Option<String>,
    pub title: Option<String>,
    /// The engine's result object, verbatim.
    pub fields: Map<String, Value>,
}

impl TrackInfo {
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        TrackInfo {
            artist: first_string(&fields, ARTIST_KEYS),
            album: first_string(&fields, ALBUM_KEYS),
            title: first_string(&fields, TITLE_KEYS),
            fields,
        }
    }

    /// Artist and album, when both are known (needed for catalog lookups).
    pub fn artist_album(&self) -> Option<(&str, &str)> {
        Some((self.artist.as_deref()?, self.album.as_deref()?))
    }

    /// The payload rendered as `key - value` lines.
    pub fn pretty(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| match v {
                Value::String(s) => format!("{} - {}", k, s),
                other => format!("{} - {}", k, other),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for TrackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let artist = self.artist.as_deref().unwrap_or("Unknown Artist");
        match (&self.title, &self.album) {
            (Some(t), Some(a)) => write!(f, "{} - {} ({})", artist, t, a),
            (Some(t), None) => write!(f, "{} - {}", artist, t),
            (None, Some(a)) => write!(f, "{} - {}", artist, a),
            (None, None) => write!(f, "{}", artist),
        }
    }
}

fn first_string(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| fields.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

/// Result of one fingerprinting attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched(TrackInfo),
    Unmatched,
    EngineError(String),
}

/// Identifies the recording in a sound file.
pub trait Fingerprinter {
    fn identify(&self, path: &Path) -> Result<MatchResult, IdentifyError>;
}

/// Output dialect spoken by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineFormat {
    #[default]
    ResultJson,
    Songrec,
}

impl EngineFormat {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "result-json" | "result" | "gracenote" => Ok(EngineFormat::ResultJson),
            "songrec" | "shazam" => Ok(EngineFormat::Songrec),
            _ => Err(format!("Unsupported engine format: {}", s)),
        }
    }

    /// Interpret the engine's stdout.
    pub fn parse(&self, stdout: &str) -> MatchResult {
        match self {
            EngineFormat::ResultJson => parse_result_json(stdout),
            EngineFormat::Songrec => parse_songrec_output(stdout),
        }
    }
}

/// Parse `{"result": ...}` / `{"error": ...}` output.
pub fn parse_result_json(stdout: &str) -> MatchResult {
    let json: Value = match serde_json::from_str(stdout.trim()) {
        Ok(v) => v,
        Err(e) => return MatchResult::EngineError(format!("unparseable engine output: {}", e)),
    };

    let obj = match json.as_object() {
        Some(o) => o,
        None => return MatchResult::EngineError("engine output is not a JSON object".to_string()),
    };

    if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
        let msg = err.as_str().map(String::from).unwrap_or_else(|| err.to_string());
        return MatchResult::EngineError(msg);
    }

    match obj.get("result") {
        None | Some(Value::Null) => MatchResult::Unmatched,
        Some(Value::Object(fields)) => MatchResult::Matched(TrackInfo::from_fields(fields.clone())),
        Some(other) => MatchResult::EngineError(format!("malformed result: {}", other)),
    }
}

/// Parse `songrec audio-file-to-recognized-song` output.
pub fn parse_songrec_output(stdout: &str) -> MatchResult {
    let json: Value = match serde_json::from_str(stdout.trim()) {
        Ok(v) => v,
        Err(e) => return MatchResult::EngineError(format!("unparseable songrec output: {}", e)),
    };

    let track = match json.get("track").and_then(Value::as_object) {
        Some(t) => t,
        None => return MatchResult::Unmatched,
    };

    let mut fields = Map::new();
    if let Some(title) = track.get("title").and_then(Value::as_str) {
        fields.insert("track".to_string(), Value::String(title.to_string()));
    }
    if let Some(artist) = track.get("subtitle").and_then(Value::as_str) {
        fields.insert("artist".to_string(), Value::String(artist.to_string()));
    }

    // Album lives in the "SONG" section's metadata list
    let album = track
        .get("sections")
        .and_then(Value::as_array)
        .and_then(|sections| {
            sections.iter().find(|s| s.get("type").and_then(Value::as_str) == Some("SONG"))
        })
        .and_then(|section| section.get("metadata"))
        .and_then(Value::as_array)
        .and_then(|items| {
            items.iter().find(|i| i.get("title").and_then(Value::as_str) == Some("Album"))
        })
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str);
    if let Some(album) = album {
        fields.insert("album".to_string(), Value::String(album.to_string()));
    }

    for key in ["key", "url"] {
        if let Some(v) = track.get(key) {
            fields.insert(key.to_string(), v.clone());
        }
    }

    MatchResult::Matched(TrackInfo::from_fields(fields))
}

/// [`Fingerprinter`] running the engine as a subprocess.
pub struct EngineFingerprinter {
    program: String,
    args: Vec<String>,
    format: EngineFormat,
}

impl EngineFingerprinter {
    /// `args` may contain `{file}`, which is replaced by the sound-file path;
    /// otherwise the path is appended as the last argument.
    pub fn new(program: &str, args: Vec<String>, format: EngineFormat) -> Self {
        EngineFingerprinter {
            program: program.to_string(),
            args,
            format,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, IdentifyError> {
        let format = config.engine_format().map_err(IdentifyError::Config)?;
        Ok(Self::new(config.engine_program(), config.engine_args(), format))
    }

    fn command(&self, path: &Path) -> Command {
        let file = path.to_string_lossy();
        let mut cmd = Command::new(&self.program);
        let mut substituted = false;
        for arg in &self.args {
            if arg.contains("{file}") {
                substituted = true;
                cmd.arg(arg.replace("{file}", &file));
            } else {
                cmd.arg(arg);
            }
        }
        if !substituted {
            cmd.arg(path);
        }
        cmd
    }
}

impl Fingerprinter for EngineFingerprinter {
    fn identify(&self, path: &Path) -> Result<MatchResult, IdentifyError> {
        let mut cmd = self.command(path);
        debug!("Running engine: {:?}", cmd);

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| IdentifyError::EngineLaunch {
                program: self.program.clone(),
                reason: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let result = self.format.parse(&stdout);

        // A failing exit status only matters when stdout didn't explain itself
        if !output.status.success() {
            if let MatchResult::EngineError(msg) = &result {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = if stderr.trim().is_empty() { msg.as_str() } else { stderr.trim() };
                return Ok(MatchResult::EngineError(format!("{} exited with {}: {}",
                                                           self.program, output.status, detail)));
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_json_match() {
        let out = r#"{"result": {
"album": "Endtroducing.....",
"track": "Midnight in a Perfect World",
"artist": "DJ Shadow"
}
}"#;
        match parse_result_json(out) {
            MatchResult::Matched(track) => {
                assert_eq!(track.artist.as_deref(), Some("DJ Shadow"));
                assert_eq!(track.album.as_deref(), Some("Endtroducing....."));
                assert_eq!(track.title.as_deref(), Some("Midnight in a Perfect World"));
                assert_eq!(track.artist_album(), Some(("DJ Shadow", "Endtroducing.....")));
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_result_json_alias_keys_and_extra_fields() {
        let out = r#"{"result": {"artist_name": "Air", "album_name": "Moon Safari", "genre": "Electronic", "year": 1998}}"#;
        let track = match parse_result_json(out) {
            MatchResult::Matched(t) => t,
            other => panic!("expected match, got {:?}", other),
        };
        assert_eq!(track.artist.as_deref(), Some("Air"));
        assert_eq!(track.album.as_deref(), Some("Moon Safari"));
        assert!(track.title.is_none());
        assert_eq!(track.fields.get("year"), Some(&Value::from(1998)));
        assert!(track.pretty().contains("genre - Electronic"));
    }

    #[test]
    fn test_result_json_null_is_unmatched() {
        assert_eq!(parse_result_json("\n{\"result\": null}\n"), MatchResult::Unmatched);
        assert_eq!(parse_result_json("{}"), MatchResult::Unmatched);
    }

    #[test]
    fn test_result_json_error() {
        let out = r#"{"error": "Failed to open input file: /tmp/x.wav"}"#;
        assert_eq!(
            parse_result_json(out),
            MatchResult::EngineError("Failed to open input file: /tmp/x.wav".to_string())
        );
    }

    #[test]
    fn test_result_json_garbage_is_engine_error() {
        assert!(matches!(parse_result_json("Segmentation fault"), MatchResult::EngineError(_)));
        assert!(matches!(parse_result_json("[1, 2]"), MatchResult::EngineError(_)));
        assert!(matches!(parse_result_json(r#"{"result": "yes"}"#), MatchResult::EngineError(_)));
    }

    #[test]
    fn test_songrec_match() {
        let out = r#"{"matches": [{"id": "1"}], "track": {
            "key": "12345",
            "title": "Teardrop",
            "subtitle": "Massive Attack",
            "sections": [
                {"type": "SONG", "metadata": [
                    {"title": "Album", "text": "Mezzanine"},
                    {"title": "Released", "text": "1998"}
                ]}
            ]
        }}"#;
        match parse_songrec_output(out) {
            MatchResult::Matched(track) => {
                assert_eq!(track.artist.as_deref(), Some("Massive Attack"));
                assert_eq!(track.album.as_deref(), Some("Mezzanine"));
                assert_eq!(track.title.as_deref(), Some("Teardrop"));
                assert_eq!(track.fields.get("key"), Some(&Value::from("12345")));
            }
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[test]
    fn test_songrec_no_track_is_unmatched() {
        assert_eq!(parse_songrec_output(r#"{"matches": []}"#), MatchResult::Unmatched);
    }

    #[test]
    fn test_file_placeholder_substitution() {
        let engine = EngineFingerprinter::new(
            "./sample",
            vec!["123".to_string(), "ABC".to_string(), "licence.txt".to_string(), "{file}".to_string()],
            EngineFormat::ResultJson,
        );
        let cmd = engine.command(Path::new("/tmp/temp_1.wav"));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["123", "ABC", "licence.txt", "/tmp/temp_1.wav"]);
    }

    #[test]
    fn test_path_appended_without_placeholder() {
        let engine = EngineFingerprinter::new(
            "songrec",
            vec!["audio-file-to-recognized-song".to_string()],
            EngineFormat::Songrec,
        );
        let cmd = engine.command(Path::new("a.wav"));
        let args: Vec<String> = cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["audio-file-to-recognized-song", "a.wav"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_subprocess_roundtrip() {
        let engine = EngineFingerprinter::new(
            "sh",
            vec![
                "-c".to_string(),
                r#"printf '{"result": {"artist": "%s", "album": "X"}}' "$1""#.to_string(),
                "sh".to_string(),
                "{file}".to_string(),
            ],
            EngineFormat::ResultJson,
        );
        match engine.identify(Path::new("Someone")).unwrap() {
            MatchResult::Matched(track) => assert_eq!(track.artist.as_deref(), Some("Someone")),
            other => panic!("expected match, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_engine_failure_status_reports_stderr() {
        let engine = EngineFingerprinter::new(
            "sh",
            vec!["-c".to_string(), "echo licence expired >&2; exit 3".to_string()],
            EngineFormat::ResultJson,
        );
        match engine.identify(Path::new("x.wav")).unwrap() {
            MatchResult::EngineError(msg) => assert!(msg.contains("licence expired")),
            other => panic!("expected engine error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_engine_is_launch_error() {
        let engine = EngineFingerprinter::new("/nonexistent/autoid-engine", vec![], EngineFormat::ResultJson);
        assert!(matches!(
            engine.identify(Path::new("x.wav")),
            Err(IdentifyError::EngineLaunch { .. })
        ));
    }
}
