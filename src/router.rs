//! Output routing: which device is playing, which multi-output device mirrors
//! it into the loopback input, and switching between them.

use std::collections::BTreeMap;
use std::fmt;
use std::process::{Command, Stdio};

use log::{debug, warn};

use crate::config::Config;
use crate::error::IdentifyError;

/// An audio device as the OS names it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRoute {
    /// Identifier passed to the OS tools (for `pactl` the sink/source name).
    pub id: String,
    /// Human-readable name.
    pub name: String,
}

impl AudioRoute {
    /// A route whose id and display name are the same string.
    pub fn named(name: &str) -> Self {
        AudioRoute {
            id: name.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for AudioRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Queries and switches the system audio output.
pub trait DeviceRouter {
    /// Output devices currently known to the OS.
    fn list_outputs(&self) -> Result<Vec<AudioRoute>, IdentifyError>;

    /// Input devices currently known to the OS.
    fn list_inputs(&self) -> Result<Vec<AudioRoute>, IdentifyError>;

    /// The output the session should return to. Never fails: when the
    /// preferred device is absent (or listing fails) the fallback is used.
    fn current_output(&self) -> AudioRoute;

    /// The multi-output device paired with `output`. Pure, no I/O.
    fn capture_route_for(&self, output: &AudioRoute) -> AudioRoute;

    /// Make `route` the active system output.
    fn switch_to(&self, route: &AudioRoute) -> Result<(), IdentifyError>;

    /// The loopback input that receives whatever the capture route plays.
    fn loopback_input(&self) -> Result<AudioRoute, IdentifyError>;
}

/// Which OS tool drives the routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RouterBackend {
    /// `SwitchAudioSource` (macOS, CoreAudio)
    #[default]
    SwitchAudioSource,
    /// `pactl` (PulseAudio or PipeWire's pulse server)
    Pactl,
}

impl RouterBackend {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "switchaudiosource" | "coreaudio" => Ok(RouterBackend::SwitchAudioSource),
            "pactl" | "pulse" | "pipewire" => Ok(RouterBackend::Pactl),
            _ => Err(format!("Unsupported router backend: {}", s)),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RouterBackend::SwitchAudioSource => "switchaudiosource",
            RouterBackend::Pactl => "pactl",
        }
    }

    fn list_command(&self, kind: DeviceKind) -> Command {
        match self {
            RouterBackend::SwitchAudioSource => {
                let mut cmd = Command::new("SwitchAudioSource");
                cmd.arg("-a").arg("-t").arg(kind.as_str());
                cmd
            }
            RouterBackend::Pactl => {
                let mut cmd = Command::new("pactl");
                cmd.arg("list").arg("short").arg(match kind {
                    DeviceKind::Output => "sinks",
                    DeviceKind::Input => "sources",
                });
                cmd
            }
        }
    }

    fn switch_command(&self, route: &AudioRoute) -> Command {
        match self {
            RouterBackend::SwitchAudioSource => {
                let mut cmd = Command::new("SwitchAudioSource");
                cmd.arg("-t").arg("output").arg("-s").arg(&route.id);
                cmd
            }
            RouterBackend::Pactl => {
                let mut cmd = Command::new("pactl");
                cmd.arg("set-default-sink").arg(&route.id);
                cmd
            }
        }
    }

    fn parse_devices(&self, output: &str) -> Vec<AudioRoute> {
        match self {
            RouterBackend::SwitchAudioSource => parse_switchaudiosource_output(output),
            RouterBackend::Pactl => parse_pactl_short_output(output),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum DeviceKind {
    Output,
    Input,
}

impl DeviceKind {
    fn as_str(&self) -> &str {
        match self {
            DeviceKind::Output => "output",
            DeviceKind::Input => "input",
        }
    }
}

/// [`DeviceRouter`] backed by the OS command-line tools.
pub struct CommandRouter {
    backend: RouterBackend,
    preferred_output: String,
    fallback_output: String,
    capture_routes: BTreeMap<String, String>,
    default_capture_route: String,
    loopback_input: String,
}

impl CommandRouter {
    pub fn new(
        backend: RouterBackend,
        preferred_output: &str,
        fallback_output: &str,
        capture_routes: BTreeMap<String, String>,
        default_capture_route: &str,
        loopback_input: &str,
    ) -> Self {
        CommandRouter {
            backend,
            preferred_output: preferred_output.to_string(),
            fallback_output: fallback_output.to_string(),
            capture_routes,
            default_capture_route: default_capture_route.to_string(),
            loopback_input: loopback_input.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, IdentifyError> {
        let backend = config.router_backend().map_err(IdentifyError::Config)?;
        Ok(Self::new(
            backend,
            config.preferred_output(),
            config.fallback_output(),
            config.capture_routes(),
            config.default_capture_route(),
            config.loopback_input(),
        ))
    }

    pub fn backend(&self) -> RouterBackend {
        self.backend
    }

    fn list(&self, kind: DeviceKind) -> Result<Vec<AudioRoute>, IdentifyError> {
        let mut cmd = self.backend.list_command(kind);
        debug!("Listing {} devices: {:?}", kind.as_str(), cmd);

        let unavailable = |reason: String| IdentifyError::DeviceUnavailable {
            name: format!("{} device list", kind.as_str()),
            reason,
        };

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| unavailable(format!("failed to run {}: {}", self.backend.as_str(), e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(unavailable(format!("{} ({})", output.status, stderr.trim())));
        }

        Ok(self.backend.parse_devices(&String::from_utf8_lossy(&output.stdout)))
    }
}

impl DeviceRouter for CommandRouter {
    fn list_outputs(&self) -> Result<Vec<AudioRoute>, IdentifyError> {
        self.list(DeviceKind::Output)
    }

    fn list_inputs(&self) -> Result<Vec<AudioRoute>, IdentifyError> {
        self.list(DeviceKind::Input)
    }

    fn current_output(&self) -> AudioRoute {
        let outputs = match self.list_outputs() {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("{}; assuming '{}'", e, self.fallback_output);
                Vec::new()
            }
        };
        match find_device(&self.preferred_output, &outputs) {
            Some(route) => route.clone(),
            None => AudioRoute::named(&self.fallback_output),
        }
    }

    fn capture_route_for(&self, output: &AudioRoute) -> AudioRoute {
        capture_route_for(&self.capture_routes, &self.default_capture_route, output)
    }

    fn switch_to(&self, route: &AudioRoute) -> Result<(), IdentifyError> {
        let mut cmd = self.backend.switch_command(route);
        debug!("Switching output: {:?}", cmd);

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .map_err(|e| IdentifyError::RouteSwitchFailed {
                route: route.name.clone(),
                reason: format!("failed to run {}: {}", self.backend.as_str(), e),
            })?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(IdentifyError::RouteSwitchFailed {
                route: route.name.clone(),
                reason: format!("{} {}", output.status, stderr.trim()).trim().to_string(),
            })
        }
    }

    fn loopback_input(&self) -> Result<AudioRoute, IdentifyError> {
        let inputs = self.list_inputs()?;
        find_device(&self.loopback_input, &inputs)
            .cloned()
            .ok_or_else(|| IdentifyError::DeviceNotFound {
                name: self.loopback_input.clone(),
            })
    }
}

/// Look up a device by id or display name.
pub fn find_device<'a>(sought: &str, devices: &'a [AudioRoute]) -> Option<&'a AudioRoute> {
    devices.iter().find(|d| d.name == sought || d.id == sought)
}

/// Map an output to its capture route; unmapped outputs share the default route.
pub fn capture_route_for(
    routes: &BTreeMap<String, String>,
    default_route: &str,
    output: &AudioRoute,
) -> AudioRoute {
    let name = routes
        .get(&output.name)
        .or_else(|| routes.get(&output.id))
        .map(String::as_str)
        .unwrap_or(default_route);
    AudioRoute::named(name)
}

/// `SwitchAudioSource -a` prints one device per line, optionally followed by
/// a ` (output)` / ` (input)` tag in older releases.
fn parse_switchaudiosource_output(output: &str) -> Vec<AudioRoute> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            let name = line
                .strip_suffix(" (output)")
                .or_else(|| line.strip_suffix(" (input)"))
                .unwrap_or(line);
            AudioRoute::named(name)
        })
        .collect()
}

/// `pactl list short sinks|sources` prints tab-separated
/// `index  name  driver  format  state` rows.
fn parse_pactl_short_output(output: &str) -> Vec<AudioRoute> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let _index = fields.next()?;
            let name = fields.next()?.trim();
            if name.is_empty() {
                None
            } else {
                Some(AudioRoute::named(name))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> BTreeMap<String, String> {
        BTreeMap::from([(
            "USB Audio Device".to_string(),
            "Multi-Output Device (USB)".to_string(),
        )])
    }

    #[test]
    fn test_parse_switchaudiosource_output() {
        let output = "Built-in Output\nUSB Audio Device (output)\n\nMulti-Output Device (USB)\n";
        let devices = parse_switchaudiosource_output(output);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[1].name, "USB Audio Device");
        assert_eq!(devices[2].name, "Multi-Output Device (USB)");
    }

    #[test]
    fn test_parse_pactl_short_output() {
        let output = "47\talsa_output.pci-0000_00_1f.3.analog-stereo\tPipeWire\ts32le 2ch 48000Hz\tSUSPENDED\n\
                      52\tloopback.monitor\tPipeWire\ts16le 2ch 44100Hz\tRUNNING\n";
        let devices = parse_pactl_short_output(output);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].id, "alsa_output.pci-0000_00_1f.3.analog-stereo");
        assert_eq!(devices[1].name, "loopback.monitor");
    }

    #[test]
    fn test_capture_route_mapping() {
        let usb = AudioRoute::named("USB Audio Device");
        let builtin = AudioRoute::named("Built-in Output");
        let default_route = "Multi-Output Device (Built-in)";

        assert_eq!(
            capture_route_for(&routes(), default_route, &usb).name,
            "Multi-Output Device (USB)"
        );
        assert_eq!(capture_route_for(&routes(), default_route, &builtin).name, default_route);
    }

    #[test]
    fn test_capture_route_is_deterministic() {
        let usb = AudioRoute::named("USB Audio Device");
        let a = capture_route_for(&routes(), "x", &usb);
        let b = capture_route_for(&routes(), "x", &usb);
        assert_eq!(a, b);
    }

    #[test]
    fn test_find_device_by_id_or_name() {
        let devices = vec![
            AudioRoute { id: "sink.1".to_string(), name: "Speakers".to_string() },
            AudioRoute::named("Soundflower (2ch)"),
        ];
        assert_eq!(find_device("Speakers", &devices).unwrap().id, "sink.1");
        assert_eq!(find_device("sink.1", &devices).unwrap().name, "Speakers");
        assert!(find_device("Soundflower (64ch)", &devices).is_none());
    }

    #[test]
    fn test_router_backend_from_str() {
        assert_eq!(RouterBackend::from_str("pactl").unwrap(), RouterBackend::Pactl);
        assert_eq!(
            RouterBackend::from_str("SwitchAudioSource").unwrap(),
            RouterBackend::SwitchAudioSource
        );
        assert!(RouterBackend::from_str("alsa").is_err());
    }

    #[test]
    fn test_missing_tool_is_a_switch_failure() {
        // The router tools are not expected on CI machines; either way the
        // switch must report an error rather than pretend to succeed.
        let router = CommandRouter::new(
            RouterBackend::SwitchAudioSource,
            "USB Audio Device",
            "Built-in Output",
            routes(),
            "Multi-Output Device (Built-in)",
            "Soundflower (2ch)",
        );
        let route = AudioRoute::named("definitely-not-a-device-autoid-test");
        assert!(router.switch_to(&route).is_err());
    }

    #[test]
    fn test_current_output_never_fails() {
        let router = CommandRouter::new(
            RouterBackend::SwitchAudioSource,
            "definitely-not-a-device-autoid-test",
            "Built-in Output",
            routes(),
            "Multi-Output Device (Built-in)",
            "Soundflower (2ch)",
        );
        assert_eq!(router.current_output().name, "Built-in Output");
    }
}
