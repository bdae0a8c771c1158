//! Audio device references, descriptors and enumeration.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborators::DeviceCatalog;

/// A resolved device choice. Selection policy lives with the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRef {
    /// The host's default device.
    Default,
    /// Position in the host's device list.
    Index(usize),
    /// Exact device name.
    Name(String),
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRef::Default => f.write_str("default"),
            DeviceRef::Index(i) => write!(f, "#{i}"),
            DeviceRef::Name(name) => write!(f, "'{name}'"),
        }
    }
}

/// Metadata about an audio device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub index: usize,
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub is_default: bool,
    pub max_input_channels: u16,
    pub max_output_channels: u16,
    /// Heuristic flag for devices that likely capture system/output audio.
    pub is_loopback_like: bool,
}

impl DeviceDescriptor {
    pub fn device_ref(&self) -> DeviceRef {
        DeviceRef::Index(self.index)
    }
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "blackhole",
    "soundflower",
    "virtual output",
    "monitor of",
    "mix stereo",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "line in",
    "usb",
    "webcam",
];

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for likely speech microphone quality. Higher is better.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    if lowered.contains("default") {
        score += 1;
    }
    score
}

/// Device catalog backed by the default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalCatalog;

#[cfg(feature = "audio-cpal")]
impl DeviceCatalog for CpalCatalog {
    fn list_input_devices(&self) -> Vec<DeviceDescriptor> {
        cpal_backend::list(cpal_backend::Direction::Input)
    }

    fn list_output_devices(&self) -> Vec<DeviceDescriptor> {
        cpal_backend::list(cpal_backend::Direction::Output)
    }
}

#[cfg(not(feature = "audio-cpal"))]
impl DeviceCatalog for CpalCatalog {
    fn list_input_devices(&self) -> Vec<DeviceDescriptor> {
        Vec::new()
    }

    fn list_output_devices(&self) -> Vec<DeviceDescriptor> {
        Vec::new()
    }
}

#[cfg(feature = "audio-cpal")]
pub(crate) mod cpal_backend {
    use cpal::traits::{DeviceTrait, HostTrait};

    use super::{is_loopback_like_name, DeviceDescriptor, DeviceRef};
    use crate::error::{HarkError, Result};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Direction {
        Input,
        Output,
    }

    fn devices(host: &cpal::Host, dir: Direction) -> Result<Vec<cpal::Device>> {
        let list: std::result::Result<Vec<cpal::Device>, cpal::DevicesError> = match dir {
            Direction::Input => host.input_devices().map(|d| d.collect()),
            Direction::Output => host.output_devices().map(|d| d.collect()),
        };
        list.map_err(|e| HarkError::Device(format!("failed to enumerate devices: {e}")))
    }

    fn default_device(host: &cpal::Host, dir: Direction) -> Option<cpal::Device> {
        match dir {
            Direction::Input => host.default_input_device(),
            Direction::Output => host.default_output_device(),
        }
    }

    /// Resolve a reference to a concrete device on the default host.
    pub fn resolve(device: &DeviceRef, dir: Direction) -> Result<cpal::Device> {
        let host = cpal::default_host();
        match device {
            DeviceRef::Default => default_device(&host, dir).ok_or_else(|| match dir {
                Direction::Input => HarkError::NoInputDevice,
                Direction::Output => HarkError::Device("no default output device".into()),
            }),
            DeviceRef::Index(index) => devices(&host, dir)?
                .into_iter()
                .nth(*index)
                .ok_or_else(|| HarkError::Device(format!("no device at index {index}"))),
            DeviceRef::Name(name) => devices(&host, dir)?
                .into_iter()
                .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
                .ok_or_else(|| HarkError::Device(format!("device '{name}' not found"))),
        }
    }

    pub fn list(dir: Direction) -> Vec<DeviceDescriptor> {
        let host = cpal::default_host();
        let default_name = default_device(&host, dir).and_then(|d| d.name().ok());

        let devices = match devices(&host, dir) {
            Ok(devices) => devices,
            Err(e) => {
                tracing::warn!("{e}");
                return Vec::new();
            }
        };

        devices
            .into_iter()
            .enumerate()
            .map(|(index, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Device {}", index + 1));
                let max_input_channels = device
                    .supported_input_configs()
                    .map(|cfgs| cfgs.map(|c| c.channels()).max().unwrap_or(0))
                    .unwrap_or(0);
                let max_output_channels = device
                    .supported_output_configs()
                    .map(|cfgs| cfgs.map(|c| c.channels()).max().unwrap_or(0))
                    .unwrap_or(0);
                DeviceDescriptor {
                    index,
                    is_default: default_name.as_deref() == Some(name.as_str()),
                    is_loopback_like: is_loopback_like_name(&name),
                    name,
                    max_input_channels,
                    max_output_channels,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_loopback_names() {
        assert!(is_loopback_like_name("Stereo Mix (Realtek Audio)"));
        assert!(is_loopback_like_name("BlackHole 2ch"));
        assert!(!is_loopback_like_name("MacBook Pro Microphone"));
    }

    #[test]
    fn scores_mic_higher_than_loopback() {
        let mic = mic_preference_score("Microphone Array (USB PnP Audio Device)");
        let loopback = mic_preference_score("Stereo Mix (Realtek Audio)");
        assert!(mic > loopback);
    }

    #[test]
    fn device_ref_serializes_lowercase() {
        let json = serde_json::to_string(&vec![
            DeviceRef::Default,
            DeviceRef::Index(3),
            DeviceRef::Name("USB Mic".into()),
        ])
        .expect("serialize");
        assert_eq!(json, r#"["default",{"index":3},{"name":"USB Mic"}]"#);
        assert_eq!(DeviceRef::Index(3).to_string(), "#3");
    }
}
