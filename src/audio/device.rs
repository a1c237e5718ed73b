//! Input device enumeration
//!
//! Devices are addressed by their position in the host's input device list,
//! which is what the `--device` flag and `--list` output use.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;

use crate::error::DeviceError;

/// Description of one capture device
#[derive(Debug, Clone, Serialize)]
pub struct InputDeviceInfo {
    /// Position in the host's input device list
    pub index: usize,
    pub name: String,
    /// Maximum input channels across supported configs
    pub max_channels: u16,
    /// Sample rate of the default input config
    pub default_sample_rate: u32,
    pub is_default: bool,
}

/// List all input devices of the default host
pub fn list_input_devices() -> Vec<InputDeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let devices = match host.input_devices() {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("Failed to enumerate input devices: {}", e);
            return Vec::new();
        }
    };

    devices
        .enumerate()
        .filter_map(|(index, device)| {
            let name = device.name().ok()?;
            let max_channels = device
                .supported_input_configs()
                .map(|configs| configs.map(|c| c.channels()).max().unwrap_or(0))
                .unwrap_or(0);
            let default_sample_rate = device
                .default_input_config()
                .map(|c| c.sample_rate().0)
                .unwrap_or(0);
            Some(InputDeviceInfo {
                index,
                is_default: default_name.as_ref() == Some(&name),
                name,
                max_channels,
                default_sample_rate,
            })
        })
        .collect()
}

/// Resolve an input device by index, or the default input when `None`
pub fn input_device(index: Option<usize>) -> Result<cpal::Device, DeviceError> {
    let host = cpal::default_host();
    match index {
        None => host
            .default_input_device()
            .ok_or_else(|| DeviceError::DeviceNotFound("No default input device".to_string())),
        Some(index) => host
            .input_devices()
            .map_err(|e| DeviceError::CpalError(e.to_string()))?
            .nth(index)
            .ok_or_else(|| DeviceError::DeviceNotFound(format!("No input device at index {}", index))),
    }
}

/// Render the device table printed by `--list`
pub fn format_device_table(devices: &[InputDeviceInfo]) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{:<8} {:<40} {:<10} {:<15}\n",
        "Index", "Name", "Channels", "Sample Rate"
    ));
    out.push_str(&"-".repeat(70));
    out.push('\n');
    for device in devices {
        let marker = if device.is_default { " [DEFAULT]" } else { "" };
        out.push_str(&format!(
            "{:<8} {:<40} {:<10} {:<15}{}\n",
            device.index, device.name, device.max_channels, device.default_sample_rate, marker
        ));
    }
    out
}
