use anyhow::Result;
use cpal::traits::{DeviceTrait, HostTrait};

/// Information about an audio device.
#[derive(Debug, Clone)]
pub struct AudioDeviceInfo {
    pub name: String,
    pub is_default: bool,
}

fn collect_devices(
    devices: impl Iterator<Item = cpal::Device>,
    default_name: &str,
) -> Vec<AudioDeviceInfo> {
    devices
        .filter_map(|device| device.name().ok())
        .map(|name| AudioDeviceInfo {
            is_default: name == default_name,
            name,
        })
        .collect()
}

/// List available audio input (microphone) devices.
pub fn list_input_devices() -> Result<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_input_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();
    Ok(collect_devices(host.input_devices()?, &default_name))
}

/// List available audio output (speaker) devices.
pub fn list_output_devices() -> Result<Vec<AudioDeviceInfo>> {
    let host = cpal::default_host();
    let default_name = host
        .default_output_device()
        .and_then(|d| d.name().ok())
        .unwrap_or_default();
    Ok(collect_devices(host.output_devices()?, &default_name))
}

/// Resolve an input device by name, or the default when `None`.
pub fn get_input_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        if let Some(device) = host
            .input_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        {
            return Ok(device);
        }
    }
    host.default_input_device()
        .ok_or_else(|| anyhow::anyhow!("no input device available"))
}

/// Resolve an output device by name, or the default when `None`.
pub fn get_output_device(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    if let Some(name) = name {
        if let Some(device) = host
            .output_devices()?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
        {
            return Ok(device);
        }
    }
    host.default_output_device()
        .ok_or_else(|| anyhow::anyhow!("no output device available"))
}
