//! Audio subsystem module

pub mod capture;
pub mod device;
pub mod frame;
pub mod gain;
pub mod level;

pub use capture::{CaptureDevice, CpalCapture, PatternCapture};
pub use device::{format_device_table, list_input_devices, InputDeviceInfo};
pub use frame::AudioFrame;
pub use gain::apply_gain;
pub use level::LevelMonitor;
