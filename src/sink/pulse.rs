//! PulseAudio virtual microphone
//!
//! Registers a FIFO as a `module-pipe-source` through `pactl`. The source
//! then appears as an ordinary input device and PulseAudio reads the FIFO
//! continuously while an application records from it.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::error::DeviceError;
use crate::sink::fifo::{create_fifo, fifo_path, remove_fifo, FifoWriter};
use crate::sink::{ByteSink, VirtualSink};

/// 100 % in PulseAudio volume units
const PA_VOLUME_NORM: u32 = 0x10000;

/// Time PulseAudio needs before a new source can be configured
const SOURCE_SETTLE_TIME: Duration = Duration::from_millis(500);

/// `module-pipe-source` backed virtual input device
pub struct PulsePipeSource {
    name: String,
    fifo: PathBuf,
    module_index: Option<u32>,
    source_index: Option<u32>,
}

impl PulsePipeSource {
    /// Create the device. Fails if PulseAudio is unavailable or the module
    /// cannot be loaded; nothing is left behind in that case.
    pub fn create(name: &str, sample_rate: u32, channels: u16) -> Result<Self, DeviceError> {
        validate_name(name)?;
        pactl(&["--version"]).map_err(|e| {
            DeviceError::SubsystemUnavailable(format!("PulseAudio (pactl) not usable: {}", e))
        })?;

        // A previous run that died without cleanup leaves the module loaded
        match pactl(&["list", "short", "modules"]) {
            Ok(listing) => {
                for index in find_stale_modules(&listing, name) {
                    match pactl(&["unload-module", &index.to_string()]) {
                        Ok(_) => tracing::info!("Unloaded stale module {}", index),
                        Err(e) => tracing::warn!("Could not unload stale module {}: {}", index, e),
                    }
                }
            }
            Err(e) => tracing::warn!("Could not list PulseAudio modules: {}", e),
        }

        let fifo = fifo_path(name);
        create_fifo(&fifo)?;

        let args = module_args(name, &fifo, sample_rate, channels);
        let mut cmd: Vec<&str> = vec!["load-module", "module-pipe-source"];
        cmd.extend(args.iter().map(String::as_str));

        let module_index = match pactl(&cmd).and_then(|out| {
            parse_module_index(&out)
                .ok_or_else(|| format!("unexpected load-module output: {:?}", out.trim()))
        }) {
            Ok(index) => index,
            Err(e) => {
                if let Err(cleanup) = remove_fifo(&fifo) {
                    tracing::warn!("{}", cleanup);
                }
                return Err(DeviceError::CreateFailed(e));
            }
        };

        tracing::info!(
            "Created virtual audio source '{}' (module {}, {} Hz, {} ch)",
            name,
            module_index,
            sample_rate,
            channels
        );

        let mut source = Self {
            name: name.to_string(),
            fifo,
            module_index: Some(module_index),
            source_index: None,
        };
        std::thread::sleep(SOURCE_SETTLE_TIME);
        source.configure();
        Ok(source)
    }

    /// Path of the backing FIFO
    pub fn fifo(&self) -> &Path {
        &self.fifo
    }

    pub fn module_index(&self) -> Option<u32> {
        self.module_index
    }

    /// Unmute the source and set it to 100 %. Failures only warn; the device
    /// still works, the user may have to unmute it by hand.
    fn configure(&mut self) {
        if let Ok(listing) = pactl(&["list", "short", "sources"]) {
            self.source_index = find_source_index(&listing, &self.name);
        }

        let target = self.name.clone();
        let volume = PA_VOLUME_NORM.to_string();
        let unmuted = pactl(&["set-source-mute", &target, "0"]);
        let leveled = pactl(&["set-source-volume", &target, &volume]);

        match (unmuted, leveled) {
            (Ok(_), Ok(_)) => tracing::info!("Configured virtual source (unmuted, volume 100%)"),
            (a, b) => {
                let err = a.err().or(b.err()).unwrap_or_default();
                tracing::warn!(
                    "Could not fully configure virtual source: {}. Try: pactl set-source-mute {} 0",
                    err,
                    self.source_index
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| self.name.clone())
                );
            }
        }
    }
}

impl VirtualSink for PulsePipeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn writer(&mut self) -> Result<Box<dyn ByteSink>, DeviceError> {
        if self.module_index.is_none() {
            return Err(DeviceError::WriteFailed("device destroyed".to_string()));
        }
        Ok(Box::new(FifoWriter::new(&self.fifo)))
    }

    fn destroy(&mut self) -> Result<(), DeviceError> {
        let mut result = Ok(());

        if let Some(index) = self.module_index.take() {
            match pactl(&["unload-module", &index.to_string()]) {
                Ok(_) => tracing::info!("Unloaded PulseAudio module {}", index),
                Err(e) => {
                    result = Err(DeviceError::TeardownFailed(format!(
                        "unload-module {}: {}",
                        index, e
                    )))
                }
            }
        }

        if let Err(e) = remove_fifo(&self.fifo) {
            if result.is_ok() {
                result = Err(e);
            }
        }
        result
    }
}

impl Drop for PulsePipeSource {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::warn!("Virtual device teardown failed: {}", e);
        }
    }
}

/// Names end up unquoted in module arguments
fn validate_name(name: &str) -> Result<(), DeviceError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(DeviceError::CreateFailed(format!(
            "invalid device name '{}': use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

/// Run `pactl` and return stdout
fn pactl(args: &[&str]) -> Result<String, String> {
    let output = Command::new("pactl")
        .args(args)
        .output()
        .map_err(|e| format!("pactl: {}", e))?;
    if !output.status.success() {
        return Err(format!(
            "pactl {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn module_args(name: &str, fifo: &Path, sample_rate: u32, channels: u16) -> Vec<String> {
    vec![
        format!("source_name={}", name),
        format!("file={}", fifo.display()),
        "format=s16le".to_string(),
        format!("rate={}", sample_rate),
        format!("channels={}", channels),
        format!("source_properties=device.description={}", name),
    ]
}

fn parse_module_index(output: &str) -> Option<u32> {
    output.trim().parse().ok()
}

/// Indices of pipe-source modules already registered under `name`
fn find_stale_modules(listing: &str, name: &str) -> Vec<u32> {
    let wanted = format!("source_name={}", name);
    listing
        .lines()
        .filter_map(|line| {
            let mut cols = line.split('\t');
            let index = cols.next()?.trim().parse().ok()?;
            let module = cols.next()?;
            let args = cols.next().unwrap_or("");
            (module == "module-pipe-source" && args.split_whitespace().any(|a| a == wanted))
                .then_some(index)
        })
        .collect()
}

fn find_source_index(listing: &str, name: &str) -> Option<u32> {
    listing.lines().find_map(|line| {
        let mut cols = line.split('\t');
        let index = cols.next()?.trim().parse().ok()?;
        (cols.next()? == name).then_some(index)
    })
}
