//! Device probes report the memory state of every accelerator on the host.

use std::process::Command;

use parking_lot::Mutex;
use ps_types::{DeviceId, ResourceError};
use serde::{Deserialize, Serialize};

/// Memory state of one device at the time of the probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceMemory {
    pub id: DeviceId,
    pub total_mib: u64,
    pub free_mib: u64,
}

impl DeviceMemory {
    /// Fraction of memory currently free, in `0.0..=1.0`.
    pub fn free_fraction(&self) -> f64 {
        if self.total_mib == 0 {
            return 0.0;
        }
        self.free_mib.min(self.total_mib) as f64 / self.total_mib as f64
    }
}

/// Source of device memory information.
pub trait DeviceProbe: Send + Sync {
    /// Every device the driver reports, ignoring any visibility restriction.
    fn snapshot(&self) -> Result<Vec<DeviceMemory>, ResourceError>;

    /// Human-readable probe name.
    fn name(&self) -> &str;
}

// ---- nvidia-smi ----

/// Probe backed by `nvidia-smi`.
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: String,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Parse `index, memory.total, memory.free` CSV rows without units.
    pub fn parse_output(output: &str) -> Result<Vec<DeviceMemory>, ResourceError> {
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let fields: Vec<&str> = line.split(',').map(str::trim).collect();
                let parsed = match fields.as_slice() {
                    [id, total, free] => id
                        .parse::<DeviceId>()
                        .ok()
                        .zip(total.parse::<u64>().ok())
                        .zip(free.parse::<u64>().ok())
                        .map(|((id, total_mib), free_mib)| DeviceMemory {
                            id,
                            total_mib,
                            free_mib,
                        }),
                    _ => None,
                };
                parsed.ok_or_else(|| ResourceError::Probe {
                    message: format!("unexpected nvidia-smi row: '{line}'"),
                })
            })
            .collect()
    }
}

impl DeviceProbe for NvidiaSmiProbe {
    fn snapshot(&self) -> Result<Vec<DeviceMemory>, ResourceError> {
        // nvidia-smi reports physical indices regardless of visibility, the
        // restriction is applied by the tracker.
        let output = Command::new(&self.binary)
            .args([
                "--query-gpu=index,memory.total,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .map_err(|e| ResourceError::Probe {
                message: format!("failed to execute {}: {e}", self.binary),
            })?;

        if !output.status.success() {
            return Err(ResourceError::Probe {
                message: format!(
                    "{} exited with {}: {}",
                    self.binary,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Self::parse_output(&String::from_utf8_lossy(&output.stdout))
    }

    fn name(&self) -> &str {
        "nvidia-smi"
    }
}

// ---- simulated ----

/// In-memory probe whose device load can be changed while in use.
#[derive(Debug, Default)]
pub struct SimulatedProbe {
    devices: Mutex<Vec<DeviceMemory>>,
}

const SIMULATED_TOTAL_MIB: u64 = 16_384;

impl SimulatedProbe {
    /// Devices given as `(id, free fraction)` pairs.
    pub fn new(devices: impl IntoIterator<Item = (DeviceId, f64)>) -> Self {
        let devices = devices
            .into_iter()
            .map(|(id, free)| DeviceMemory {
                id,
                total_mib: SIMULATED_TOTAL_MIB,
                free_mib: free_mib(free),
            })
            .collect();
        Self {
            devices: Mutex::new(devices),
        }
    }

    /// Change the free fraction of a device; unknown ids are added.
    pub fn set_free_fraction(&self, id: DeviceId, free: f64) {
        let mut devices = self.devices.lock();
        match devices.iter_mut().find(|d| d.id == id) {
            Some(device) => device.free_mib = free_mib(free),
            None => devices.push(DeviceMemory {
                id,
                total_mib: SIMULATED_TOTAL_MIB,
                free_mib: free_mib(free),
            }),
        }
    }
}

fn free_mib(fraction: f64) -> u64 {
    (fraction.clamp(0.0, 1.0) * SIMULATED_TOTAL_MIB as f64).round() as u64
}

impl DeviceProbe for SimulatedProbe {
    fn snapshot(&self) -> Result<Vec<DeviceMemory>, ResourceError> {
        Ok(self.devices.lock().clone())
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
