//! Accelerator device identifiers and the `use_gpu` selection policy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Accelerator device index, as reported by the driver.
pub type DeviceId = u32;

/// Which devices an experiment may use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawGpuSelection", into = "RawGpuSelection")]
pub enum GpuSelection {
    /// Run everything on the CPU.
    #[default]
    Disabled,
    /// Every visible device that passes the memory criterion.
    All,
    /// An explicit set of device ids (a single int is a one-element set).
    Devices(Vec<DeviceId>),
}

impl GpuSelection {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl fmt::Display for GpuSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "false"),
            Self::All => write!(f, "\"all\""),
            Self::Devices(ids) => write!(f, "{ids:?}"),
        }
    }
}

/// Wire shape of `use_gpu`: `false`, `"all"`, an int or a list of ints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawGpuSelection {
    Flag(bool),
    Tag(String),
    One(i64),
    Many(Vec<i64>),
}

const DEVICE_HINT: &str = "expected false, \"all\", a device id or a list of device ids";

fn device_id(raw: i64) -> Result<DeviceId, ConfigError> {
    DeviceId::try_from(raw).map_err(|_| ConfigError::UnsupportedDeviceSelection {
        value: raw.to_string(),
        hint: "device ids are non-negative integers".to_string(),
    })
}

impl TryFrom<RawGpuSelection> for GpuSelection {
    type Error = ConfigError;

    fn try_from(raw: RawGpuSelection) -> Result<Self, Self::Error> {
        match raw {
            RawGpuSelection::Flag(false) => Ok(Self::Disabled),
            RawGpuSelection::Flag(true) => Err(ConfigError::UnsupportedDeviceSelection {
                value: "true".to_string(),
                hint: format!("{DEVICE_HINT}; use \"all\" to select every visible device"),
            }),
            RawGpuSelection::Tag(tag) if tag == "all" => Ok(Self::All),
            RawGpuSelection::Tag(tag) => Err(ConfigError::UnsupportedDeviceSelection {
                value: format!("\"{tag}\""),
                hint: DEVICE_HINT.to_string(),
            }),
            RawGpuSelection::One(id) => Ok(Self::Devices(vec![device_id(id)?])),
            RawGpuSelection::Many(ids) if ids.is_empty() => {
                Err(ConfigError::UnsupportedDeviceSelection {
                    value: "[]".to_string(),
                    hint: "an empty device list selects nothing; use false to disable devices"
                        .to_string(),
                })
            }
            RawGpuSelection::Many(ids) => {
                let mut devices = Vec::with_capacity(ids.len());
                for id in ids {
                    let id = device_id(id)?;
                    if !devices.contains(&id) {
                        devices.push(id);
                    }
                }
                Ok(Self::Devices(devices))
            }
        }
    }
}

impl From<GpuSelection> for RawGpuSelection {
    fn from(selection: GpuSelection) -> Self {
        match selection {
            GpuSelection::Disabled => Self::Flag(false),
            GpuSelection::All => Self::Tag("all".to_string()),
            GpuSelection::Devices(ids) => Self::Many(ids.into_iter().map(i64::from).collect()),
        }
    }
}
