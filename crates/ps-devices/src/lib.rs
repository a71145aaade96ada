//! # ps-devices
//!
//! Accelerator probing and availability tracking. A [`DeviceProbe`] reports
//! per-device memory; [`query_free`] filters the requested devices by free
//! memory fraction and the process visibility allow-list, and a
//! [`DeviceTracker`] hands the resulting devices out to runs.

mod probe;
mod tracker;

pub use probe::{DeviceMemory, DeviceProbe, NvidiaSmiProbe, SimulatedProbe};
pub use tracker::{
    parse_visible_devices, query_free, visible_devices_from_env, Assignment, DeviceRequest,
    DeviceTracker, FreeDevices, Shortfall, VISIBILITY_ENV,
};
