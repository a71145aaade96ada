//! Core types shared by the Pipesweep crates: typed experiment
//! configuration, run configurations and outcomes, device ids and errors.

pub mod config;
pub mod device;
pub mod errors;
pub mod run;

pub use config::*;
pub use device::*;
pub use errors::*;
pub use run::*;
