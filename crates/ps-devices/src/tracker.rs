//! Device availability tracking.
//!
//! [`query_free`] answers which of the requested devices currently pass the
//! free-memory criterion. [`DeviceTracker`] keeps the resulting device set for
//! the length of an experiment, hands devices out to runs and keeps claim
//! accounting so two runs of this process never share a device.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use ps_types::{DeviceId, GpuSelection, ResourceError};
use tracing::{debug, info, warn};

use crate::probe::{DeviceMemory, DeviceProbe};

/// Environment variable restricting which devices the process may use.
pub const VISIBILITY_ENV: &str = "CUDA_VISIBLE_DEVICES";

/// Parse a visibility allow-list such as `"0,2,3"`.
///
/// An empty value means no restriction.
pub fn parse_visible_devices(value: &str) -> Result<Option<Vec<DeviceId>>, ResourceError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    value
        .split(',')
        .map(|id| id.trim().parse::<DeviceId>())
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
        .map_err(|_| ResourceError::InvalidVisibility {
            value: value.to_string(),
        })
}

/// Read the visibility allow-list from the process environment.
///
/// Called once at startup; runs receive their device explicitly.
pub fn visible_devices_from_env() -> Result<Option<Vec<DeviceId>>, ResourceError> {
    match std::env::var(VISIBILITY_ENV) {
        Ok(value) => parse_visible_devices(&value),
        Err(_) => Ok(None),
    }
}

/// Which devices a query considers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRequest {
    /// Every visible device.
    All,
    /// An explicit list of device ids.
    Explicit(Vec<DeviceId>),
}

impl DeviceRequest {
    /// `None` when devices are disabled.
    pub fn from_selection(selection: &GpuSelection) -> Option<Self> {
        match selection {
            GpuSelection::Disabled => None,
            GpuSelection::All => Some(Self::All),
            GpuSelection::Devices(ids) => Some(Self::Explicit(ids.clone())),
        }
    }
}

/// Fewer devices passed the memory criterion than were requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shortfall {
    pub requested: Vec<DeviceId>,
    pub available: Vec<DeviceId>,
}

/// Answer of [`query_free`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeDevices {
    pub devices: Vec<DeviceId>,
    pub shortfall: Option<Shortfall>,
}

fn is_free(snapshot: &[DeviceMemory], id: DeviceId, threshold: f64) -> bool {
    snapshot
        .iter()
        .find(|d| d.id == id)
        .is_some_and(|d| d.free_fraction() >= threshold)
}

/// Devices among the requested candidates whose free-memory fraction is at
/// least `threshold`, in candidate order.
///
/// `visible` is the process-level allow-list. An explicit request that does
/// not intersect it, or a query where nothing is free, is an error; a partial
/// answer is returned with a [`Shortfall`].
pub fn query_free(
    probe: &dyn DeviceProbe,
    request: &DeviceRequest,
    visible: Option<&[DeviceId]>,
    threshold: f64,
) -> Result<FreeDevices, ResourceError> {
    let snapshot = probe.snapshot()?;

    let candidates: Vec<DeviceId> = match (request, visible) {
        (DeviceRequest::All, Some(visible)) => visible.to_vec(),
        (DeviceRequest::All, None) => {
            let mut ids: Vec<DeviceId> = snapshot.iter().map(|d| d.id).collect();
            ids.sort_unstable();
            ids.dedup();
            ids
        }
        (DeviceRequest::Explicit(requested), Some(visible)) => {
            let intersection: Vec<DeviceId> = requested
                .iter()
                .copied()
                .filter(|id| visible.contains(id))
                .collect();
            if intersection.is_empty() {
                return Err(ResourceError::NoIntersection {
                    requested: requested.clone(),
                    visible: visible.to_vec(),
                });
            }
            intersection
        }
        (DeviceRequest::Explicit(requested), None) => requested.clone(),
    };

    for id in &candidates {
        if !snapshot.iter().any(|d| d.id == *id) {
            warn!("Device {} is not reported by the {} probe", id, probe.name());
        }
    }

    let devices: Vec<DeviceId> = candidates
        .iter()
        .copied()
        .filter(|id| is_free(&snapshot, *id, threshold))
        .collect();

    if devices.is_empty() {
        return Err(ResourceError::AllBusy {
            candidates,
            threshold,
        });
    }

    let shortfall = (devices.len() < candidates.len()).then(|| Shortfall {
        requested: candidates.clone(),
        available: devices.clone(),
    });
    if let Some(shortfall) = &shortfall {
        warn!(
            "Requested devices {:?}, but only {:?} are available",
            shortfall.requested, shortfall.available
        );
    }

    Ok(FreeDevices { devices, shortfall })
}

/// How the tracker picks the preferred device for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Run index modulo the number of tracked devices.
    RoundRobin,
    /// Always the first tracked device.
    First,
}

/// Devices believed free, plus the ones currently claimed by running runs.
#[derive(Debug, Clone, Default)]
struct DeviceSet {
    /// Devices found free at startup; round-robin is taken over this pool.
    pool: Vec<DeviceId>,
    /// Result of the latest re-query.
    free: Vec<DeviceId>,
    claimed: BTreeSet<DeviceId>,
}

/// Shared device state of one experiment.
///
/// All methods serialize on an internal lock. The orchestrator's dispatch loop
/// is the only caller of [`assign`](Self::assign) and
/// [`release`](Self::release); workers only see the device they were given.
pub struct DeviceTracker {
    probe: Arc<dyn DeviceProbe>,
    threshold: f64,
    state: Mutex<DeviceSet>,
}

impl DeviceTracker {
    /// Query the free devices and start tracking them.
    pub fn initialize(
        probe: Arc<dyn DeviceProbe>,
        request: &DeviceRequest,
        visible: Option<&[DeviceId]>,
        threshold: f64,
    ) -> Result<(Self, FreeDevices), ResourceError> {
        let answer = query_free(probe.as_ref(), request, visible, threshold)?;
        info!(
            "Tracking devices {:?} (free memory fraction >= {})",
            answer.devices, threshold
        );
        let tracker = Self {
            probe,
            threshold,
            state: Mutex::new(DeviceSet {
                pool: answer.devices.clone(),
                free: answer.devices.clone(),
                claimed: BTreeSet::new(),
            }),
        };
        Ok((tracker, answer))
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Devices tracked for this experiment.
    pub fn pool(&self) -> Vec<DeviceId> {
        self.state.lock().pool.clone()
    }

    /// Devices found free by the latest query.
    pub fn free(&self) -> Vec<DeviceId> {
        self.state.lock().free.clone()
    }

    pub fn claimed(&self) -> Vec<DeviceId> {
        self.state.lock().claimed.iter().copied().collect()
    }

    /// Re-query the tracked pool.
    pub fn refresh(&self) -> Result<Vec<DeviceId>, ResourceError> {
        let mut state = self.state.lock();
        self.requery(&mut state)
    }

    fn requery(&self, state: &mut DeviceSet) -> Result<Vec<DeviceId>, ResourceError> {
        let snapshot = self.probe.snapshot()?;
        state.free = state
            .pool
            .iter()
            .copied()
            .filter(|id| is_free(&snapshot, *id, self.threshold))
            .collect();
        debug!("Free devices after re-query: {:?}", state.free);
        Ok(state.free.clone())
    }

    /// Claim a device for run `index`.
    ///
    /// The preferred device is re-checked just in time. When it is claimed or
    /// no longer free, the pool is re-queried and the first free, unclaimed
    /// device is substituted. Fails only when no device is left.
    pub fn assign(&self, index: usize, policy: Assignment) -> Result<DeviceId, ResourceError> {
        let mut state = self.state.lock();
        if state.pool.is_empty() {
            return Err(ResourceError::NoFreeDevice { index });
        }

        let preferred = match policy {
            Assignment::RoundRobin => state.pool[index % state.pool.len()],
            Assignment::First => state.pool[0],
        };

        if !state.claimed.contains(&preferred) {
            let snapshot = self.probe.snapshot()?;
            if is_free(&snapshot, preferred, self.threshold) {
                state.claimed.insert(preferred);
                debug!("Run {} assigned device {}", index, preferred);
                return Ok(preferred);
            }
        }

        let free = self.requery(&mut state)?;
        let substitute = free
            .into_iter()
            .find(|id| !state.claimed.contains(id))
            .ok_or(ResourceError::NoFreeDevice { index })?;
        state.claimed.insert(substitute);
        warn!(
            "Device {} unavailable for run {}, substituted device {}",
            preferred, index, substitute
        );
        Ok(substitute)
    }

    /// Return a device claimed by a finished run.
    pub fn release(&self, device: DeviceId) {
        let mut state = self.state.lock();
        if !state.claimed.remove(&device) {
            warn!("Released device {} was not claimed", device);
        }
    }
}

impl std::fmt::Debug for DeviceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceTracker")
            .field("probe", &self.probe.name())
            .field("threshold", &self.threshold)
            .field("state", &*self.state.lock())
            .finish()
    }
}
