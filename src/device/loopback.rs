//! In-process virtual controller
//!
//! Keeps the written axis and button values in memory and traces every
//! report. Used when no OS driver is wanted (dry runs) and by the tests, which
//! observe the device through a [`LoopbackProbe`].

use super::{AxisSlot, ButtonId, Capabilities, DeviceError, DeviceStatus, VirtualController};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

/// Observable state of a loopback device
#[derive(Debug, Clone)]
pub struct LoopbackState {
    pub status: DeviceStatus,
    pub device_id: Option<u32>,
    pub axes: HashMap<AxisSlot, i32>,
    pub buttons: HashMap<ButtonId, bool>,
    /// Number of flushed reports
    pub reports: u64,
    /// Number of individual axis and button writes
    pub writes: u64,
}

impl Default for LoopbackState {
    fn default() -> Self {
        Self {
            status: DeviceStatus::Free,
            device_id: None,
            axes: HashMap::new(),
            buttons: HashMap::new(),
            reports: 0,
            writes: 0,
        }
    }
}

impl LoopbackState {
    pub fn axis(&self, slot: AxisSlot) -> Option<i32> {
        self.axes.get(&slot).copied()
    }

    /// `true` if the button was last written as pressed
    pub fn is_pressed(&self, id: ButtonId) -> bool {
        self.buttons.get(&id).copied().unwrap_or(false)
    }
}

fn lock_state(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    // A panic while holding this lock cannot leave the plain data half written
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read and fault-injection access to a [`LoopbackController`]
#[derive(Debug, Clone)]
pub struct LoopbackProbe {
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackProbe {
    pub fn snapshot(&self) -> LoopbackState {
        lock_state(&self.state).clone()
    }

    pub fn set_status(&self, status: DeviceStatus) {
        lock_state(&self.state).status = status;
    }

    /// Simulates the driver taking the device away from this process
    pub fn revoke(&self) {
        info!("Revoking loopback device");
        self.set_status(DeviceStatus::Missing);
    }
}

/// Virtual controller living entirely in this process
pub struct LoopbackController {
    name: String,
    capabilities: Capabilities,
    state: Arc<Mutex<LoopbackState>>,
}

impl LoopbackController {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            state: Arc::new(Mutex::new(LoopbackState::default())),
        }
    }

    pub fn probe(&self) -> LoopbackProbe {
        LoopbackProbe {
            state: self.state.clone(),
        }
    }

    fn owned(&self) -> Result<MutexGuard<'_, LoopbackState>, DeviceError> {
        let state = lock_state(&self.state);
        match state.status {
            DeviceStatus::Own => Ok(state),
            DeviceStatus::Missing => Err(DeviceError::Revoked),
            _ => Err(DeviceError::NotAcquired),
        }
    }
}

impl VirtualController for LoopbackController {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn status(&self) -> DeviceStatus {
        lock_state(&self.state).status
    }

    fn acquire(&mut self, device_id: u32) -> Result<(), DeviceError> {
        let mut state = lock_state(&self.state);
        match state.status {
            DeviceStatus::Busy => Err(DeviceError::Busy(device_id)),
            DeviceStatus::Missing => Err(DeviceError::Missing(device_id)),
            _ => {
                state.status = DeviceStatus::Own;
                state.device_id = Some(device_id);
                Ok(())
            }
        }
    }

    fn set_axis(&mut self, slot: AxisSlot, value: i32) -> Result<(), DeviceError> {
        let mut state = self.owned()?;
        state.axes.insert(slot, value);
        state.writes += 1;
        Ok(())
    }

    fn set_button(&mut self, id: ButtonId, pressed: bool) -> Result<(), DeviceError> {
        let mut state = self.owned()?;
        state.buttons.insert(id, pressed);
        state.writes += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        let mut state = self.owned()?;
        state.reports += 1;
        debug!(
            "[{}] report #{} axes={:?} buttons={:?}",
            self.name, state.reports, state.axes, state.buttons
        );
        Ok(())
    }

    fn release(&mut self) {
        let mut state = lock_state(&self.state);
        if state.status == DeviceStatus::Own {
            state.status = DeviceStatus::Free;
        }
        state.device_id = None;
    }
}
