//! Linux uinput backend
//!
//! Creates a kernel virtual input device through `/dev/uinput` with the axes
//! and keys of the configured profile. Writes are buffered and emitted as one
//! batch on `flush`, which the kernel closes with a `SYN_REPORT`.

use super::{AxisSlot, ButtonId, Capabilities, DeviceError, DeviceStatus, VirtualController};
use evdev::uinput::{VirtualDevice, VirtualDeviceBuilder};
use evdev::{
    AbsInfo, AbsoluteAxisCode, AttributeSet, EventType, InputEvent, KeyCode, UinputAbsSetup,
};
use tracing::{debug, info, warn};

fn abs_code(slot: AxisSlot) -> AbsoluteAxisCode {
    match slot {
        AxisSlot::X => AbsoluteAxisCode::ABS_X,
        AxisSlot::Y => AbsoluteAxisCode::ABS_Y,
        AxisSlot::Z => AbsoluteAxisCode::ABS_Z,
        AxisSlot::Rx => AbsoluteAxisCode::ABS_RX,
        AxisSlot::Ry => AbsoluteAxisCode::ABS_RY,
        AxisSlot::Rz => AbsoluteAxisCode::ABS_RZ,
        AxisSlot::Slider0 => AbsoluteAxisCode::ABS_THROTTLE,
        AxisSlot::Slider1 => AbsoluteAxisCode::ABS_RUDDER,
    }
}

fn key_code(id: ButtonId) -> KeyCode {
    match id {
        ButtonId::ArrowLeft => KeyCode::KEY_LEFT,
        ButtonId::ArrowRight => KeyCode::KEY_RIGHT,
        ButtonId::ArrowUp => KeyCode::KEY_UP,
        ButtonId::ArrowDown => KeyCode::KEY_DOWN,
        ButtonId::KeyA => KeyCode::KEY_A,
        ButtonId::KeyD => KeyCode::KEY_D,
        ButtonId::KeyW => KeyCode::KEY_W,
        ButtonId::KeyS => KeyCode::KEY_S,
        ButtonId::Space => KeyCode::KEY_SPACE,
        ButtonId::Button1 => KeyCode::BTN_SOUTH,
        ButtonId::Button2 => KeyCode::BTN_EAST,
        ButtonId::Button3 => KeyCode::BTN_NORTH,
        ButtonId::Button4 => KeyCode::BTN_WEST,
    }
}

pub struct UinputController {
    name: String,
    capabilities: Capabilities,
    device: Option<VirtualDevice>,
    pending: Vec<InputEvent>,
    revoked: bool,
}

impl UinputController {
    pub fn new(name: impl Into<String>, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            capabilities,
            device: None,
            pending: Vec::new(),
            revoked: false,
        }
    }

    #[allow(deprecated)]
    fn build(&self) -> Result<VirtualDevice, DeviceError> {
        let mut keys = AttributeSet::<KeyCode>::new();
        for id in &self.capabilities.buttons {
            keys.insert(key_code(*id));
        }

        let mut builder = VirtualDeviceBuilder::new()?
            .name(&self.name)
            .with_keys(&keys)?;

        if let Some(range) = self.capabilities.range {
            for slot in &self.capabilities.axes {
                let info = AbsInfo::new(range.min, range.min, range.max, 0, 0, 0);
                builder = builder.with_absolute_axis(&UinputAbsSetup::new(abs_code(*slot), info))?;
            }
        }

        Ok(builder.build()?)
    }
}

impl VirtualController for UinputController {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn status(&self) -> DeviceStatus {
        match (&self.device, self.revoked) {
            (_, true) => DeviceStatus::Missing,
            (Some(_), false) => DeviceStatus::Own,
            (None, false) => DeviceStatus::Free,
        }
    }

    fn acquire(&mut self, device_id: u32) -> Result<(), DeviceError> {
        let device = self.build().map_err(|e| {
            warn!("Unable to create uinput device {}: {}", device_id, e);
            e
        })?;
        info!("Created uinput device '{}' for slot {}", self.name, device_id);
        self.device = Some(device);
        self.revoked = false;
        Ok(())
    }

    fn set_axis(&mut self, slot: AxisSlot, value: i32) -> Result<(), DeviceError> {
        if self.device.is_none() {
            return Err(DeviceError::NotAcquired);
        }
        self.pending
            .push(InputEvent::new(EventType::ABSOLUTE.0, abs_code(slot).0, value));
        Ok(())
    }

    fn set_button(&mut self, id: ButtonId, pressed: bool) -> Result<(), DeviceError> {
        if self.device.is_none() {
            return Err(DeviceError::NotAcquired);
        }
        self.pending
            .push(InputEvent::new(EventType::KEY.0, key_code(id).0, i32::from(pressed)));
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DeviceError> {
        let events = std::mem::take(&mut self.pending);
        let device = self.device.as_mut().ok_or(DeviceError::NotAcquired)?;
        if let Err(e) = device.emit(&events) {
            // The kernel device is gone; every further write would fail the same way
            self.revoked = true;
            return Err(DeviceError::Io(e));
        }
        debug!("Emitted {} uinput events", events.len());
        Ok(())
    }

    fn release(&mut self) {
        self.pending.clear();
        if self.device.take().is_some() {
            info!("Destroyed uinput device '{}'", self.name);
        }
    }
}
