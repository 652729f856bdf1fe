//! Virtual controller device layer
//!
//! Defines the interface every virtual input backend implements and the
//! process-wide handle that sessions share to write into it.
//!
//! # Architecture
//!
//! ```text
//! Session A ──┐
//!             ├──► DeviceHandle ──[Mutex]──► dyn VirtualController ──► OS driver
//! Session B ──┘    (validate batch)          (loopback / uinput)
//! ```
//!
//! A batch of [`DeviceCommand`]s for one sensor sample is validated against the
//! device's declared [`Capabilities`], written under a single lock and closed
//! with one `flush` (one device report). Batches from different sessions never
//! interleave; with several clients connected the last writer wins.

pub mod loopback;
#[cfg(all(feature = "uinput", target_os = "linux"))]
pub mod uinput;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// Lowest device slot a virtual joystick driver hands out
pub const MIN_DEVICE_ID: u32 = 1;
/// Highest device slot a virtual joystick driver hands out
pub const MAX_DEVICE_ID: u32 = 16;

/// Physical axis slots of a virtual controller (HID usage names)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisSlot {
    X,
    Y,
    Z,
    Rx,
    Ry,
    Rz,
    Slider0,
    Slider1,
}

impl fmt::Display for AxisSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AxisSlot::X => "x",
            AxisSlot::Y => "y",
            AxisSlot::Z => "z",
            AxisSlot::Rx => "rx",
            AxisSlot::Ry => "ry",
            AxisSlot::Rz => "rz",
            AxisSlot::Slider0 => "slider0",
            AxisSlot::Slider1 => "slider1",
        };
        write!(f, "{}", name)
    }
}

/// Physical buttons and keys a backend can expose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonId {
    ArrowLeft,
    ArrowRight,
    ArrowUp,
    ArrowDown,
    KeyA,
    KeyD,
    KeyW,
    KeyS,
    Space,
    Button1,
    Button2,
    Button3,
    Button4,
}

impl fmt::Display for ButtonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ButtonId::ArrowLeft => "arrow_left",
            ButtonId::ArrowRight => "arrow_right",
            ButtonId::ArrowUp => "arrow_up",
            ButtonId::ArrowDown => "arrow_down",
            ButtonId::KeyA => "key_a",
            ButtonId::KeyD => "key_d",
            ButtonId::KeyW => "key_w",
            ButtonId::KeyS => "key_s",
            ButtonId::Space => "space",
            ButtonId::Button1 => "button1",
            ButtonId::Button2 => "button2",
            ButtonId::Button3 => "button3",
            ButtonId::Button4 => "button4",
        };
        write!(f, "{}", name)
    }
}

/// A single write against the virtual controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    Axis { slot: AxisSlot, value: i32 },
    Button { id: ButtonId, pressed: bool },
}

/// Inclusive integer range of the device's axes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: i32,
    pub max: i32,
}

impl AxisRange {
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i32) -> bool {
        value >= self.min && value <= self.max
    }
}

impl fmt::Display for AxisRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}

/// Axis range of a DirectInput-style virtual joystick (0x1..=0x8000)
pub const JOYSTICK_RANGE: AxisRange = AxisRange::new(0x1, 0x8000);

/// Axis range of an XInput-style virtual gamepad stick
pub const GAMEPAD_RANGE: AxisRange = AxisRange::new(-32768, 32767);

/// Kind of virtual controller a backend presents to games
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfile {
    /// Keyboard emulation: arrow keys, no axes
    Keyboard,
    /// Virtual joystick with eight axes
    Joystick,
    /// Virtual gamepad: two sticks and two triggers
    Gamepad,
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceProfile::Keyboard => write!(f, "keyboard"),
            DeviceProfile::Joystick => write!(f, "joystick"),
            DeviceProfile::Gamepad => write!(f, "gamepad"),
        }
    }
}

impl DeviceProfile {
    /// Axis range used when the configuration does not override it
    pub fn default_range(&self) -> Option<AxisRange> {
        match self {
            DeviceProfile::Keyboard => None,
            DeviceProfile::Joystick => Some(JOYSTICK_RANGE),
            DeviceProfile::Gamepad => Some(GAMEPAD_RANGE),
        }
    }

    /// Declared capabilities of this profile with the given axis range
    pub fn capabilities(&self, range: Option<AxisRange>) -> Capabilities {
        let range = range.or_else(|| self.default_range());
        match self {
            DeviceProfile::Keyboard => Capabilities {
                axes: Vec::new(),
                buttons: vec![
                    ButtonId::ArrowLeft,
                    ButtonId::ArrowRight,
                    ButtonId::ArrowUp,
                    ButtonId::ArrowDown,
                    ButtonId::KeyA,
                    ButtonId::KeyD,
                    ButtonId::KeyW,
                    ButtonId::KeyS,
                    ButtonId::Space,
                ],
                range: None,
            },
            DeviceProfile::Joystick => Capabilities {
                axes: vec![
                    AxisSlot::X,
                    AxisSlot::Y,
                    AxisSlot::Z,
                    AxisSlot::Rx,
                    AxisSlot::Ry,
                    AxisSlot::Rz,
                    AxisSlot::Slider0,
                    AxisSlot::Slider1,
                ],
                buttons: vec![
                    ButtonId::Button1,
                    ButtonId::Button2,
                    ButtonId::Button3,
                    ButtonId::Button4,
                ],
                range,
            },
            DeviceProfile::Gamepad => Capabilities {
                axes: vec![
                    AxisSlot::X,
                    AxisSlot::Y,
                    AxisSlot::Rx,
                    AxisSlot::Ry,
                    AxisSlot::Z,
                    AxisSlot::Rz,
                ],
                buttons: vec![
                    ButtonId::Button1,
                    ButtonId::Button2,
                    ButtonId::Button3,
                    ButtonId::Button4,
                ],
                range,
            },
        }
    }
}

/// What a device exposes to writers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub axes: Vec<AxisSlot>,
    pub buttons: Vec<ButtonId>,
    /// Shared range of all axes; `None` when the device has no axes
    pub range: Option<AxisRange>,
}

impl Capabilities {
    pub fn has_axis(&self, slot: AxisSlot) -> bool {
        self.axes.contains(&slot)
    }

    pub fn has_button(&self, id: ButtonId) -> bool {
        self.buttons.contains(&id)
    }

    /// Checks a single command against the declared capabilities
    pub fn check(&self, command: &DeviceCommand) -> Result<(), DeviceError> {
        match *command {
            DeviceCommand::Axis { slot, value } => {
                if !self.has_axis(slot) {
                    return Err(DeviceError::UnsupportedAxis(slot));
                }
                match self.range {
                    Some(range) if range.contains(value) => Ok(()),
                    Some(range) => Err(DeviceError::OutOfRange { slot, value, range }),
                    None => Err(DeviceError::UnsupportedAxis(slot)),
                }
            }
            DeviceCommand::Button { id, .. } => {
                if self.has_button(id) {
                    Ok(())
                } else {
                    Err(DeviceError::UnsupportedButton(id))
                }
            }
        }
    }
}

/// Ownership status reported by the driver for a device slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Acquired by this process
    Own,
    /// Available for acquisition
    Free,
    /// Held by another process
    Busy,
    /// Not installed, disabled or revoked
    Missing,
    Unknown,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Own => write!(f, "own"),
            DeviceStatus::Free => write!(f, "free"),
            DeviceStatus::Busy => write!(f, "busy"),
            DeviceStatus::Missing => write!(f, "missing"),
            DeviceStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Errors raised by virtual controller backends
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device id {0} is outside 1..=16")]
    InvalidDeviceId(u32),

    #[error("Device {0} is held by another process")]
    Busy(u32),

    #[error("Device {0} is not installed or not enabled")]
    Missing(u32),

    #[error("Device has not been acquired")]
    NotAcquired,

    #[error("Device access was revoked")]
    Revoked,

    #[error("Axis {0} is not exposed by the device")]
    UnsupportedAxis(AxisSlot),

    #[error("Button {0} is not exposed by the device")]
    UnsupportedButton(ButtonId),

    #[error("Value {value} for axis {slot} is outside {range}")]
    OutOfRange {
        slot: AxisSlot,
        value: i32,
        range: AxisRange,
    },

    #[error("Backend '{0}' is not available in this build")]
    BackendUnavailable(String),

    #[error("Device lock poisoned")]
    Poisoned,

    #[error("Device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Interface of a virtual input device
///
/// Backends only need to perform writes; validation against the declared
/// capabilities and serialization between sessions happen in [`DeviceHandle`].
pub trait VirtualController: Send + 'static {
    /// Human readable backend name used in logs
    fn name(&self) -> &str;

    /// Axes, buttons and axis range this device exposes
    fn capabilities(&self) -> &Capabilities;

    /// Current ownership status of the device slot
    fn status(&self) -> DeviceStatus;

    /// Takes ownership of the device slot
    fn acquire(&mut self, device_id: u32) -> Result<(), DeviceError>;

    fn set_axis(&mut self, slot: AxisSlot, value: i32) -> Result<(), DeviceError>;

    fn set_button(&mut self, id: ButtonId, pressed: bool) -> Result<(), DeviceError>;

    /// Commits all writes since the last flush as one device report
    fn flush(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Gives the device slot back to the driver
    fn release(&mut self);
}

/// Backend implementation selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process device, nothing leaves the process
    #[default]
    Loopback,
    /// Linux uinput device (requires the `uinput` feature)
    Uinput,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Loopback => write!(f, "loopback"),
            BackendKind::Uinput => write!(f, "uinput"),
        }
    }
}

/// Creates the backend for `kind` presenting the given capabilities
pub fn open_backend(
    kind: BackendKind,
    profile: DeviceProfile,
    capabilities: Capabilities,
) -> Result<Box<dyn VirtualController>, DeviceError> {
    info!("Opening {} backend with {} profile", kind, profile);
    match kind {
        BackendKind::Loopback => Ok(Box::new(loopback::LoopbackController::new(
            format!("wheelbridge loopback {}", profile),
            capabilities,
        ))),
        #[cfg(all(feature = "uinput", target_os = "linux"))]
        BackendKind::Uinput => Ok(Box::new(uinput::UinputController::new(
            format!("wheelbridge {}", profile),
            capabilities,
        ))),
        #[cfg(not(all(feature = "uinput", target_os = "linux")))]
        BackendKind::Uinput => Err(DeviceError::BackendUnavailable(kind.to_string())),
    }
}

/// Shared, serialized access to the acquired virtual controller
///
/// Cloning is cheap; all clones write into the same device. Every call takes
/// the lock once and never holds it across an `.await`.
#[derive(Clone)]
pub struct DeviceHandle {
    device: Arc<Mutex<Box<dyn VirtualController>>>,
    capabilities: Arc<Capabilities>,
    name: Arc<str>,
    device_id: u32,
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("name", &self.name)
            .field("device_id", &self.device_id)
            .finish()
    }
}

impl DeviceHandle {
    /// Acquires `device_id` on the backend and wraps it for sharing
    ///
    /// # Errors
    ///
    /// * [`DeviceError::InvalidDeviceId`] - id outside the driver's slot range
    /// * [`DeviceError::Busy`] - another process owns the slot
    /// * [`DeviceError::Missing`] - the slot is not configured
    /// * any error the backend reports while acquiring
    pub fn acquire(
        mut backend: Box<dyn VirtualController>,
        device_id: u32,
    ) -> Result<Self, DeviceError> {
        if !(MIN_DEVICE_ID..=MAX_DEVICE_ID).contains(&device_id) {
            return Err(DeviceError::InvalidDeviceId(device_id));
        }

        let status = backend.status();
        debug!("Device {} status before acquire: {}", device_id, status);
        match status {
            DeviceStatus::Busy => return Err(DeviceError::Busy(device_id)),
            DeviceStatus::Missing => return Err(DeviceError::Missing(device_id)),
            DeviceStatus::Own | DeviceStatus::Free | DeviceStatus::Unknown => {}
        }

        backend.acquire(device_id)?;

        let name: Arc<str> = Arc::from(backend.name());
        let capabilities = Arc::new(backend.capabilities().clone());
        info!(
            "Acquired device {} ({}) with {} axes and {} buttons",
            device_id,
            name,
            capabilities.axes.len(),
            capabilities.buttons.len()
        );

        Ok(Self {
            device: Arc::new(Mutex::new(backend)),
            capabilities,
            name,
            device_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn lock(&self) -> Result<MutexGuard<'_, Box<dyn VirtualController>>, DeviceError> {
        self.device.lock().map_err(|_| DeviceError::Poisoned)
    }

    /// Current status of the device, `Unknown` if the lock is poisoned
    pub fn status(&self) -> DeviceStatus {
        match self.lock() {
            Ok(device) => device.status(),
            Err(_) => DeviceStatus::Unknown,
        }
    }

    /// Writes one batch of commands followed by one report
    ///
    /// The whole batch is checked against the capabilities before the first
    /// write, so a rejected batch leaves the device untouched. An empty batch
    /// does not touch the device at all.
    pub fn apply(&self, commands: &[DeviceCommand]) -> Result<(), DeviceError> {
        if commands.is_empty() {
            return Ok(());
        }

        for command in commands {
            self.capabilities.check(command)?;
        }

        let mut device = self.lock()?;
        for command in commands {
            match *command {
                DeviceCommand::Axis { slot, value } => device.set_axis(slot, value)?,
                DeviceCommand::Button { id, pressed } => device.set_button(id, pressed)?,
            }
        }
        device.flush()?;
        debug!("Applied {} commands to {}", commands.len(), self.name);
        Ok(())
    }

    /// Releases the device slot back to the driver
    pub fn release(&self) {
        match self.lock() {
            Ok(mut device) => {
                device.release();
                info!("Released device {} ({})", self.device_id, self.name);
            }
            Err(e) => error!("Unable to release device {}: {}", self.device_id, e),
        }
    }

    /// Checks that every command the caller will ever send is supported
    pub fn ensure_supports(&self, commands: &[DeviceCommand]) -> Result<(), DeviceError> {
        for command in commands {
            if let Err(e) = self.capabilities.check(command) {
                warn!("Device {} cannot serve {:?}: {}", self.name, command, e);
                return Err(e);
            }
        }
        Ok(())
    }
}
