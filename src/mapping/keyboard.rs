//! Implementierung der Tasten-Mapping-Strategie
//!
//! Lenkt digital: Neigung über dem Schwellwert hält die Pfeiltaste der
//! jeweiligen Seite gedrückt. Tasten werden nur bei Zustandswechseln gedrückt
//! oder losgelassen, nie wiederholt.

use crate::device::{ButtonId, DeviceCommand};
use crate::mapping::{
    Direction, MappingConfig, MappingError, MappingStrategy, MappingType, SensorSample,
    SteeringState, Translation, DEFAULT_STEERING_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Zuordnung der logischen Steuerelemente zu physischen Tasten
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyMap {
    pub steer_left: ButtonId,
    pub steer_right: ButtonId,
    pub gas: ButtonId,
    pub brake: ButtonId,
}

impl Default for KeyMap {
    fn default() -> Self {
        Self {
            steer_left: ButtonId::ArrowLeft,
            steer_right: ButtonId::ArrowRight,
            gas: ButtonId::ArrowUp,
            brake: ButtonId::ArrowDown,
        }
    }
}

impl KeyMap {
    pub fn all(&self) -> [ButtonId; 4] {
        [self.steer_left, self.steer_right, self.gas, self.brake]
    }
}

/// Konfiguration für das Tasten-Mapping
#[derive(Debug, Clone)]
pub struct KeyboardConfig {
    /// Neigung, ab der eine Lenktaste gedrückt wird
    threshold: f64,

    /// Zuordnung der Tasten
    keys: KeyMap,

    /// Name der Konfiguration
    name: String,
}

impl KeyboardConfig {
    pub fn new(threshold: f64, keys: KeyMap) -> Self {
        Self {
            threshold,
            keys,
            name: "Keyboard-Config".to_string(),
        }
    }

    /// Erstellt eine Standard-Konfiguration (Pfeiltasten, Schwellwert 0.3)
    pub fn default_config() -> Self {
        Self::new(DEFAULT_STEERING_THRESHOLD, KeyMap::default())
    }
}

/// Prüft den Schwellwert, gemeinsam genutzt von beiden Strategien
pub(crate) fn validate_threshold(threshold: f64) -> Result<(), MappingError> {
    if threshold.is_finite() && (0.0..1.0).contains(&threshold) {
        Ok(())
    } else {
        Err(MappingError::InvalidThreshold(threshold))
    }
}

impl MappingConfig for KeyboardConfig {
    fn validate(&self) -> Result<(), MappingError> {
        validate_threshold(self.threshold)?;

        // Jede Taste darf nur einem Steuerelement zugeordnet sein
        let keys = self.keys.all();
        for (i, key) in keys.iter().enumerate() {
            if keys[i + 1..].contains(key) {
                return Err(MappingError::DuplicateAssignment(format!("Key {}", key)));
            }
        }

        Ok(())
    }

    fn create_strategy(&self) -> Result<Box<dyn MappingStrategy>, MappingError> {
        self.validate()?;
        Ok(Box::new(KeyboardStrategy::new(self.clone())))
    }

    fn get_type(&self) -> MappingType {
        MappingType::DiscreteKeys
    }

    fn get_name(&self) -> String {
        self.name.clone()
    }
}

/// Implementierung der Tasten-Mapping-Strategie
pub struct KeyboardStrategy {
    /// Konfiguration für das Mapping
    config: KeyboardConfig,
}

/// Sammelt Flanken getrennt nach Loslassen und Drücken
#[derive(Default)]
struct Edges {
    releases: Vec<DeviceCommand>,
    presses: Vec<DeviceCommand>,
}

impl Edges {
    fn key(&mut self, id: ButtonId, was_down: bool, down: bool) {
        match (was_down, down) {
            (true, false) => self.releases.push(DeviceCommand::Button { id, pressed: false }),
            (false, true) => self.presses.push(DeviceCommand::Button { id, pressed: true }),
            _ => {}
        }
    }

    /// Loslassen vor Drücken, damit nie beide Lenktasten gleichzeitig gelten
    fn into_commands(mut self) -> Vec<DeviceCommand> {
        self.releases.append(&mut self.presses);
        self.releases
    }
}

impl KeyboardStrategy {
    /// Erstellt eine neue Tasten-Mapping-Strategie
    pub fn new(config: KeyboardConfig) -> Self {
        Self { config }
    }

    fn transition(
        &self,
        state: &SteeringState,
        direction: Direction,
        gas: bool,
        brake: bool,
    ) -> Translation {
        let keys = &self.config.keys;
        let left = direction == Direction::Left;
        let right = direction == Direction::Right;

        let mut edges = Edges::default();
        edges.key(keys.steer_left, state.left_key_down, left);
        edges.key(keys.steer_right, state.right_key_down, right);
        edges.key(keys.gas, state.gas_key_down, gas);
        edges.key(keys.brake, state.brake_key_down, brake);

        Translation {
            commands: edges.into_commands(),
            next: SteeringState {
                left_key_down: left,
                right_key_down: right,
                gas_key_down: gas,
                brake_key_down: brake,
                ..*state
            },
            direction,
        }
    }
}

impl MappingStrategy for KeyboardStrategy {
    fn map(&self, sample: &SensorSample, state: &SteeringState) -> Translation {
        let direction = Direction::from_tilt(sample.tilt(), self.config.threshold);
        let translation = self.transition(state, direction, sample.gas, sample.brake);
        if !translation.commands.is_empty() {
            debug!("Key edges for y={:.3}: {:?}", sample.y, translation.commands);
        }
        translation
    }

    fn neutral(&self, state: &SteeringState) -> Translation {
        self.transition(state, Direction::Center, false, false)
    }

    fn required_commands(&self) -> Vec<DeviceCommand> {
        self.config
            .keys
            .all()
            .into_iter()
            .map(|id| DeviceCommand::Button { id, pressed: true })
            .collect()
    }

    fn get_type(&self) -> MappingType {
        MappingType::DiscreteKeys
    }
}
