//! Implementierung der Achsen-Mapping-Strategie
//!
//! Bildet die Neigung linear auf die Lenkachse ab und setzt die Pedalachsen
//! binär auf Minimum oder Maximum. Jedes durchgelassene Sample schreibt den
//! kompletten Rahmen aus Lenkung, Gas und Bremse.

use crate::device::{AxisRange, AxisSlot, DeviceCommand, DeviceProfile};
use crate::mapping::keyboard::validate_threshold;
use crate::mapping::{
    Direction, MappingConfig, MappingError, MappingStrategy, MappingType, SensorSample,
    SteeringState, Translation, DEFAULT_MIN_UPDATE_INTERVAL, DEFAULT_STEERING_THRESHOLD,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Zuordnung der logischen Achsen zu physischen Achsen-Slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMap {
    pub steering: AxisSlot,
    pub gas: AxisSlot,
    pub brake: AxisSlot,
}

impl AxisMap {
    /// Standardbelegung je Geräteprofil
    ///
    /// Joystick: Lenkung X, Gas Y, Bremse Z. Gamepad: Lenkung am linken Stick,
    /// Gas am rechten und Bremse am linken Trigger.
    pub fn for_profile(profile: DeviceProfile) -> Self {
        match profile {
            DeviceProfile::Gamepad => Self {
                steering: AxisSlot::X,
                gas: AxisSlot::Rz,
                brake: AxisSlot::Z,
            },
            DeviceProfile::Joystick | DeviceProfile::Keyboard => Self {
                steering: AxisSlot::X,
                gas: AxisSlot::Y,
                brake: AxisSlot::Z,
            },
        }
    }
}

/// Bildet `y` aus `[-1.0, 1.0]` linear auf `range` ab
///
/// Gerundet wird immer halb nach oben (`floor(v + 0.5)`). Werte außerhalb von
/// `[-1.0, 1.0]` werden begrenzt, nicht endliche Werte zählen als `0.0`.
pub fn map_to_axis(y: f64, range: AxisRange) -> i32 {
    let y = if y.is_finite() { y.clamp(-1.0, 1.0) } else { 0.0 };
    let min = f64::from(range.min);
    let span = f64::from(range.max) - min;
    let value = (min + (y + 1.0) / 2.0 * span + 0.5).floor();
    (value as i32).clamp(range.min, range.max)
}

/// Mittelstellung der Lenkachse, per Definition `map_to_axis(0.0)`
pub fn center(range: AxisRange) -> i32 {
    map_to_axis(0.0, range)
}

/// Konfiguration für das Achsen-Mapping
#[derive(Debug, Clone)]
pub struct AxisConfig {
    range: AxisRange,

    /// Optional konfigurierte Mitte, muss zur Formel passen
    center: Option<i32>,

    axes: AxisMap,

    /// Mindestabstand zwischen zwei Geräte-Updates einer Session
    min_update_interval: Duration,

    /// Nur für die Richtungsangabe in Logs und Bestätigungen
    threshold: f64,

    /// Name der Konfiguration
    name: String,
}

impl AxisConfig {
    pub fn new(range: AxisRange, axes: AxisMap) -> Self {
        Self {
            range,
            center: None,
            axes,
            min_update_interval: DEFAULT_MIN_UPDATE_INTERVAL,
            threshold: DEFAULT_STEERING_THRESHOLD,
            name: "Axis-Config".to_string(),
        }
    }

    /// Standardkonfiguration für ein Geräteprofil
    pub fn for_profile(profile: DeviceProfile) -> Self {
        let range = profile.default_range().unwrap_or(crate::device::JOYSTICK_RANGE);
        Self::new(range, AxisMap::for_profile(profile))
    }

    pub fn with_center(mut self, center: Option<i32>) -> Self {
        self.center = center;
        self
    }

    pub fn with_min_update_interval(mut self, interval: Duration) -> Self {
        self.min_update_interval = interval;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn range(&self) -> AxisRange {
        self.range
    }
}

impl MappingConfig for AxisConfig {
    fn validate(&self) -> Result<(), MappingError> {
        if self.range.min >= self.range.max {
            return Err(MappingError::InvalidRange {
                min: self.range.min,
                max: self.range.max,
            });
        }

        if let Some(configured) = self.center {
            let expected = center(self.range);
            if configured != expected {
                return Err(MappingError::CenterMismatch {
                    configured,
                    expected,
                });
            }
        }

        let slots = [self.axes.steering, self.axes.gas, self.axes.brake];
        for (i, slot) in slots.iter().enumerate() {
            if slots[i + 1..].contains(slot) {
                return Err(MappingError::DuplicateAssignment(format!("Axis {}", slot)));
            }
        }

        validate_threshold(self.threshold)
    }

    fn create_strategy(&self) -> Result<Box<dyn MappingStrategy>, MappingError> {
        self.validate()?;
        Ok(Box::new(AxisStrategy::new(self.clone())))
    }

    fn get_type(&self) -> MappingType {
        MappingType::ContinuousAxis
    }

    fn get_name(&self) -> String {
        self.name.clone()
    }
}

/// Implementierung der Achsen-Mapping-Strategie
pub struct AxisStrategy {
    config: AxisConfig,
}

impl AxisStrategy {
    /// Erstellt eine neue Achsen-Mapping-Strategie
    pub fn new(config: AxisConfig) -> Self {
        Self { config }
    }

    fn pedal(&self, pressed: bool) -> i32 {
        if pressed {
            self.config.range.max
        } else {
            self.config.range.min
        }
    }

    fn frame(
        &self,
        state: &SteeringState,
        steering: i32,
        gas: i32,
        brake: i32,
        direction: Direction,
    ) -> Translation {
        let axes = &self.config.axes;
        Translation {
            commands: vec![
                DeviceCommand::Axis {
                    slot: axes.steering,
                    value: steering,
                },
                DeviceCommand::Axis {
                    slot: axes.gas,
                    value: gas,
                },
                DeviceCommand::Axis {
                    slot: axes.brake,
                    value: brake,
                },
            ],
            next: SteeringState {
                steering_axis: Some(steering),
                gas_axis: Some(gas),
                brake_axis: Some(brake),
                ..*state
            },
            direction,
        }
    }
}

impl MappingStrategy for AxisStrategy {
    fn map(&self, sample: &SensorSample, state: &SteeringState) -> Translation {
        let y = sample.tilt();
        let steering = map_to_axis(y, self.config.range);
        let direction = Direction::from_tilt(y, self.config.threshold);
        debug!(
            "Steering y={:.3} -> {} ({}), gas={}, brake={}",
            y, steering, direction, sample.gas, sample.brake
        );
        self.frame(
            state,
            steering,
            self.pedal(sample.gas),
            self.pedal(sample.brake),
            direction,
        )
    }

    fn neutral(&self, state: &SteeringState) -> Translation {
        let min = self.config.range.min;
        self.frame(state, center(self.config.range), min, min, Direction::Center)
    }

    fn required_commands(&self) -> Vec<DeviceCommand> {
        let range = self.config.range;
        [self.config.axes.steering, self.config.axes.gas, self.config.axes.brake]
            .into_iter()
            .flat_map(|slot| {
                [
                    DeviceCommand::Axis {
                        slot,
                        value: range.min,
                    },
                    DeviceCommand::Axis {
                        slot,
                        value: range.max,
                    },
                ]
            })
            .collect()
    }

    fn get_rate_limit(&self) -> Option<Duration> {
        Some(self.config.min_update_interval)
    }

    fn get_type(&self) -> MappingType {
        MappingType::ContinuousAxis
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{GAMEPAD_RANGE, JOYSTICK_RANGE};
    use proptest::prelude::*;

    #[test]
    fn joystick_range_round_trip() {
        assert_eq!(map_to_axis(-1.0, JOYSTICK_RANGE), 1);
        assert_eq!(map_to_axis(1.0, JOYSTICK_RANGE), 0x8000);
        assert_eq!(map_to_axis(0.0, JOYSTICK_RANGE), center(JOYSTICK_RANGE));
        assert_eq!(center(JOYSTICK_RANGE), 16385);
    }

    #[test]
    fn gamepad_range_round_trip() {
        assert_eq!(map_to_axis(-1.0, GAMEPAD_RANGE), -32768);
        assert_eq!(map_to_axis(1.0, GAMEPAD_RANGE), 32767);
        assert_eq!(center(GAMEPAD_RANGE), 0);
    }

    #[test]
    fn out_of_range_and_nan_tilt() {
        assert_eq!(map_to_axis(-7.0, JOYSTICK_RANGE), 1);
        assert_eq!(map_to_axis(3.0, JOYSTICK_RANGE), 0x8000);
        assert_eq!(map_to_axis(f64::NAN, JOYSTICK_RANGE), center(JOYSTICK_RANGE));
        assert_eq!(
            map_to_axis(f64::NEG_INFINITY, GAMEPAD_RANGE),
            center(GAMEPAD_RANGE)
        );
    }

    #[test]
    fn pedals_are_binary() {
        let strategy = AxisStrategy::new(AxisConfig::for_profile(DeviceProfile::Joystick));
        let sample = SensorSample {
            y: 0.9,
            gas: true,
            ..SensorSample::default()
        };
        let step = strategy.map(&sample, &strategy.initial_state());

        assert_eq!(
            step.commands,
            vec![
                DeviceCommand::Axis {
                    slot: AxisSlot::X,
                    value: map_to_axis(0.9, JOYSTICK_RANGE)
                },
                DeviceCommand::Axis {
                    slot: AxisSlot::Y,
                    value: 0x8000
                },
                DeviceCommand::Axis {
                    slot: AxisSlot::Z,
                    value: 1
                },
            ]
        );
        assert_eq!(step.next.gas_axis, Some(0x8000));
        assert_eq!(step.next.brake_axis, Some(1));
        assert_eq!(step.direction, Direction::Right);
    }

    #[test]
    fn gamepad_profile_puts_gas_on_right_trigger() {
        let strategy = AxisStrategy::new(AxisConfig::for_profile(DeviceProfile::Gamepad));
        let neutral = strategy.neutral(&SteeringState::default());
        assert_eq!(
            neutral.commands,
            vec![
                DeviceCommand::Axis {
                    slot: AxisSlot::X,
                    value: 0
                },
                DeviceCommand::Axis {
                    slot: AxisSlot::Rz,
                    value: -32768
                },
                DeviceCommand::Axis {
                    slot: AxisSlot::Z,
                    value: -32768
                },
            ]
        );
    }

    #[test]
    fn rejects_center_that_disagrees_with_formula() {
        let config = AxisConfig::for_profile(DeviceProfile::Joystick).with_center(Some(0x4000));
        assert!(matches!(
            config.validate(),
            Err(MappingError::CenterMismatch {
                configured: 0x4000,
                expected: 16385
            })
        ));

        let config = AxisConfig::for_profile(DeviceProfile::Joystick).with_center(Some(16385));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_empty_range_and_shared_slots() {
        let config = AxisConfig::new(
            AxisRange::new(5, 5),
            AxisMap::for_profile(DeviceProfile::Joystick),
        );
        assert!(matches!(
            config.validate(),
            Err(MappingError::InvalidRange { .. })
        ));

        let axes = AxisMap {
            steering: AxisSlot::X,
            gas: AxisSlot::Z,
            brake: AxisSlot::Z,
        };
        let config = AxisConfig::new(JOYSTICK_RANGE, axes);
        assert!(matches!(
            config.validate(),
            Err(MappingError::DuplicateAssignment(_))
        ));
    }

    #[test]
    fn rate_limit_follows_config() {
        let config = AxisConfig::for_profile(DeviceProfile::Joystick)
            .with_min_update_interval(Duration::from_millis(25));
        let strategy = AxisStrategy::new(config);
        assert_eq!(strategy.get_rate_limit(), Some(Duration::from_millis(25)));
    }

    proptest! {
        #[test]
        fn mapped_value_stays_in_range(
            y in prop::num::f64::ANY,
            min in -40000i32..0,
            span in 1i32..80000,
        ) {
            let range = AxisRange::new(min, min + span);
            let value = map_to_axis(y, range);
            prop_assert!(range.contains(value));
        }

        #[test]
        fn mapping_is_monotonic(a in -1.0f64..=1.0, b in -1.0f64..=1.0) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(map_to_axis(lo, JOYSTICK_RANGE) <= map_to_axis(hi, JOYSTICK_RANGE));
        }
    }
}
