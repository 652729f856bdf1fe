//! Fehlerdefinitionen für das Mapping-Modul

use thiserror::Error;

/// Fehlertypen für die Mapping-Strategien
#[derive(Debug, Error)]
pub enum MappingError {
    /// Fehler bei der Konfiguration einer Mapping-Strategie
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Schwellwert außerhalb von `0.0..1.0`
    #[error("Steering threshold {0} must be finite and within 0.0..1.0")]
    InvalidThreshold(f64),

    /// Achsenbereich leer oder umgedreht
    #[error("Axis range {min}..={max} is empty")]
    InvalidRange { min: i32, max: i32 },

    /// Konfigurierte Mitte passt nicht zur Abbildungsformel
    #[error("Configured axis center {configured} does not match the mapped center {expected}")]
    CenterMismatch { configured: i32, expected: i32 },

    /// Eine physische Achse oder Taste ist mehrfach belegt
    #[error("{0} is assigned to more than one control")]
    DuplicateAssignment(String),

    /// Die angeforderte Mapping-Strategie existiert nicht
    #[error("Unknown mapping type: {0}")]
    UnknownMappingType(String),
}
