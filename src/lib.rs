//! Turns a phone's motion sensor stream into a virtual steering wheel.
//!
//! ```text
//! WebSocket client ──► server ──► session ──► mapping ──► device
//!   (JSON samples)     (accept)   (per conn)   (pure)     (shared, serialized)
//! ```

pub mod config;
pub mod device;
pub mod mapping;
pub mod server;
pub mod session;
