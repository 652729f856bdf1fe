//! Per-connection session with statum state machine
//!
//! A session owns the committed [`SteeringState`] of one client, decodes its
//! frames, runs them through the mapping strategy and writes the resulting
//! batch to the shared device. Closing consumes the open session, so nothing
//! can be applied after the neutral reset.
//!
//! # State Machine
//!
//! ```text
//! Open ──(close)──► Closed
//!   │
//!   └─(dropped while open)──► neutral reset from Drop
//! ```
//!
//! # Architecture
//!
//! ```text
//! raw frame ──► decode ──► [Rate Limiter] ──► [Strategy] ──► DeviceHandle::apply
//!                 │              │                               │
//!             Discarded       Dropped                  commit SteeringState
//! ```

pub mod protocol;

use crate::device::{DeviceError, DeviceHandle, DeviceStatus};
use crate::mapping::{MappingStrategy, RateLimiter, SensorSample, SteeringState};
use chrono::{DateTime, TimeDelta, Utc};
use protocol::{preview, Ack, DecodeError};
use statum::{machine, state};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    /// Fatal for the session, the caller must close it
    #[error("Device write failed: {0}")]
    Device(#[from] DeviceError),
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    TransportError,
    IdleTimeout,
    DeviceFailure,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::ClientClosed => write!(f, "client closed"),
            CloseReason::TransportError => write!(f, "transport error"),
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::DeviceFailure => write!(f, "device failure"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
        }
    }
}

/// What happened to a single inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum MessageOutcome {
    /// Written to the device
    Applied(Ack),
    /// Valid, but arrived faster than the update interval
    Dropped,
    /// Could not be decoded
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub applied: u64,
    pub dropped: u64,
    pub discarded: u64,
}

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: u64,
    pub reason: CloseReason,
    pub stats: SessionStats,
    pub duration: TimeDelta,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} ended ({}) after {}ms: {} applied, {} dropped, {} discarded",
            self.id,
            self.reason,
            self.duration.num_milliseconds(),
            self.stats.applied,
            self.stats.dropped,
            self.stats.discarded
        )
    }
}

/// Device side of a session
///
/// Holds the "reset done" flag next to the data the reset needs, so the
/// reset also runs when an open session is dropped without `close`.
struct SessionCore {
    id: u64,
    device: DeviceHandle,
    strategy: Box<dyn MappingStrategy>,
    state: SteeringState,
    neutral_applied: bool,
}

impl SessionCore {
    /// Returns the device to rest, at most once per session
    ///
    /// Best effort: skipped when the device is no longer owned, and a failing
    /// write is only logged.
    fn reset_to_neutral(&mut self) {
        if self.neutral_applied {
            return;
        }
        self.neutral_applied = true;

        let status = self.device.status();
        if status != DeviceStatus::Own {
            warn!(
                "Skipping neutral reset for session {}: device is {}",
                self.id, status
            );
            return;
        }

        let neutral = self.strategy.neutral(&self.state);
        match self.device.apply(&neutral.commands) {
            Ok(()) => {
                self.state = neutral.next;
                info!(
                    "Session {} reset device to neutral ({} commands)",
                    self.id,
                    neutral.commands.len()
                );
            }
            Err(e) => error!("Neutral reset for session {} failed: {}", self.id, e),
        }
    }
}

impl Drop for SessionCore {
    fn drop(&mut self) {
        if !self.neutral_applied {
            warn!("Session {} dropped while open", self.id);
            self.reset_to_neutral();
        }
    }
}

/// States for the session lifecycle using statum
#[state]
#[derive(Debug, Clone)]
pub enum SessionState {
    Open,   // Accepting frames
    Closed, // Neutral reset done, summary available
}

/// Client session with compile-time state safety via statum
#[machine]
pub struct Session<S: SessionState> {
    core: SessionCore,
    rate_limiter: Option<RateLimiter>,
    stats: SessionStats,
    started_at: DateTime<Utc>,
    close_reason: Option<CloseReason>,
}

impl<S: SessionState> Session<S> {
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Last state the device accepted from this session
    pub fn steering_state(&self) -> &SteeringState {
        &self.core.state
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }
}

impl Session<Open> {
    pub fn open(id: u64, device: DeviceHandle, strategy: Box<dyn MappingStrategy>) -> Self {
        let rate_limiter = strategy.get_rate_limit().map(RateLimiter::new);
        if let Some(ref limiter) = rate_limiter {
            debug!(
                "Session {} rate limited to one update per {:?}",
                id,
                limiter.min_interval()
            );
        }

        let state = strategy.initial_state();
        info!("Opening session {} ({} mapping)", id, strategy.get_type());

        Self::new(
            SessionCore {
                id,
                device,
                strategy,
                state,
                neutral_applied: false,
            },
            rate_limiter,
            SessionStats::default(), // stats
            Utc::now(),              // started_at
            None,                    // close_reason
        )
    }

    /// Handles one text frame
    ///
    /// Undecodable frames are logged and discarded without touching the
    /// device. Only a device failure is returned as an error.
    pub fn on_message(&mut self, raw: &str, now: Instant) -> Result<MessageOutcome, SessionError> {
        match protocol::decode_sample(raw) {
            Ok(sample) => self.on_sample(&sample, now),
            Err(e) => Ok(self.discard(&e, preview(raw))),
        }
    }

    /// Handles one binary frame, which must contain UTF-8 JSON
    pub fn on_bytes(&mut self, raw: &[u8], now: Instant) -> Result<MessageOutcome, SessionError> {
        match protocol::decode_bytes(raw) {
            Ok(sample) => self.on_sample(&sample, now),
            Err(e) => {
                let payload = std::str::from_utf8(raw).map(preview).unwrap_or("<binary>");
                Ok(self.discard(&e, payload))
            }
        }
    }

    fn discard(&mut self, error: &DecodeError, payload: &str) -> MessageOutcome {
        self.stats.discarded += 1;
        warn!("Discarding frame: {} (payload: {:?})", error, payload);
        MessageOutcome::Discarded
    }

    /// Applies a decoded sample
    ///
    /// The committed state only changes after the device accepted the batch.
    pub fn on_sample(
        &mut self,
        sample: &SensorSample,
        now: Instant,
    ) -> Result<MessageOutcome, SessionError> {
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.admits(self.core.state.last_update, now) {
                self.stats.dropped += 1;
                return Ok(MessageOutcome::Dropped);
            }
        }

        let translation = self.core.strategy.map(sample, &self.core.state);
        self.core.device.apply(&translation.commands)?;

        self.core.state = SteeringState {
            last_update: Some(now),
            ..translation.next
        };
        self.stats.applied += 1;

        Ok(MessageOutcome::Applied(Ack::ok(
            translation.direction,
            sample.gas,
            sample.brake,
            self.core.state.steering_axis,
        )))
    }

    /// Resets the device to neutral and ends the session
    pub fn close(mut self, reason: CloseReason) -> Session<Closed> {
        info!("Closing session {}: {}", self.core.id, reason);
        self.core.reset_to_neutral();
        self.close_reason = Some(reason);
        self.transition()
    }
}

impl Session<Closed> {
    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.core.id,
            reason: self.close_reason.unwrap_or(CloseReason::ClientClosed),
            stats: self.stats,
            duration: Utc::now() - self.started_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::loopback::{LoopbackController, LoopbackProbe};
    use crate::device::{AxisSlot, ButtonId, DeviceProfile};
    use crate::mapping::{AxisConfig, Direction, KeyboardConfig, MappingConfig};
    use std::time::Duration;

    fn device(profile: DeviceProfile) -> (DeviceHandle, LoopbackProbe) {
        let controller = LoopbackController::new("test", profile.capabilities(None));
        let probe = controller.probe();
        (DeviceHandle::acquire(Box::new(controller), 1).unwrap(), probe)
    }

    fn axis_session() -> (Session<Open>, LoopbackProbe) {
        let (device, probe) = device(DeviceProfile::Joystick);
        let strategy = AxisConfig::for_profile(DeviceProfile::Joystick)
            .create_strategy()
            .unwrap();
        (Session::open(1, device, strategy), probe)
    }

    fn key_session() -> (Session<Open>, LoopbackProbe) {
        let (device, probe) = device(DeviceProfile::Keyboard);
        let strategy = KeyboardConfig::default_config().create_strategy().unwrap();
        (Session::open(2, device, strategy), probe)
    }

    #[test]
    fn malformed_frame_keeps_session_and_device_untouched() {
        let (mut session, probe) = axis_session();
        let before = *session.steering_state();

        let outcome = session.on_message("not json", Instant::now()).unwrap();
        assert_eq!(outcome, MessageOutcome::Discarded);
        let outcome = session.on_message(r#"{"y": "left"}"#, Instant::now()).unwrap();
        assert_eq!(outcome, MessageOutcome::Discarded);

        assert_eq!(*session.steering_state(), before);
        assert_eq!(probe.snapshot().writes, 0);
        assert_eq!(session.stats().discarded, 2);
    }

    #[test]
    fn burst_within_interval_writes_once() {
        let (mut session, probe) = axis_session();
        let start = Instant::now();

        for i in 0..5u64 {
            let now = start + Duration::from_millis(i * 2);
            session.on_message(r#"{"y": 0.5}"#, now).unwrap();
        }

        assert_eq!(probe.snapshot().reports, 1);
        assert_eq!(session.stats().applied, 1);
        assert_eq!(session.stats().dropped, 4);

        let later = start + Duration::from_millis(10);
        let outcome = session.on_message(r#"{"y": 0.5}"#, later).unwrap();
        assert!(matches!(outcome, MessageOutcome::Applied(_)));
        assert_eq!(probe.snapshot().reports, 2);
    }

    #[test]
    fn disconnect_resets_to_neutral() {
        let (mut session, probe) = axis_session();
        session
            .on_message(
                r#"{"x": 0, "y": 0.9, "z": 0, "gas": true, "brake": true}"#,
                Instant::now(),
            )
            .unwrap();
        assert_eq!(probe.snapshot().axis(AxisSlot::Y), Some(0x8000));

        let closed = session.close(CloseReason::ClientClosed);
        let snapshot = probe.snapshot();
        assert_eq!(snapshot.axis(AxisSlot::X), Some(16385));
        assert_eq!(snapshot.axis(AxisSlot::Y), Some(1));
        assert_eq!(snapshot.axis(AxisSlot::Z), Some(1));
        assert_eq!(closed.summary().reason, CloseReason::ClientClosed);
        assert_eq!(closed.summary().stats.applied, 1);
    }

    #[test]
    fn neutral_reset_runs_exactly_once() {
        let (mut session, probe) = axis_session();
        session.on_message(r#"{"y": -0.2}"#, Instant::now()).unwrap();

        let closed = session.close(CloseReason::Shutdown);
        drop(closed);
        assert_eq!(probe.snapshot().reports, 2);
    }

    #[test]
    fn dropping_an_open_session_still_resets() {
        let (mut session, probe) = axis_session();
        session
            .on_message(r#"{"y": 1.0, "gas": true}"#, Instant::now())
            .unwrap();

        drop(session);
        let snapshot = probe.snapshot();
        assert_eq!(snapshot.reports, 2);
        assert_eq!(snapshot.axis(AxisSlot::X), Some(16385));
        assert_eq!(snapshot.axis(AxisSlot::Y), Some(1));
    }

    #[test]
    fn device_failure_is_fatal_and_skips_reset() {
        let (mut session, probe) = axis_session();
        session.on_message(r#"{"y": 0.4}"#, Instant::now()).unwrap();
        let committed = *session.steering_state();

        probe.revoke();
        let later = Instant::now() + Duration::from_secs(1);
        let err = session.on_message(r#"{"y": -0.4}"#, later).unwrap_err();
        assert!(matches!(err, SessionError::Device(DeviceError::Revoked)));
        assert_eq!(*session.steering_state(), committed);

        let closed = session.close(CloseReason::DeviceFailure);
        assert_eq!(probe.snapshot().reports, 1);
        assert_eq!(closed.summary().reason, CloseReason::DeviceFailure);
    }

    #[test]
    fn key_scenario_through_session() {
        let (mut session, probe) = key_session();
        let now = Instant::now();

        session.on_message(r#"{"y": -0.5}"#, now).unwrap();
        let snapshot = probe.snapshot();
        assert!(snapshot.is_pressed(ButtonId::ArrowLeft));
        assert!(!snapshot.is_pressed(ButtonId::ArrowRight));

        session.on_message(r#"{"y": 0.0}"#, now).unwrap();
        assert!(!probe.snapshot().is_pressed(ButtonId::ArrowLeft));

        let outcome = session.on_message(r#"{"y": 0.5}"#, now).unwrap();
        assert!(probe.snapshot().is_pressed(ButtonId::ArrowRight));
        match outcome {
            MessageOutcome::Applied(ack) => {
                assert_eq!(ack.direction, Direction::Right);
                assert_eq!(ack.steering_axis, None);
            }
            other => panic!("expected applied sample, got {:?}", other),
        }

        session.close(CloseReason::ClientClosed);
        assert!(!probe.snapshot().is_pressed(ButtonId::ArrowRight));
    }

    #[test]
    fn invalid_utf8_binary_is_discarded() {
        let (mut session, probe) = key_session();
        let outcome = session.on_bytes(&[0xc3, 0x28], Instant::now()).unwrap();
        assert_eq!(outcome, MessageOutcome::Discarded);
        assert_eq!(probe.snapshot().writes, 0);
    }

    #[test]
    fn binary_frames_decode_like_text() {
        let (mut session, probe) = key_session();
        let now = Instant::now();

        let outcome = session.on_bytes(br#"{"y": "left"}"#, now).unwrap();
        assert_eq!(outcome, MessageOutcome::Discarded);

        let outcome = session.on_bytes(br#"{"y": 0.6}"#, now).unwrap();
        assert!(matches!(outcome, MessageOutcome::Applied(_)));
        assert!(probe.snapshot().is_pressed(ButtonId::ArrowRight));
        assert_eq!(session.stats().discarded, 1);
    }
}
