//! Capture session state management

use std::time::Instant;

/// Capture session state machine
///
/// Transitions are validated so the manager cannot be driven into an
/// inconsistent lifecycle (e.g. starting a capture before initialization).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    /// Subsystems have not been wired up yet.
    Uninitialized,

    /// Initialized and waiting for a capture session.
    Idle,

    /// A capture session is running.
    Capturing {
        /// When the session started.
        started_at: Instant,
    },

    /// Subsystems have been torn down; the manager cannot be reused.
    ShutDown,
}

impl CaptureState {
    /// Check whether this state transition is valid.
    pub fn can_transition_to(&self, target: &CaptureState) -> bool {
        use CaptureState::*;

        match (self, target) {
            (Uninitialized, Idle) => true,
            (Uninitialized, ShutDown) => true,

            (Idle, Capturing { .. }) => true,
            (Idle, ShutDown) => true,

            (Capturing { .. }, Idle) => true,
            // Shutdown mid-capture stops the session first.
            (Capturing { .. }, ShutDown) => true,

            (ShutDown, _) => false,

            (a, b) if a == b => true,

            _ => false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        matches!(self, CaptureState::Capturing { .. })
    }

    pub fn is_initialized(&self) -> bool {
        !matches!(self, CaptureState::Uninitialized | CaptureState::ShutDown)
    }

    /// Duration since the capture session started, if capturing.
    pub fn capture_duration(&self) -> Option<std::time::Duration> {
        if let CaptureState::Capturing { started_at } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            CaptureState::Uninitialized => "Uninitialized",
            CaptureState::Idle => "Idle",
            CaptureState::Capturing { .. } => "Capturing",
            CaptureState::ShutDown => "ShutDown",
        }
    }
}

impl std::fmt::Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let uninitialized = CaptureState::Uninitialized;
        let idle = CaptureState::Idle;
        let capturing = CaptureState::Capturing {
            started_at: Instant::now(),
        };
        let shut_down = CaptureState::ShutDown;

        assert!(uninitialized.can_transition_to(&idle));
        assert!(idle.can_transition_to(&capturing));
        assert!(capturing.can_transition_to(&idle));
        assert!(idle.can_transition_to(&shut_down));
        assert!(capturing.can_transition_to(&shut_down));

        // Self-transitions
        assert!(idle.can_transition_to(&idle));
        assert!(capturing.can_transition_to(&capturing));
    }

    #[test]
    fn test_invalid_transitions() {
        let uninitialized = CaptureState::Uninitialized;
        let idle = CaptureState::Idle;
        let capturing = CaptureState::Capturing {
            started_at: Instant::now(),
        };
        let shut_down = CaptureState::ShutDown;

        assert!(!uninitialized.can_transition_to(&capturing)); // must initialize first
        assert!(!shut_down.can_transition_to(&idle)); // no restart after shutdown
        assert!(!shut_down.can_transition_to(&capturing));
        assert!(!idle.can_transition_to(&uninitialized));
    }

    #[test]
    fn test_state_checks() {
        let capturing = CaptureState::Capturing {
            started_at: Instant::now(),
        };
        assert!(capturing.is_capturing());
        assert!(capturing.is_initialized());
        assert!(capturing.capture_duration().is_some());

        assert!(!CaptureState::Idle.is_capturing());
        assert!(CaptureState::Idle.is_initialized());
        assert!(!CaptureState::Uninitialized.is_initialized());
        assert!(!CaptureState::ShutDown.is_initialized());
        assert!(CaptureState::Idle.capture_duration().is_none());
    }
}
