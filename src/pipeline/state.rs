//! Supervisor state management

use std::time::Instant;

/// Supervisor state machine
///
/// Represents the lifecycle position of one stream slot. State transitions are
/// validated so that a supervisor cannot, for example, monitor a pipeline it
/// never started or build a new one before the old one was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// No pipeline; waiting for a configuration, backing off, or disabled by mono mode
    Idle,

    /// Constructing a pipeline from the current configuration
    Building,

    /// Pipeline constructed, transition to playing requested
    Playing,

    /// Pipeline playing; polling for bus events and configuration changes
    Monitoring {
        /// When monitoring started
        since: Instant,
    },

    /// Applying a cosmetic change to the running pipeline
    DynamicUpdate,

    /// Structural change or failure; the running pipeline will be replaced
    Rebuilding,

    /// Pipeline is being brought to the null state and released
    Stopping,

    /// Stop requested; the supervisor has exited and cannot be restarted
    Terminated,
}

impl SupervisorState {
    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &SupervisorState) -> bool {
        use SupervisorState::*;

        match (self, target) {
            // From Idle
            (Idle, Building) => true,
            (Idle, Terminated) => true,

            // From Building
            (Building, Playing) => true,
            (Building, Stopping) => true, // handle exists but setup failed
            (Building, Idle) => true,     // construction failed, nothing to stop

            // From Playing
            (Playing, Monitoring { .. }) => true,
            (Playing, Stopping) => true,

            // From Monitoring
            (Monitoring { .. }, DynamicUpdate) => true,
            (Monitoring { .. }, Rebuilding) => true,
            (Monitoring { .. }, Stopping) => true,

            // From DynamicUpdate
            (DynamicUpdate, Monitoring { .. }) => true,
            (DynamicUpdate, Rebuilding) => true,

            // From Rebuilding
            (Rebuilding, Stopping) => true,

            // From Stopping
            (Stopping, Building) => true,
            (Stopping, Idle) => true,
            (Stopping, Terminated) => true,

            // From Terminated - no transitions allowed
            (Terminated, _) => false,

            // Self-transitions
            (a, b) if a == b => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            SupervisorState::Idle => "Idle",
            SupervisorState::Building => "Building",
            SupervisorState::Playing => "Playing",
            SupervisorState::Monitoring { .. } => "Monitoring",
            SupervisorState::DynamicUpdate => "DynamicUpdate",
            SupervisorState::Rebuilding => "Rebuilding",
            SupervisorState::Stopping => "Stopping",
            SupervisorState::Terminated => "Terminated",
        }
    }

    pub fn is_monitoring(&self) -> bool {
        matches!(self, SupervisorState::Monitoring { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, SupervisorState::Terminated)
    }

    /// Get the duration since monitoring started (if monitoring)
    pub fn monitoring_duration(&self) -> Option<std::time::Duration> {
        if let SupervisorState::Monitoring { since } = self {
            Some(since.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let monitoring = SupervisorState::Monitoring {
            since: Instant::now(),
        };

        // Happy path
        assert!(SupervisorState::Idle.can_transition_to(&SupervisorState::Building));
        assert!(SupervisorState::Building.can_transition_to(&SupervisorState::Playing));
        assert!(SupervisorState::Playing.can_transition_to(&monitoring));

        // Live update round trip
        assert!(monitoring.can_transition_to(&SupervisorState::DynamicUpdate));
        assert!(SupervisorState::DynamicUpdate.can_transition_to(&monitoring));

        // Rebuild path
        assert!(SupervisorState::DynamicUpdate.can_transition_to(&SupervisorState::Rebuilding));
        assert!(monitoring.can_transition_to(&SupervisorState::Rebuilding));
        assert!(SupervisorState::Rebuilding.can_transition_to(&SupervisorState::Stopping));
        assert!(SupervisorState::Stopping.can_transition_to(&SupervisorState::Building));
        assert!(SupervisorState::Stopping.can_transition_to(&SupervisorState::Terminated));

        // Self-transitions
        assert!(SupervisorState::Idle.can_transition_to(&SupervisorState::Idle));
    }

    #[test]
    fn test_invalid_transitions() {
        let monitoring = SupervisorState::Monitoring {
            since: Instant::now(),
        };

        assert!(!SupervisorState::Idle.can_transition_to(&monitoring)); // Must build first
        assert!(!SupervisorState::Idle.can_transition_to(&SupervisorState::Playing));
        assert!(!SupervisorState::Rebuilding.can_transition_to(&SupervisorState::Building)); // Must stop first
        assert!(!monitoring.can_transition_to(&SupervisorState::Building));
        assert!(!SupervisorState::Terminated.can_transition_to(&SupervisorState::Idle));
        assert!(!SupervisorState::Terminated.can_transition_to(&SupervisorState::Terminated));
    }

    #[test]
    fn test_state_checks() {
        let monitoring = SupervisorState::Monitoring {
            since: Instant::now(),
        };

        assert!(monitoring.is_monitoring());
        assert!(monitoring.monitoring_duration().is_some());

        assert!(SupervisorState::Terminated.is_terminated());
        assert_eq!(SupervisorState::DynamicUpdate.to_string(), "DynamicUpdate");
    }
}
