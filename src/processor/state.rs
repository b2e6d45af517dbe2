use serde::{Deserialize, Serialize};

/// Background caching lifecycle for one processor instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessorState {
    Idle,
    Caching {
        /// Playhead position the fill started from, recording time
        start_from: f64,
    },
    Complete,
    Error {
        message: String,
    },
}

impl ProcessorState {
    /// Check if transition from current state to target state is valid
    pub fn can_transition_to(&self, target: &ProcessorState) -> bool {
        use ProcessorState::*;

        matches!(
            (self, target),
            (Idle, Caching { .. })
                | (Caching { .. }, Complete)
                | (Caching { .. }, Error { .. })
                | (Caching { .. }, Idle)
                | (Complete, Caching { .. })
                | (Complete, Idle)
                | (Error { .. }, Caching { .. })
                | (Error { .. }, Idle)
        )
    }

    /// Get human-readable state name
    pub fn name(&self) -> &str {
        match self {
            Self::Idle => "Idle",
            Self::Caching { .. } => "Caching",
            Self::Complete => "Complete",
            Self::Error { .. } => "Error",
        }
    }
}

impl Default for ProcessorState {
    fn default() -> Self {
        Self::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_transitions() {
        let idle = ProcessorState::Idle;
        let caching = ProcessorState::Caching { start_from: 0.0 };

        assert!(idle.can_transition_to(&caching));
        assert!(caching.can_transition_to(&ProcessorState::Complete));
        assert!(ProcessorState::Complete.can_transition_to(&caching));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!ProcessorState::Idle.can_transition_to(&ProcessorState::Complete));
        assert!(!ProcessorState::Complete.can_transition_to(&ProcessorState::Error {
            message: "x".into()
        }));
    }

    #[test]
    fn test_error_recovery() {
        let error = ProcessorState::Error {
            message: "decode failed".into(),
        };
        assert!(error.can_transition_to(&ProcessorState::Caching { start_from: 10.0 }));
        assert!(error.can_transition_to(&ProcessorState::Idle));
    }
}
