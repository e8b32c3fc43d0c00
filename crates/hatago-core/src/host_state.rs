//! The plugin host's state machine, modeled as a pure reducer
//! `(state, event) -> (state, effects[])` (§3, §9). The reducer never
//! performs I/O; the caller executes the returned effects.

/// `idle → loading → running`; `loading|running → error`; `running|error → stopped`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostState {
    Idle,
    Loading,
    Running,
    Error { message: String },
    Stopped,
}

/// Inputs that can drive a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Load,
    LoadSucceeded,
    LoadFailed { message: String },
    RuntimeError { message: String },
    Stop,
}

/// Side effects a transition requests; the caller runs these after applying
/// the new state, never the reducer itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEffect {
    LogInfo(String),
    LogError(String),
    ActivatePlugins,
    ReleasePluginResources,
}

impl HostState {
    /// Apply `event` to `self`, returning the next state and the effects to run.
    /// Events that don't apply to the current state are no-ops: the state is
    /// unchanged and a single diagnostic effect is returned, matching the
    /// "ignore, don't panic" discipline of a pure reducer.
    pub fn reduce(&self, event: HostEvent) -> (HostState, Vec<HostEffect>) {
        match (self, event) {
            (HostState::Idle, HostEvent::Load) => (
                HostState::Loading,
                vec![HostEffect::LogInfo("loading plugin".into())],
            ),
            (HostState::Loading, HostEvent::LoadSucceeded) => (
                HostState::Running,
                vec![
                    HostEffect::LogInfo("plugin running".into()),
                    HostEffect::ActivatePlugins,
                ],
            ),
            (HostState::Loading, HostEvent::LoadFailed { message }) => (
                HostState::Error {
                    message: message.clone(),
                },
                vec![HostEffect::LogError(format!("load failed: {message}"))],
            ),
            (HostState::Running, HostEvent::RuntimeError { message }) => (
                HostState::Error {
                    message: message.clone(),
                },
                vec![HostEffect::LogError(format!("runtime error: {message}"))],
            ),
            (HostState::Running, HostEvent::Stop) | (HostState::Error { .. }, HostEvent::Stop) => (
                HostState::Stopped,
                vec![
                    HostEffect::ReleasePluginResources,
                    HostEffect::LogInfo("plugin stopped".into()),
                ],
            ),
            (state, event) => (
                state.clone(),
                vec![HostEffect::LogError(format!(
                    "ignored event {event:?} in state {state:?}"
                ))],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_happy_path() {
        let state = HostState::Idle;
        let (state, effects) = state.reduce(HostEvent::Load);
        assert_eq!(state, HostState::Loading);
        assert_eq!(effects, vec![HostEffect::LogInfo("loading plugin".into())]);

        let (state, effects) = state.reduce(HostEvent::LoadSucceeded);
        assert_eq!(state, HostState::Running);
        assert!(effects.contains(&HostEffect::ActivatePlugins));

        let (state, _) = state.reduce(HostEvent::Stop);
        assert_eq!(state, HostState::Stopped);
    }

    #[test]
    fn load_failure_goes_to_error_not_stopped() {
        let (state, effects) = HostState::Loading.reduce(HostEvent::LoadFailed {
            message: "bad manifest".into(),
        });
        assert_eq!(
            state,
            HostState::Error {
                message: "bad manifest".into()
            }
        );
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn error_state_can_still_stop() {
        let error = HostState::Error {
            message: "boom".into(),
        };
        let (state, _) = error.reduce(HostEvent::Stop);
        assert_eq!(state, HostState::Stopped);
    }

    #[test]
    fn stopped_is_terminal_for_load() {
        let (state, effects) = HostState::Stopped.reduce(HostEvent::Load);
        assert_eq!(state, HostState::Stopped);
        assert_eq!(effects.len(), 1);
    }

    #[test]
    fn idle_ignores_runtime_error() {
        let (state, _) = HostState::Idle.reduce(HostEvent::RuntimeError {
            message: "n/a".into(),
        });
        assert_eq!(state, HostState::Idle);
    }
}
