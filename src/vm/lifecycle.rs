//! VM lifecycle state machine.
//!
//! Hierarchy:
//! ```text
//! NotStarted → Launching → Running (superstate) ─────────────► Stopped
//!                             ├── Serving ⇄ ProtectedDataUnavailable
//!                             └── Backgrounding ──► Serving
//! ```
//!
//! `Backgrounding` is only reachable from `Running`; the supervisor checks
//! separately that the guest has connected at least once before asking.

use statig::prelude::*;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    LaunchRequested,
    Launched,
    LaunchFailed,
    BackgroundSaveStarted,
    BackgroundSaveFinished,
    ProtectedDataLost,
    ProtectedDataRestored,
    Stopped,
}

/// Flat view of the current state for callers outside this module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPhase {
    NotStarted,
    Launching,
    Running,
    ProtectedDataUnavailable,
    Backgrounding,
    Stopped,
}

impl VmPhase {
    /// Any of the `Running` sub-states.
    pub fn is_running(self) -> bool {
        matches!(
            self,
            VmPhase::Running | VmPhase::ProtectedDataUnavailable | VmPhase::Backgrounding
        )
    }
}

// ---------------------------------------------------------------------------
// State machine implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct LifecycleMachine;

#[state_machine(
    initial = "State::not_started()",
    state(derive(Debug, Clone, PartialEq))
)]
impl LifecycleMachine {
    #[state]
    fn not_started(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::LaunchRequested => Transition(State::launching()),
            _ => Handled,
        }
    }

    #[state]
    fn launching(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Launched => Transition(State::serving()),
            LifecycleEvent::LaunchFailed | LifecycleEvent::Stopped => Transition(State::stopped()),
            _ => Handled,
        }
    }

    /// Parent of every state in which the VM process is alive.
    #[superstate]
    fn running(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Stopped => Transition(State::stopped()),
            _ => Handled,
        }
    }

    #[state(superstate = "running")]
    fn serving(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::BackgroundSaveStarted => Transition(State::backgrounding()),
            LifecycleEvent::ProtectedDataLost => Transition(State::protected_data_unavailable()),
            _ => Super,
        }
    }

    /// Guest port-forward removed; the VM keeps running.
    #[state(superstate = "running", entry_action = "enter_protected")]
    fn protected_data_unavailable(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::ProtectedDataRestored => Transition(State::serving()),
            LifecycleEvent::BackgroundSaveStarted => Transition(State::backgrounding()),
            _ => Super,
        }
    }

    #[state(superstate = "running", entry_action = "enter_backgrounding")]
    fn backgrounding(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::BackgroundSaveFinished => Transition(State::serving()),
            _ => Super,
        }
    }

    #[state(entry_action = "enter_stopped")]
    fn stopped(&mut self, event: &LifecycleEvent) -> Outcome<State> {
        match event {
            // A stopped VM may be launched again.
            LifecycleEvent::LaunchRequested => Transition(State::launching()),
            _ => Handled,
        }
    }

    #[action]
    fn enter_protected(&mut self) {
        warn!(target: "lifecycle", "protected data unavailable; guest forward removed");
    }

    #[action]
    fn enter_backgrounding(&mut self) {
        info!(target: "lifecycle", "background save in progress");
    }

    #[action]
    fn enter_stopped(&mut self) {
        info!(target: "lifecycle", "VM stopped");
    }
}

/// Owns the statig machine and exposes [`VmPhase`].
pub struct Lifecycle {
    machine: StateMachine<LifecycleMachine>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").field("phase", &self.phase()).finish()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            machine: LifecycleMachine.state_machine(),
        }
    }
}

impl Lifecycle {
    /// Feed `event` and return the phase afterwards.
    pub fn handle(&mut self, event: LifecycleEvent) -> VmPhase {
        self.machine.handle(&event);
        self.phase()
    }

    pub fn phase(&self) -> VmPhase {
        match self.machine.state() {
            State::NotStarted {} => VmPhase::NotStarted,
            State::Launching {} => VmPhase::Launching,
            State::Serving {} => VmPhase::Running,
            State::ProtectedDataUnavailable {} => VmPhase::ProtectedDataUnavailable,
            State::Backgrounding {} => VmPhase::Backgrounding,
            State::Stopped {} => VmPhase::Stopped,
        }
    }
}
