//! Finite state machine for the Elasticsearch lifecycle
//!
//! Every phase change the reconciler makes goes through this table, so a
//! transition that is not listed here never reaches the status subresource.
//!
//! ```text
//! Pending ─► Creating ─► Initializing ─► Running
//!    │          │             │             │
//!    └──────────┴──► Failed ◄─┘             │
//!                      │                    │
//!   (any live phase) ──┴──► Deleting ──► Paused | Deleted | WipedOut
//! ```

use std::fmt;

use crate::crd::DatabasePhase;

/// Events that trigger lifecycle transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseEvent {
    /// The admission guard accepted the spec
    ValidationPassed,
    /// The admission guard rejected the spec
    ValidationFailed,
    /// Every node group has its desired pods ready
    WorkloadsReady,
    /// Workloads are up and the spec asks for a restore
    RestoreRequired,
    /// The restore job completed
    RestoreSucceeded,
    /// The restore job failed
    RestoreFailed,
    /// Pod readiness or job completion exceeded its bound
    ConvergenceTimedOut,
    /// The spec generation moved while the database was Failed
    SpecChanged,
    /// The deletion timestamp is set
    DeletionRequested,
    /// The Pause policy left a DormantDatabase behind
    TerminationPaused,
    /// The Delete policy removed workloads and volumes
    TerminationDeleted,
    /// The WipeOut policy removed everything
    TerminationWipedOut,
}

impl fmt::Display for DatabaseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Facts the guards look at
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub ready_replicas: i32,
    pub desired_replicas: i32,
    /// Whether the spec declares `init.snapshotSource`
    pub restore_required: bool,
    /// Generation differs from the observed generation
    pub spec_changed: bool,
}

impl TransitionContext {
    pub fn new(ready_replicas: i32, desired_replicas: i32) -> Self {
        Self {
            ready_replicas,
            desired_replicas,
            ..Default::default()
        }
    }

    pub fn with_restore(mut self, restore_required: bool) -> Self {
        self.restore_required = restore_required;
        self
    }

    pub fn with_spec_changed(mut self, spec_changed: bool) -> Self {
        self.spec_changed = spec_changed;
        self
    }

    pub fn all_replicas_ready(&self) -> bool {
        self.ready_replicas >= self.desired_replicas
    }
}

/// A state transition definition
#[derive(Debug)]
pub struct Transition {
    pub from: DatabasePhase,
    pub to: DatabasePhase,
    pub event: DatabaseEvent,
    pub description: &'static str,
}

impl Transition {
    const fn new(
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        description: &'static str,
    ) -> Self {
        Self {
            from,
            to,
            event,
            description,
        }
    }
}

/// Result of attempting a state transition
#[derive(Debug)]
pub enum TransitionResult {
    Success {
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        description: &'static str,
    },
    InvalidTransition {
        current: DatabasePhase,
        event: DatabaseEvent,
    },
    GuardFailed {
        from: DatabasePhase,
        to: DatabasePhase,
        event: DatabaseEvent,
        reason: String,
    },
}

impl TransitionResult {
    /// Target phase when the transition is allowed
    pub fn target(&self) -> Option<DatabasePhase> {
        match self {
            TransitionResult::Success { to, .. } => Some(*to),
            _ => None,
        }
    }
}

/// Lifecycle phases a database can be deleted from
const LIVE_PHASES: [DatabasePhase; 5] = [
    DatabasePhase::Pending,
    DatabasePhase::Creating,
    DatabasePhase::Initializing,
    DatabasePhase::Running,
    DatabasePhase::Failed,
];

/// Lifecycle state machine
pub struct DatabaseStateMachine {
    transitions: Vec<Transition>,
}

impl Default for DatabaseStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseStateMachine {
    pub fn new() -> Self {
        use DatabaseEvent as E;
        use DatabasePhase as P;

        let mut transitions = vec![
            // === Pending ===
            Transition::new(P::Pending, P::Creating, E::ValidationPassed, "Spec accepted, creating workloads"),
            Transition::new(P::Pending, P::Failed, E::ValidationFailed, "Spec rejected before any resource was created"),
            // === Creating ===
            Transition::new(P::Creating, P::Running, E::WorkloadsReady, "All node groups are ready"),
            Transition::new(P::Creating, P::Initializing, E::RestoreRequired, "Workloads ready, restoring from snapshot"),
            Transition::new(P::Creating, P::Failed, E::ValidationFailed, "Spec rejected during creation"),
            Transition::new(P::Creating, P::Failed, E::ConvergenceTimedOut, "Pods did not become ready in time"),
            // === Initializing ===
            Transition::new(P::Initializing, P::Running, E::RestoreSucceeded, "Restore completed"),
            Transition::new(P::Initializing, P::Failed, E::RestoreFailed, "Restore job failed"),
            Transition::new(P::Initializing, P::Failed, E::ConvergenceTimedOut, "Restore job did not finish in time"),
            // === Running ===
            Transition::new(P::Running, P::Failed, E::ValidationFailed, "Updated spec rejected"),
            Transition::new(P::Running, P::Failed, E::ConvergenceTimedOut, "Pods did not become ready after an update"),
            // === Failed ===
            Transition::new(P::Failed, P::Creating, E::SpecChanged, "Spec changed, retrying creation"),
            // === Deleting ===
            Transition::new(P::Deleting, P::Paused, E::TerminationPaused, "Paused into a DormantDatabase"),
            Transition::new(P::Deleting, P::Deleted, E::TerminationDeleted, "Workloads and volumes deleted"),
            Transition::new(P::Deleting, P::WipedOut, E::TerminationWipedOut, "All data wiped out"),
        ];

        for phase in LIVE_PHASES {
            transitions.push(Transition::new(
                phase,
                P::Deleting,
                E::DeletionRequested,
                "Deletion requested",
            ));
        }

        Self { transitions }
    }

    /// Attempt to transition to a new state based on an event
    pub fn transition(
        &self,
        current: &DatabasePhase,
        event: DatabaseEvent,
        ctx: &TransitionContext,
    ) -> TransitionResult {
        let Some(t) = self
            .transitions
            .iter()
            .find(|t| t.from == *current && t.event == event)
        else {
            return TransitionResult::InvalidTransition {
                current: *current,
                event,
            };
        };

        match self.check_guard(t, ctx) {
            Some(reason) => TransitionResult::GuardFailed {
                from: t.from,
                to: t.to,
                event,
                reason,
            },
            None => TransitionResult::Success {
                from: t.from,
                to: t.to,
                event,
                description: t.description,
            },
        }
    }

    /// Check if a transition is valid (ignoring guards)
    pub fn can_transition(&self, from: &DatabasePhase, event: &DatabaseEvent) -> bool {
        self.transitions
            .iter()
            .any(|t| t.from == *from && t.event == *event)
    }

    /// Get all valid events for a given state
    pub fn valid_events(&self, state: &DatabasePhase) -> Vec<&DatabaseEvent> {
        self.transitions
            .iter()
            .filter(|t| t.from == *state)
            .map(|t| &t.event)
            .collect()
    }

    fn check_guard(&self, transition: &Transition, ctx: &TransitionContext) -> Option<String> {
        match transition.event {
            DatabaseEvent::WorkloadsReady | DatabaseEvent::RestoreRequired
                if !ctx.all_replicas_ready() =>
            {
                Some(format!(
                    "Not all replicas ready: {}/{}",
                    ctx.ready_replicas, ctx.desired_replicas
                ))
            }
            // A restore must run before the database is reported Running
            DatabaseEvent::WorkloadsReady if ctx.restore_required => {
                Some("Snapshot restore has not run yet".to_string())
            }
            DatabaseEvent::RestoreRequired if !ctx.restore_required => {
                Some("No snapshot source is configured".to_string())
            }
            DatabaseEvent::SpecChanged if !ctx.spec_changed => {
                Some("Generation has not changed since the failure".to_string())
            }
            _ => None,
        }
    }
}

/// Pick the event that follows from workload readiness
///
/// Returns `None` while pods are still coming up, which keeps the current
/// phase until the next reconcile.
pub fn determine_event(
    current: &DatabasePhase,
    ctx: &TransitionContext,
    has_deletion_timestamp: bool,
) -> Option<DatabaseEvent> {
    if has_deletion_timestamp {
        return Some(DatabaseEvent::DeletionRequested);
    }

    match current {
        DatabasePhase::Pending => Some(DatabaseEvent::ValidationPassed),
        DatabasePhase::Failed if ctx.spec_changed => Some(DatabaseEvent::SpecChanged),
        DatabasePhase::Creating if ctx.all_replicas_ready() => {
            if ctx.restore_required {
                Some(DatabaseEvent::RestoreRequired)
            } else {
                Some(DatabaseEvent::WorkloadsReady)
            }
        }
        _ => None,
    }
}
