pub mod context;
pub mod dormant;
pub mod error;
pub mod events;
pub mod materializer;
pub mod reconciler;
pub mod scheduler;
pub mod snapshot;
pub mod state_machine;
pub mod status;
pub mod teardown;

pub use context::{CONTROLLER_NAME, Context};
pub use dormant::reconcile_dormant;
pub use error::{BackoffConfig, Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use reconciler::{FINALIZER, error_policy, reconcile};
pub use scheduler::BackupScheduler;
pub use snapshot::reconcile_snapshot;
pub use state_machine::{DatabaseEvent, DatabaseStateMachine, TransitionContext, TransitionResult};
pub use status::{ConditionBuilder, StatusManager, next_status, spec_changed};
