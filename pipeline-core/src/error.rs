use crate::context::{ContextError, StateKey};
use crate::gateway::GatewayError;
use crate::orchestrator::RunState;
use thiserror::Error;

/// Failure that ends a pipeline run in [`RunState::Failed`].
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("illegal run transition: {from} -> {to}")]
    IllegalTransition { from: RunState, to: RunState },

    #[error("stage input `{0}` missing from run context")]
    MissingRecord(StateKey),

    #[error("work item creation failed: {0}")]
    TicketCreation(#[source] GatewayError),

    #[error("gateway call failed: {0}")]
    Gateway(#[source] GatewayError),
}
