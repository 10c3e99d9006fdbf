use switchboard_core::errors::ProtocolError;
use switchboard_core::ids::InstanceId;
use switchboard_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("instance {0} is not connected")]
    NotConnected(InstanceId),

    #[error("unknown contact: {0}")]
    UnknownContact(String),

    #[error("engine error: {0}")]
    Engine(ProtocolError),

    #[error("dispatch failed: {0}")]
    Dispatch(ProtocolError),

    #[error("pairing timed out for {instance_id} after {cycles} codes")]
    PairingTimeout { instance_id: InstanceId, cycles: u32 },

    #[error("storage error: {0}")]
    Storage(StoreError),

    #[error("instance {0} is outside the caller's scope")]
    Forbidden(InstanceId),
}

impl OrchestratorError {
    /// Short classification string, used in logs and as the RPC error code.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotConnected(_) => "not_connected",
            Self::UnknownContact(_) => "unknown_contact",
            Self::Engine(_) => "engine_error",
            Self::Dispatch(_) => "dispatch_error",
            Self::PairingTimeout { .. } => "pairing_timeout",
            Self::Storage(_) => "storage_error",
            Self::Forbidden(_) => "forbidden",
        }
    }

    /// Caller mistakes, as opposed to failures of the engine or the store.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::NotConnected(_) | Self::UnknownContact(_) | Self::Forbidden(_)
        )
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other),
        }
    }
}
