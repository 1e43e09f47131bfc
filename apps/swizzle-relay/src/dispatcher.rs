use std::sync::Arc;

use metrics::counter;
use relay_proto::{OutboundEnvelope, Role};
use thiserror::Error;
use tracing::debug;

use crate::{
    bindings::RoleBindings,
    registry::{ConnectionId, ConnectionRegistry, FrameWriteError},
    script::Command,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no live connection is bound to role {0}")]
    RoleUnbound(Role),
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport write failed: {0}")]
    TransportWrite(#[from] FrameWriteError),
}

impl DispatchError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DispatchError::RoleUnbound(_) => "role_unbound",
            DispatchError::UnknownConnection(_) => "unknown_connection",
            DispatchError::Encode(_) => "encode",
            DispatchError::TransportWrite(_) => "transport_write",
        }
    }
}

/// Routes envelopes to whichever connection currently holds a role.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
    bindings: Arc<RoleBindings>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>, bindings: Arc<RoleBindings>) -> Self {
        Self { registry, bindings }
    }

    /// Sends `command` to the role's bound connection and returns its id.
    pub async fn send(
        &self,
        role: Role,
        command: &Command,
    ) -> Result<ConnectionId, DispatchError> {
        let result = self.send_envelope(role, &command.envelope()).await;
        match &result {
            Ok(_) => {
                counter!(
                    "swizzle_relay_commands_dispatched_total",
                    1,
                    "role" => role.as_str()
                );
            }
            Err(err) => {
                counter!(
                    "swizzle_relay_dispatch_failures_total",
                    1,
                    "role" => role.as_str(),
                    "reason" => err.metric_label()
                );
            }
        }
        result
    }

    pub async fn send_envelope(
        &self,
        role: Role,
        envelope: &OutboundEnvelope,
    ) -> Result<ConnectionId, DispatchError> {
        let id = self
            .bindings
            .lookup(role)
            .ok_or(DispatchError::RoleUnbound(role))?;
        match self.send_to(id, envelope).await {
            // A binding can briefly outlive its connection while the reader
            // loop is tearing down.
            Err(DispatchError::UnknownConnection(_)) => Err(DispatchError::RoleUnbound(role)),
            Err(err) => Err(err),
            Ok(()) => {
                debug!(role = %role, connection_id = %id, path = %envelope.path, "dispatched envelope");
                Ok(id)
            }
        }
    }

    /// Sends directly to a connection, bypassing role bindings.
    pub async fn send_to(
        &self,
        id: ConnectionId,
        envelope: &OutboundEnvelope,
    ) -> Result<(), DispatchError> {
        let connection = self
            .registry
            .get(id)
            .ok_or(DispatchError::UnknownConnection(id))?;
        let frame = envelope.to_bytes()?;
        connection.write_frame(frame).await?;
        Ok(())
    }
}
