use std::sync::Arc;

use metrics::counter;
use relay_proto::{decode_inbound, DecodeError, ExecutionResult, Inbound, Role};
use tracing::{debug, info, warn};

use crate::{
    bindings::{BindOutcome, RoleBindings},
    registry::{ConnectionId, ConnectionRegistry},
    runner::RunnerHandle,
};

/// What happened to one inbound frame.
#[derive(Debug)]
pub enum Classified {
    Bound { role: Role, outcome: BindOutcome },
    /// Execution result forwarded to the runner on behalf of these roles.
    Ack { roles: Vec<Role> },
    /// Execution result from a connection that holds no role.
    Unattributed,
    /// Frame from a connection that is no longer registered.
    UnknownConnection,
    Discarded(DecodeError),
}

/// Turns raw frames into binding updates and runner events.
#[derive(Debug, Clone)]
pub struct ResponseClassifier {
    registry: Arc<ConnectionRegistry>,
    bindings: Arc<RoleBindings>,
    runner: RunnerHandle,
}

impl ResponseClassifier {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        bindings: Arc<RoleBindings>,
        runner: RunnerHandle,
    ) -> Self {
        Self {
            registry,
            bindings,
            runner,
        }
    }

    pub fn on_frame(&self, id: ConnectionId, frame: &[u8]) -> Classified {
        match decode_inbound(frame) {
            Ok(Inbound::Announcement(role)) => self.on_announcement(id, role),
            Ok(Inbound::Result(result)) => self.on_result(id, result),
            Err(err) => {
                warn!(
                    connection_id = %id,
                    error = %err,
                    frame = %String::from_utf8_lossy(frame),
                    "discarding inbound frame"
                );
                counter!(
                    "swizzle_relay_frames_discarded_total",
                    1,
                    "reason" => err.metric_label()
                );
                Classified::Discarded(err)
            }
        }
    }

    fn on_announcement(&self, id: ConnectionId, role: Role) -> Classified {
        if !self.registry.contains(id) {
            warn!(connection_id = %id, role = %role, "announcement from unregistered connection");
            return Classified::UnknownConnection;
        }

        let outcome = self.bindings.bind(role, id);
        if let Some(previous) = outcome.superseded(id) {
            info!(
                role = %role,
                connection_id = %id,
                previous = %previous,
                "role rebound; previous connection superseded"
            );
        } else {
            info!(role = %role, connection_id = %id, both_bound = outcome.both_bound, "role bound");
        }
        counter!("swizzle_relay_role_bindings_total", 1, "role" => role.as_str());

        self.runner.role_bound(role, outcome.both_bound);
        Classified::Bound { role, outcome }
    }

    fn on_result(&self, id: ConnectionId, result: ExecutionResult) -> Classified {
        if !self.registry.contains(id) {
            return Classified::UnknownConnection;
        }

        let roles = self.bindings.roles_of(id);
        if roles.is_empty() {
            info!(
                connection_id = %id,
                status = result.status,
                summary = %result.summary,
                "execution result from a connection without a role"
            );
            return Classified::Unattributed;
        }

        debug!(connection_id = %id, roles = ?roles, status = result.status, "execution result");
        self.runner.ack(id, result);
        Classified::Ack { roles }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{dispatcher::Dispatcher, registry::Connection};

    fn fixture() -> (ResponseClassifier, Arc<ConnectionRegistry>, Arc<RoleBindings>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let bindings = Arc::new(RoleBindings::new());
        let runner = RunnerHandle::spawn(
            Dispatcher::new(Arc::clone(&registry), Arc::clone(&bindings)),
            Arc::clone(&bindings),
        );
        (
            ResponseClassifier::new(Arc::clone(&registry), Arc::clone(&bindings), runner),
            registry,
            bindings,
        )
    }

    #[test_timeout::tokio_timeout_test]
    async fn announcements_bind_roles() {
        let (classifier, registry, bindings) = fixture();
        let (ui, _ui_rx) = Connection::channel(4, None);
        let (swizzler, _swizzler_rx) = Connection::channel(4, None);
        let ui = registry.register(ui).unwrap();
        let swizzler = registry.register(swizzler).unwrap();

        let first = classifier.on_frame(ui, br#"{"message":"ui_connect"}"#);
        assert!(matches!(
            first,
            Classified::Bound { role: Role::UiDriver, outcome } if !outcome.both_bound
        ));
        let second = classifier.on_frame(swizzler, br#"{"message":"swizzling_connect"}"#);
        assert!(matches!(
            second,
            Classified::Bound { role: Role::Instrumentation, outcome } if outcome.both_bound
        ));
        assert_eq!(bindings.lookup(Role::UiDriver), Some(ui));
        assert_eq!(bindings.lookup(Role::Instrumentation), Some(swizzler));
    }

    #[test_timeout::tokio_timeout_test]
    async fn results_are_attributed_to_the_sender_role() {
        let (classifier, registry, _bindings) = fixture();
        let (connection, _rx) = Connection::channel(4, None);
        let id = registry.register(connection).unwrap();

        let frame = br#"{"status":0,"summary":"ok","detail":""}"#;
        assert!(matches!(classifier.on_frame(id, frame), Classified::Unattributed));

        classifier.on_frame(id, br#"{"message":"swizzling_connect"}"#);
        assert!(matches!(
            classifier.on_frame(id, frame),
            Classified::Ack { roles } if roles == vec![Role::Instrumentation]
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn unregistered_connections_cannot_bind() {
        let (classifier, _registry, bindings) = fixture();
        let stranger = ConnectionId::new();
        assert!(matches!(
            classifier.on_frame(stranger, br#"{"message":"ui_connect"}"#),
            Classified::UnknownConnection
        ));
        assert!(bindings.lookup(Role::UiDriver).is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn junk_is_discarded() {
        let (classifier, registry, bindings) = fixture();
        let (connection, _rx) = Connection::channel(4, None);
        let id = registry.register(connection).unwrap();

        assert!(matches!(
            classifier.on_frame(id, b"\xff\xfe"),
            Classified::Discarded(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            classifier.on_frame(id, br#"{"message":"watch_connect"}"#),
            Classified::Discarded(DecodeError::UnknownRole(_))
        ));
        assert!(matches!(
            classifier.on_frame(id, br#"{"method":"POST","path":"touch","data":null}"#),
            Classified::Discarded(DecodeError::Unrecognized)
        ));
        assert!(bindings.snapshot().is_empty());
    }
}
