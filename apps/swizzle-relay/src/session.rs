use std::{collections::BTreeMap, sync::Arc};

use metrics::{counter, gauge};
use relay_proto::{OutboundEnvelope, Role};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    bindings::RoleBindings,
    classifier::{Classified, ResponseClassifier},
    dispatcher::{DispatchError, Dispatcher},
    registry::{Connection, ConnectionId, ConnectionRegistry, RegistryError},
    runner::{RunnerError, RunnerHandle, RunnerSnapshot},
    script::Script,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("initial handshake failed: {0}")]
    Handshake(#[source] DispatchError),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    /// Greet every accepted connection with the `initial` envelope.
    pub handshake: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { handshake: true }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub connections: usize,
    pub bindings: BTreeMap<Role, ConnectionId>,
    pub runner: RunnerSnapshot,
}

/// One orchestration session: the connections, their roles and the script
/// runner driving them.
#[derive(Debug)]
pub struct RelaySession {
    config: SessionConfig,
    registry: Arc<ConnectionRegistry>,
    bindings: Arc<RoleBindings>,
    dispatcher: Dispatcher,
    classifier: ResponseClassifier,
    runner: RunnerHandle,
}

impl RelaySession {
    /// Must be called from within a tokio runtime; spawns the runner task.
    pub fn new(config: SessionConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let bindings = Arc::new(RoleBindings::new());
        let dispatcher = Dispatcher::new(Arc::clone(&registry), Arc::clone(&bindings));
        let runner = RunnerHandle::spawn(dispatcher.clone(), Arc::clone(&bindings));
        let classifier =
            ResponseClassifier::new(Arc::clone(&registry), Arc::clone(&bindings), runner.clone());
        Self {
            config,
            registry,
            bindings,
            dispatcher,
            classifier,
            runner,
        }
    }

    pub async fn accept(&self, connection: Connection) -> Result<ConnectionId, SessionError> {
        let remote_addr = connection.remote_addr();
        let id = self.registry.register(connection)?;

        if self.config.handshake {
            if let Err(err) = self
                .dispatcher
                .send_to(id, &OutboundEnvelope::initial())
                .await
            {
                self.registry.unregister(id);
                return Err(SessionError::Handshake(err));
            }
        }

        counter!("swizzle_relay_connections_accepted_total", 1);
        gauge!("swizzle_relay_connections_active", self.registry.len() as f64);
        info!(
            connection_id = %id,
            remote_addr = ?remote_addr,
            handshake = self.config.handshake,
            "connection accepted"
        );
        Ok(id)
    }

    pub fn on_frame(&self, id: ConnectionId, frame: &[u8]) -> Classified {
        counter!("swizzle_relay_frames_received_total", 1);
        self.classifier.on_frame(id, frame)
    }

    /// Forgets the connection and releases every role it held. Returns the
    /// released roles.
    pub fn disconnect(&self, id: ConnectionId) -> Vec<Role> {
        if self.registry.unregister(id).is_none() {
            return Vec::new();
        }

        let roles = self.bindings.evict(id);
        for role in &roles {
            warn!(connection_id = %id, role = %role, "role released by disconnect");
            self.runner.role_unbound(*role);
        }

        counter!("swizzle_relay_connections_closed_total", 1);
        gauge!("swizzle_relay_connections_active", self.registry.len() as f64);
        info!(connection_id = %id, released = roles.len(), "connection closed");
        roles
    }

    pub async fn load_script(&self, script: Script) -> Result<(), SessionError> {
        let commands = script.len();
        self.runner.load(script).await?;
        info!(commands, "script loaded");
        Ok(())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            connections: self.registry.len(),
            bindings: self.bindings.snapshot(),
            runner: self.runner.snapshot(),
        }
    }

    pub fn runner(&self) -> &RunnerHandle {
        &self.runner
    }

    pub fn bindings(&self) -> &RoleBindings {
        &self.bindings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        runner::{Outcome, RunnerState},
        script::{Command, WaitPolicy},
    };
    use relay_proto::{decode_inbound, ExecutionResult, RoleAnnouncement};
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn connect(session: &RelaySession) -> (ConnectionId, mpsc::Receiver<Vec<u8>>) {
        let (connection, rx) = Connection::channel(16, None);
        (session.accept(connection).await.unwrap(), rx)
    }

    fn announce(session: &RelaySession, id: ConnectionId, role: Role) {
        let frame = serde_json::to_vec(&RoleAnnouncement::new(role)).unwrap();
        assert!(matches!(session.on_frame(id, &frame), Classified::Bound { .. }));
    }

    fn ack(session: &RelaySession, id: ConnectionId, summary: &str) {
        let frame = serde_json::to_vec(&ExecutionResult {
            status: 0,
            summary: summary.to_string(),
            detail: String::new(),
        })
        .unwrap();
        session.on_frame(id, &frame);
    }

    async fn next_envelope(rx: &mut mpsc::Receiver<Vec<u8>>) -> OutboundEnvelope {
        let frame = rx.recv().await.unwrap();
        serde_json::from_slice(&frame).unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn accepted_connections_receive_the_initial_envelope() {
        let session = RelaySession::new(SessionConfig::default());
        let (_id, mut rx) = connect(&session).await;
        let envelope = next_envelope(&mut rx).await;
        assert_eq!(envelope, OutboundEnvelope::initial());
        assert_eq!(session.status().connections, 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn handshake_can_be_disabled() {
        let session = RelaySession::new(SessionConfig { handshake: false });
        let (_id, mut rx) = connect(&session).await;
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn closed_connections_are_not_accepted() {
        let session = RelaySession::new(SessionConfig::default());
        let (connection, rx) = Connection::channel(4, None);
        drop(rx);
        let err = session.accept(connection).await.unwrap_err();
        assert!(matches!(err, SessionError::Registry(_)));
        assert_eq!(session.status().connections, 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn disconnect_releases_roles() {
        let session = RelaySession::new(SessionConfig { handshake: false });
        let (id, _rx) = connect(&session).await;
        announce(&session, id, Role::UiDriver);
        announce(&session, id, Role::Instrumentation);

        let mut released = session.disconnect(id);
        released.sort();
        assert_eq!(released, Role::ALL.to_vec());
        assert!(session.status().bindings.is_empty());
        assert!(session.disconnect(id).is_empty());
    }

    #[test_timeout::tokio_timeout_test]
    async fn frames_after_disconnect_bind_nothing() {
        let session = RelaySession::new(SessionConfig { handshake: false });
        let (id, _rx) = connect(&session).await;
        session.disconnect(id);

        let frame = serde_json::to_vec(&RoleAnnouncement::new(Role::UiDriver)).unwrap();
        assert!(matches!(
            session.on_frame(id, &frame),
            Classified::UnknownConnection
        ));
        assert!(session.bindings().lookup(Role::UiDriver).is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn status_reports_bindings_by_role_name() {
        let session = RelaySession::new(SessionConfig { handshake: false });
        let (id, _rx) = connect(&session).await;
        announce(&session, id, Role::Instrumentation);

        let status = serde_json::to_value(session.status()).unwrap();
        assert_eq!(status["connections"], json!(1));
        assert_eq!(status["bindings"]["instrumentation"], json!(id));
        assert_eq!(status["runner"]["state"], json!("idle"));
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn commands_reach_only_their_target_role() {
        let session = RelaySession::new(SessionConfig::default());
        let (ui, mut ui_rx) = connect(&session).await;
        let (swizzler, mut swizzler_rx) = connect(&session).await;
        assert_eq!(next_envelope(&mut ui_rx).await, OutboundEnvelope::initial());
        assert_eq!(
            next_envelope(&mut swizzler_rx).await,
            OutboundEnvelope::initial()
        );

        let script = Script::new()
            .with(
                Command::new(Role::UiDriver, "launch")
                    .with_payload(json!({ "timeout": 0 }))
                    .with_wait(WaitPolicy::fixed_delay(Duration::from_secs(1))),
            )
            .with(
                Command::new(Role::Instrumentation, "setState")
                    .with_payload(json!({ "passthrough": true })),
            );
        session.load_script(script).await.unwrap();

        // Connect order does not matter: the swizzler announces first.
        announce(&session, swizzler, Role::Instrumentation);
        announce(&session, ui, Role::UiDriver);

        let snapshot = session.runner().finished().await.unwrap();
        assert_eq!(snapshot.state, RunnerState::Completed);

        assert_eq!(next_envelope(&mut ui_rx).await.path, "launch");
        assert_eq!(next_envelope(&mut swizzler_rx).await.path, "setState");
        assert!(ui_rx.try_recv().is_err());
        assert!(swizzler_rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn acks_flow_from_frames_to_the_runner() {
        let session = RelaySession::new(SessionConfig { handshake: false });
        let (ui, _ui_rx) = connect(&session).await;
        let (swizzler, mut swizzler_rx) = connect(&session).await;
        announce(&session, ui, Role::UiDriver);
        announce(&session, swizzler, Role::Instrumentation);

        let script = Script::new().with(
            Command::new(Role::Instrumentation, "call")
                .with_wait(WaitPolicy::await_ack(Duration::from_secs(5))),
        );
        session.load_script(script).await.unwrap();

        let frame = swizzler_rx.recv().await.unwrap();
        assert!(decode_inbound(&frame).is_err());
        // A result from the other peer does not satisfy the wait.
        ack(&session, ui, "unrelated");
        ack(&session, swizzler, "call");

        let snapshot = session.runner().finished().await.unwrap();
        assert_eq!(snapshot.state, RunnerState::Completed);
        assert!(matches!(
            &snapshot.outcomes[0].outcome,
            Outcome::Acknowledged { result } if result.summary == "call"
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn a_second_script_is_rejected() {
        let session = RelaySession::new(SessionConfig { handshake: false });
        session.load_script(Script::new()).await.unwrap();
        let err = session.load_script(Script::new()).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Runner(RunnerError::AlreadyLoaded(_))
        ));
    }
}
