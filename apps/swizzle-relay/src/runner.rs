//! Script runner.
//!
//! A single task owns the run state and consumes [`RunnerEvent`]s from an
//! unbounded channel, so transitions are never observed concurrently. Every
//! transition is published as a [`RunnerSnapshot`] on a watch channel.
//!
//! ```text
//! Idle --load--> AwaitingPeers --both roles bound--> Running --> Completed
//!                                                        \-----> Failed
//! ```

use std::sync::Arc;

use metrics::{counter, gauge};
use relay_proto::{ExecutionResult, Role};
use serde::Serialize;
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    bindings::RoleBindings,
    dispatcher::{DispatchError, Dispatcher},
    registry::ConnectionId,
    script::{Command, Script, UnboundPolicy, WaitPolicy},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    AwaitingPeers,
    Running,
    Completed,
    Failed,
}

impl RunnerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunnerState::Completed | RunnerState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Fire-and-forget command written to the wire.
    Sent,
    Acknowledged { result: ExecutionResult },
    /// Fixed delay ran out. A result that arrived in the meantime is kept.
    Elapsed { early_result: Option<ExecutionResult> },
    /// No correlated result before the ack window closed.
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub index: usize,
    pub target: Role,
    pub verb: String,
    pub connection_id: ConnectionId,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunnerSnapshot {
    pub state: RunnerState,
    pub position: usize,
    pub total: usize,
    pub outcomes: Vec<StepOutcome>,
    pub failure: Option<String>,
}

impl Default for RunnerSnapshot {
    fn default() -> Self {
        Self {
            state: RunnerState::Idle,
            position: 0,
            total: 0,
            outcomes: Vec::new(),
            failure: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("a script is already loaded (runner is {0:?})")]
    AlreadyLoaded(RunnerState),
    #[error("script runner has stopped")]
    Stopped,
}

#[derive(Debug)]
pub enum RunnerEvent {
    Load {
        script: Script,
        reply: oneshot::Sender<Result<(), RunnerError>>,
    },
    Bound {
        role: Role,
        both_bound: bool,
    },
    Unbound {
        role: Role,
    },
    Ack {
        connection_id: ConnectionId,
        result: ExecutionResult,
    },
}

/// Cheap, cloneable front end to the runner task.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    events: mpsc::UnboundedSender<RunnerEvent>,
    snapshot: watch::Receiver<RunnerSnapshot>,
}

impl RunnerHandle {
    /// Spawns the runner task on the current tokio runtime.
    pub fn spawn(dispatcher: Dispatcher, bindings: Arc<RoleBindings>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(RunnerSnapshot::default());
        let runner = ScriptRunner {
            dispatcher,
            bindings,
            events: events_rx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(runner.run());
        Self {
            events: events_tx,
            snapshot: snapshot_rx,
        }
    }

    pub async fn load(&self, script: Script) -> Result<(), RunnerError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(RunnerEvent::Load { script, reply })
            .map_err(|_| RunnerError::Stopped)?;
        response.await.map_err(|_| RunnerError::Stopped)?
    }

    pub fn role_bound(&self, role: Role, both_bound: bool) {
        self.notify(RunnerEvent::Bound { role, both_bound });
    }

    pub fn role_unbound(&self, role: Role) {
        self.notify(RunnerEvent::Unbound { role });
    }

    pub fn ack(&self, connection_id: ConnectionId, result: ExecutionResult) {
        self.notify(RunnerEvent::Ack {
            connection_id,
            result,
        });
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunnerSnapshot> {
        self.snapshot.clone()
    }

    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&RunnerSnapshot) -> bool,
    ) -> Result<RunnerSnapshot, RunnerError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| RunnerError::Stopped)?;
        Ok(snapshot.clone())
    }

    /// Resolves once the run reaches `Completed` or `Failed`.
    pub async fn finished(&self) -> Result<RunnerSnapshot, RunnerError> {
        self.wait_until(|snapshot| snapshot.state.is_terminal())
            .await
    }

    fn notify(&self, event: RunnerEvent) {
        if self.events.send(event).is_err() {
            debug!("script runner stopped; dropping event");
        }
    }
}

struct ScriptRunner {
    dispatcher: Dispatcher,
    bindings: Arc<RoleBindings>,
    events: mpsc::UnboundedReceiver<RunnerEvent>,
    snapshot: watch::Sender<RunnerSnapshot>,
}

impl ScriptRunner {
    async fn run(mut self) {
        let Some(script) = self.wait_for_script().await else {
            return;
        };
        self.publish(|snapshot| {
            snapshot.state = RunnerState::AwaitingPeers;
            snapshot.total = script.len();
        });

        if self.bindings.both_bound() || self.wait_for_peers().await {
            self.execute(script).await;
        }

        while let Some(event) = self.events.recv().await {
            self.handle_stray(event);
        }
    }

    async fn wait_for_script(&mut self) -> Option<Script> {
        while let Some(event) = self.events.recv().await {
            match event {
                RunnerEvent::Load { script, reply } => {
                    info!(commands = script.len(), "script loaded");
                    let _ = reply.send(Ok(()));
                    return Some(script);
                }
                other => self.handle_stray(other),
            }
        }
        None
    }

    async fn wait_for_peers(&mut self) -> bool {
        info!("waiting for both roles to connect");
        while let Some(event) = self.events.recv().await {
            match event {
                RunnerEvent::Bound {
                    role,
                    both_bound: true,
                } => {
                    // The flag was captured at bind time; a peer may have left since.
                    if self.bindings.both_bound() {
                        info!(role = %role, "both roles bound");
                        return true;
                    }
                    debug!(role = %role, "stale both-bound signal; still waiting for peers");
                }
                other => self.handle_stray(other),
            }
        }
        false
    }

    async fn execute(&mut self, script: Script) {
        self.publish(|snapshot| snapshot.state = RunnerState::Running);
        info!(commands = script.len(), "script running");

        for (index, command) in script.commands().iter().enumerate() {
            self.publish(|snapshot| snapshot.position = index);
            gauge!("swizzle_relay_script_position", index as f64);

            let connection_id = match self.dispatch(command).await {
                Ok(id) => id,
                Err(err) => {
                    error!(
                        index,
                        role = %command.target,
                        verb = %command.verb,
                        error = %err,
                        "script failed"
                    );
                    self.publish(|snapshot| {
                        snapshot.state = RunnerState::Failed;
                        snapshot.failure = Some(format!("command #{index} ({}): {err}", command.verb));
                    });
                    return;
                }
            };

            let outcome = self.settle(command, connection_id).await;
            debug!(index, verb = %command.verb, outcome = ?outcome, "step settled");
            self.publish(|snapshot| {
                snapshot.outcomes.push(StepOutcome {
                    index,
                    target: command.target,
                    verb: command.verb.clone(),
                    connection_id,
                    outcome,
                })
            });
        }

        info!(commands = script.len(), "script completed");
        self.publish(|snapshot| {
            snapshot.state = RunnerState::Completed;
            snapshot.position = script.len();
        });
    }

    async fn dispatch(&mut self, command: &Command) -> Result<ConnectionId, DispatchError> {
        let first = self.dispatcher.send(command.target, command).await;
        let (role, window) = match (first, command.on_unbound) {
            (Err(DispatchError::RoleUnbound(role)), UnboundPolicy::AwaitRebind { timeout }) => {
                (role, timeout)
            }
            (result, _) => return result,
        };

        let deadline = Instant::now() + window;
        loop {
            warn!(
                role = %role,
                verb = %command.verb,
                window_ms = window.as_millis() as u64,
                "role unbound; waiting for it to reconnect"
            );
            if !self.wait_for_role(role, deadline).await {
                return Err(DispatchError::RoleUnbound(role));
            }
            match self.dispatcher.send(command.target, command).await {
                Err(DispatchError::RoleUnbound(_)) => continue,
                result => return result,
            }
        }
    }

    async fn wait_for_role(&mut self, role: Role, deadline: Instant) -> bool {
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return false,
                event = self.events.recv() => match event {
                    Some(RunnerEvent::Bound { role: bound, .. }) if bound == role => return true,
                    Some(other) => self.handle_stray(other),
                    None => return false,
                },
            }
        }
    }

    async fn settle(&mut self, command: &Command, sent_to: ConnectionId) -> Outcome {
        match command.wait {
            WaitPolicy::FireAndForget => Outcome::Sent,
            WaitPolicy::FixedDelay(delay) => {
                let deadline = Instant::now() + delay;
                let mut early_result = None;
                loop {
                    tokio::select! {
                        _ = sleep_until(deadline) => break,
                        event = self.events.recv() => match event {
                            Some(RunnerEvent::Ack { connection_id, result })
                                if early_result.is_none()
                                    && self.is_from_target(command.target, sent_to, connection_id) =>
                            {
                                log_result(command, &result);
                                early_result = Some(result);
                            }
                            Some(other) => self.handle_stray(other),
                            None => {
                                sleep_until(deadline).await;
                                break;
                            }
                        },
                    }
                }
                Outcome::Elapsed { early_result }
            }
            WaitPolicy::AwaitAck { timeout } => {
                let deadline = timeout.map(|timeout| Instant::now() + timeout);
                loop {
                    let event = match deadline {
                        Some(deadline) => tokio::select! {
                            _ = sleep_until(deadline) => return self.ack_timeout(command),
                            event = self.events.recv() => event,
                        },
                        None => self.events.recv().await,
                    };
                    match event {
                        Some(RunnerEvent::Ack {
                            connection_id,
                            result,
                        }) if self.is_from_target(command.target, sent_to, connection_id) => {
                            log_result(command, &result);
                            return Outcome::Acknowledged { result };
                        }
                        Some(RunnerEvent::Unbound { role })
                            if role == command.target && deadline.is_none() =>
                        {
                            // Without a window the ack could never arrive.
                            return self.ack_timeout(command);
                        }
                        Some(other) => self.handle_stray(other),
                        None => {
                            if let Some(deadline) = deadline {
                                sleep_until(deadline).await;
                            }
                            return self.ack_timeout(command);
                        }
                    }
                }
            }
        }
    }

    fn ack_timeout(&self, command: &Command) -> Outcome {
        warn!(role = %command.target, verb = %command.verb, "no execution result before ack timeout");
        counter!(
            "swizzle_relay_ack_timeouts_total",
            1,
            "role" => command.target.as_str()
        );
        Outcome::Timeout
    }

    /// The sender must be the connection the command went to, or whichever
    /// connection holds the target role now.
    fn is_from_target(&self, target: Role, sent_to: ConnectionId, from: ConnectionId) -> bool {
        from == sent_to || self.bindings.lookup(target) == Some(from)
    }

    fn handle_stray(&mut self, event: RunnerEvent) {
        let state = self.snapshot.borrow().state;
        match event {
            RunnerEvent::Load { reply, .. } => {
                warn!(state = ?state, "rejecting second script");
                let _ = reply.send(Err(RunnerError::AlreadyLoaded(state)));
            }
            RunnerEvent::Ack {
                connection_id,
                result,
            } => {
                info!(
                    connection_id = %connection_id,
                    status = result.status,
                    summary = %result.summary,
                    detail = %result.detail,
                    "uncorrelated execution result"
                );
            }
            RunnerEvent::Bound { role, .. } if state == RunnerState::Running => {
                info!(role = %role, "role rebound mid-run; script position unchanged");
            }
            RunnerEvent::Bound { role, both_bound } => {
                debug!(role = %role, both_bound, state = ?state, "role bound");
            }
            RunnerEvent::Unbound { role } => {
                debug!(role = %role, state = ?state, "role unbound");
            }
        }
    }

    fn publish(&self, update: impl FnOnce(&mut RunnerSnapshot)) {
        self.snapshot.send_modify(update);
    }
}

fn log_result(command: &Command, result: &ExecutionResult) {
    info!(
        role = %command.target,
        verb = %command.verb,
        status = result.status,
        summary = %result.summary,
        detail = %result.detail,
        "command executed"
    );
}
