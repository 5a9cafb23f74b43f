//! Snapshot reconciliation.
//!
//! [`Reconciler`] is the synchronous core: it applies snapshots in id order,
//! seeds initial values once and tracks the full input mapping.
//! [`ParameterSession`] drives a reconciler from one background task that
//! owns the connection, and publishes the result as a [`SessionView`].

use std::sync::Arc;
use std::time::Duration;

use paramdeck_telemetry::{log_session_opened, log_snapshot_applied, log_snapshot_discarded, MetricsRegistry};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

use crate::autofill::{self, AutofillParameter, AutofillSource};
use crate::client::{ChannelHandler, ConnectionEvent, ConnectionHandle, ConnectionState, DynamicParameterClient};
use crate::error::{ClientError, ConnectionError};
use crate::protocol::{Diagnostic, DynamicParametersResponse, Inputs, PreviewParameter};

/// Delay before free-text edits are sent.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

const COMMAND_QUEUE: usize = 64;

/// How long a closing session waits for its connection to finish closing.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Result of offering a snapshot to a [`Reconciler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Not newer than what is already shown; nothing changed.
    Stale { id: i64, highest: i64 },
    /// Parameters and diagnostics were replaced. `seed` carries the initial
    /// values to send when this was the first non-empty parameter set.
    Applied { seed: Option<Inputs> },
}

/// Pure snapshot state machine.
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    highest_applied: Option<i64>,
    parameters: Vec<PreviewParameter>,
    diagnostics: Vec<Diagnostic>,
    inputs: Inputs,
    seeded: bool,
    autofill: Vec<AutofillParameter>,
}

impl Reconciler {
    /// `autofill` may hold several values per name; the highest-precedence
    /// source wins.
    pub fn new(autofill: Vec<AutofillParameter>) -> Self {
        Self {
            autofill: autofill::merge(autofill),
            ..Self::default()
        }
    }

    /// Apply `response` unless an equal or newer id was already applied.
    pub fn apply(&mut self, response: DynamicParametersResponse) -> ApplyOutcome {
        if let Some(highest) = self.highest_applied {
            if response.id <= highest {
                return ApplyOutcome::Stale {
                    id: response.id,
                    highest,
                };
            }
        }

        self.highest_applied = Some(response.id);
        self.parameters = response.parameters;
        self.parameters.sort_by_key(|p| p.order);
        self.diagnostics = response.diagnostics;

        if self.seeded || self.parameters.is_empty() {
            return ApplyOutcome::Applied { seed: None };
        }

        self.seeded = true;
        let mut seed = autofill::initial_values(&self.parameters, &self.autofill);
        // Edits made before the first snapshot survive seeding.
        seed.extend(std::mem::take(&mut self.inputs));
        self.inputs = seed;
        ApplyOutcome::Applied {
            seed: Some(self.inputs.clone()),
        }
    }

    /// Record an edit and return the complete mapping to send.
    pub fn set_input(&mut self, name: impl Into<String>, value: impl Into<String>) -> Inputs {
        self.inputs.insert(name.into(), value.into());
        self.inputs.clone()
    }

    /// Replace the whole mapping with the page's form values.
    pub fn replace_inputs(&mut self, inputs: Inputs) -> Inputs {
        self.inputs = inputs;
        self.inputs.clone()
    }

    pub fn parameters(&self) -> &[PreviewParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&PreviewParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn highest_applied(&self) -> Option<i64> {
        self.highest_applied
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded
    }
}

/// What the page renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    /// Parameters ordered by their ordering key.
    pub parameters: Vec<PreviewParameter>,
    pub diagnostics: Vec<Diagnostic>,
    pub inputs: Inputs,
    pub state: ConnectionState,
    /// Set once the connection failed or closed unexpectedly.
    pub error: Option<ConnectionError>,
    pub latest_id: Option<i64>,
    pub last_sent_id: Option<i64>,
    pub seeded: bool,
    /// A debounced edit has not been sent yet.
    pub pending_edit: bool,
}

impl Default for SessionView {
    fn default() -> Self {
        Self {
            parameters: Vec::new(),
            diagnostics: Vec::new(),
            inputs: Inputs::new(),
            state: ConnectionState::Connecting,
            error: None,
            latest_id: None,
            last_sent_id: None,
            seeded: false,
            pending_edit: false,
        }
    }
}

impl SessionView {
    pub fn parameter(&self, name: &str) -> Option<&PreviewParameter> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// A snapshot was shown and it answers the last request sent.
    pub fn is_caught_up(&self) -> bool {
        if self.pending_edit {
            return false;
        }
        match (self.latest_id, self.last_sent_id) {
            (Some(latest), Some(sent)) => latest >= sent,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// No further snapshots will arrive.
    pub fn is_finished(&self) -> bool {
        self.error.is_some() || self.state.is_terminal()
    }

    /// Server diagnostics of error severity, top-level or per parameter.
    pub fn has_error_diagnostics(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_error) || self.parameters.iter().any(|p| p.has_errors())
    }
}

/// Parameters for [`ParameterSession::open`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub version_id: Uuid,
    pub owner_id: Uuid,
    pub autofill: Vec<AutofillParameter>,
    pub debounce: Duration,
}

impl SessionOptions {
    pub fn new(version_id: Uuid, owner_id: Uuid) -> Self {
        Self {
            version_id,
            owner_id,
            autofill: Vec::new(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    pub fn with_autofill(mut self, autofill: Vec<AutofillParameter>) -> Self {
        self.autofill = autofill;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }
}

enum SessionCommand {
    SetInput { name: String, value: String },
    Replace(Inputs),
    Close,
}

/// A live evaluation session for one (version, owner) pair.
///
/// Dropping the session closes its connection.
pub struct ParameterSession {
    client: DynamicParameterClient,
    options: SessionOptions,
    commands: mpsc::Sender<SessionCommand>,
    view: watch::Receiver<SessionView>,
}

impl ParameterSession {
    /// Open the connection and start the driver task.
    pub fn open(client: &DynamicParameterClient, options: SessionOptions) -> Result<Self, ClientError> {
        let (handler, events) = ChannelHandler::new();
        let handle = client.open(options.version_id, options.owner_id, handler)?;

        let (view_tx, view_rx) = watch::channel(SessionView::default());
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);

        let driver = SessionDriver {
            handle,
            reconciler: Reconciler::new(options.autofill.clone()),
            view: view_tx,
            metrics: client.metrics().cloned(),
            debounce: options.debounce,
            flush_at: None,
            last_sent_id: None,
        };
        tokio::spawn(driver.run(events, command_rx));

        log_session_opened!(
            version_id = %options.version_id,
            owner_id = %options.owner_id,
            autofill = options.autofill.len()
        );

        Ok(Self {
            client: client.clone(),
            options,
            commands: command_tx,
            view: view_rx,
        })
    }

    pub fn version_id(&self) -> Uuid {
        self.options.version_id
    }

    pub fn owner_id(&self) -> Uuid {
        self.options.owner_id
    }

    /// Watch every published view.
    pub fn subscribe(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// The latest view.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    /// Edit one field. Returns false when the session no longer accepts
    /// commands.
    pub fn set_input(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.command(SessionCommand::SetInput {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Send the page's complete form values.
    ///
    /// When `owner_id` names a different owner the current connection is
    /// closed first and a new one opened for that owner; `inputs` then seed
    /// the new connection, subject to the usual option checks.
    pub async fn send_message(&mut self, inputs: Inputs, owner_id: Option<Uuid>) -> Result<(), ClientError> {
        match owner_id {
            Some(owner) if owner != self.options.owner_id => {
                let carried = inputs
                    .into_iter()
                    .map(|(name, value)| AutofillParameter::new(name, value, AutofillSource::Form));
                let mut options = self.options.clone();
                options.owner_id = owner;
                options.autofill = autofill::merge(options.autofill.into_iter().chain(carried));

                self.close();
                self.closed().await;
                *self = ParameterSession::open(&self.client, options)?;
                Ok(())
            }
            _ => {
                self.command(SessionCommand::Replace(inputs));
                Ok(())
            }
        }
    }

    /// Close the session. Idempotent.
    pub fn close(&self) {
        self.command(SessionCommand::Close);
    }

    /// Wait until the session has stopped and its connection is released.
    pub async fn closed(&self) {
        let mut rx = self.view.clone();
        // A dropped sender means the driver is already gone.
        let _ = rx.wait_for(|view| view.state.is_terminal()).await;
    }

    /// Wait for the first applied snapshot.
    pub async fn wait_until_ready(&self) -> Result<SessionView, ClientError> {
        self.wait_for(|view| view.latest_id.is_some()).await
    }

    /// Wait until the latest snapshot answers the last request sent.
    pub async fn wait_until_caught_up(&self) -> Result<SessionView, ClientError> {
        self.wait_for(SessionView::is_caught_up).await
    }

    async fn wait_for(&self, ready: impl Fn(&SessionView) -> bool) -> Result<SessionView, ClientError> {
        let mut rx = self.view.clone();
        let view = rx
            .wait_for(|view| ready(view) || view.is_finished())
            .await
            .map_err(|_| ClientError::SessionClosed)?
            .clone();

        if ready(&view) {
            return Ok(view);
        }
        match view.error {
            Some(error) => Err(error.into()),
            None => Err(ClientError::SessionClosed),
        }
    }

    fn command(&self, command: SessionCommand) -> bool {
        match self.commands.try_send(command) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(version_id = %self.options.version_id, "Session command queue full");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

struct SessionDriver {
    handle: ConnectionHandle,
    reconciler: Reconciler,
    view: watch::Sender<SessionView>,
    metrics: Option<Arc<MetricsRegistry>>,
    debounce: Duration,
    /// When the pending free-text edit is due.
    flush_at: Option<Instant>,
    last_sent_id: Option<i64>,
}

impl SessionDriver {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) {
        let mut state_rx = self.handle.subscribe_state();

        loop {
            let flush_at = self.flush_at;
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    // Terminal states are published together with their cause.
                    if !state.is_terminal() {
                        self.view.send_modify(|view| view.state = state);
                    }
                }

                event = events.recv() => match event {
                    Some(ConnectionEvent::Message(response)) => self.on_snapshot(response),
                    Some(ConnectionEvent::Error(error)) => self.on_failure(error),
                    Some(ConnectionEvent::Closed) => self.on_failure(ConnectionError::UnexpectedlyClosed),
                    // The connection task has finished.
                    None => break,
                },

                command = commands.recv() => match command {
                    Some(SessionCommand::SetInput { name, value }) => self.on_set_input(name, value),
                    Some(SessionCommand::Replace(inputs)) => {
                        let inputs = self.reconciler.replace_inputs(inputs);
                        self.flush_at = None;
                        self.send(inputs);
                    }
                    Some(SessionCommand::Close) | None => break,
                },

                _ = tokio::time::sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    self.flush_at = None;
                    let inputs = self.reconciler.inputs().clone();
                    self.send(inputs);
                }
            }
        }

        self.handle.close();
        let _ = tokio::time::timeout(CLOSE_GRACE, state_rx.wait_for(|state| state.is_terminal())).await;
        let state = self.handle.state();
        self.view.send_modify(|view| {
            view.state = if state.is_terminal() { state } else { ConnectionState::Closed };
            view.pending_edit = false;
        });
    }

    fn on_snapshot(&mut self, response: DynamicParametersResponse) {
        let id = response.id;
        match self.reconciler.apply(response) {
            ApplyOutcome::Stale { id, highest } => {
                log_snapshot_discarded!(id, highest);
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot(false);
                }
            }
            ApplyOutcome::Applied { seed } => {
                log_snapshot_applied!(
                    id,
                    parameters = self.reconciler.parameters().len(),
                    diagnostics = self.reconciler.diagnostics().len()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_snapshot(true);
                }
                if let Some(seed) = seed {
                    tracing::debug!(id, values = seed.len(), "Seeding initial parameter values");
                    if !self.send_quiet(seed) {
                        tracing::warn!(id, "Initial parameter values were not sent; later edits resend them");
                    }
                }
                self.publish();
            }
        }
    }

    fn on_failure(&mut self, error: ConnectionError) {
        let state = self.handle.state();
        self.view.send_modify(|view| {
            view.state = state;
            view.error = Some(error);
        });
    }

    fn on_set_input(&mut self, name: String, value: String) {
        let free_text = self
            .reconciler
            .parameter(&name)
            .is_some_and(|p| p.form_type.is_free_text());
        let inputs = self.reconciler.set_input(name, value);

        if free_text && !self.debounce.is_zero() {
            self.flush_at = Some(Instant::now() + self.debounce);
            self.publish();
        } else {
            self.flush_at = None;
            self.send(inputs);
        }
    }

    fn send(&mut self, inputs: Inputs) {
        self.send_quiet(inputs);
        self.publish();
    }

    /// Returns whether the request was queued.
    fn send_quiet(&mut self, inputs: Inputs) -> bool {
        match self.handle.send(inputs) {
            Some(id) => {
                self.last_sent_id = Some(id);
                true
            }
            None => false,
        }
    }

    fn publish(&self) {
        let reconciler = &self.reconciler;
        let last_sent_id = self.last_sent_id;
        let pending_edit = self.flush_at.is_some();
        self.view.send_modify(|view| {
            view.parameters = reconciler.parameters().to_vec();
            view.diagnostics = reconciler.diagnostics().to_vec();
            view.inputs = reconciler.inputs().clone();
            view.latest_id = reconciler.highest_applied();
            view.seeded = reconciler.is_seeded();
            view.last_sent_id = last_sent_id;
            view.pending_edit = pending_edit;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{FormType, NullHclString, ParameterOption};

    fn parameter(name: &str, value: &str, order: i64) -> PreviewParameter {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "type": "string",
            "order": order,
            "value": {"value": value, "valid": true},
        }))
        .unwrap()
    }

    fn snapshot(id: i64, parameters: Vec<PreviewParameter>) -> DynamicParametersResponse {
        DynamicParametersResponse {
            id,
            parameters,
            diagnostics: Vec::new(),
        }
    }

    fn names(reconciler: &Reconciler) -> Vec<&str> {
        reconciler.parameters().iter().map(|p| p.name.as_str()).collect()
    }

    #[test]
    fn test_out_of_order_snapshot_discarded() {
        let mut reconciler = Reconciler::new(Vec::new());

        let newer = reconciler.apply(snapshot(4, vec![parameter("SliderParam", "5", 0)]));
        assert!(matches!(newer, ApplyOutcome::Applied { .. }));

        let older = reconciler.apply(snapshot(1, vec![parameter("OldParam", "x", 0)]));
        assert_eq!(older, ApplyOutcome::Stale { id: 1, highest: 4 });
        assert_eq!(names(&reconciler), vec!["SliderParam"]);
        assert_eq!(reconciler.highest_applied(), Some(4));
    }

    #[test]
    fn test_equal_id_discarded() {
        let mut reconciler = Reconciler::new(Vec::new());
        reconciler.apply(snapshot(2, vec![parameter("a", "1", 0)]));
        let again = reconciler.apply(snapshot(2, vec![parameter("b", "1", 0)]));
        assert!(matches!(again, ApplyOutcome::Stale { .. }));
        assert_eq!(names(&reconciler), vec!["a"]);
    }

    #[test]
    fn test_initial_snapshot_with_negative_id_applied() {
        let mut reconciler = Reconciler::new(Vec::new());
        let outcome = reconciler.apply(snapshot(-1, vec![parameter("cpu_count", "2", 0)]));
        assert!(matches!(outcome, ApplyOutcome::Applied { seed: Some(_) }));
        assert_eq!(reconciler.highest_applied(), Some(-1));

        // The answer to request 0 is newer.
        let outcome = reconciler.apply(snapshot(0, vec![parameter("cpu_count", "2", 0)]));
        assert_eq!(outcome, ApplyOutcome::Applied { seed: None });
    }

    #[test]
    fn test_seeding_happens_once() {
        let mut reconciler = Reconciler::new(Vec::new());

        let first = reconciler.apply(snapshot(0, vec![parameter("cpu_count", "2", 0)]));
        let expected: Inputs = [("cpu_count".to_string(), "2".to_string())].into();
        assert_eq!(first, ApplyOutcome::Applied { seed: Some(expected) });

        let second = reconciler.apply(snapshot(1, vec![parameter("cpu_count", "2", 0)]));
        assert_eq!(second, ApplyOutcome::Applied { seed: None });
    }

    #[test]
    fn test_empty_snapshot_does_not_seed() {
        let mut reconciler = Reconciler::new(Vec::new());
        assert_eq!(reconciler.apply(snapshot(-1, Vec::new())), ApplyOutcome::Applied { seed: None });
        assert!(!reconciler.is_seeded());

        let outcome = reconciler.apply(snapshot(0, vec![parameter("region", "eu", 0)]));
        assert!(matches!(outcome, ApplyOutcome::Applied { seed: Some(_) }));
    }

    #[test]
    fn test_edit_sends_full_state() {
        let mut reconciler = Reconciler::new(Vec::new());
        reconciler.apply(snapshot(0, vec![parameter("a", "1", 0), parameter("b", "x", 1)]));

        let inputs = reconciler.set_input("a", "9");
        let expected: Inputs = [
            ("a".to_string(), "9".to_string()),
            ("b".to_string(), "x".to_string()),
        ]
        .into();
        assert_eq!(inputs, expected);
    }

    #[test]
    fn test_autofill_wins_over_server_default() {
        let mut param = parameter("instance_type", "t3.micro", 0);
        param.form_type = FormType::Dropdown;
        param.options = ["t3.micro", "t3.large"]
            .iter()
            .map(|v| ParameterOption {
                name: v.to_string(),
                description: String::new(),
                value: NullHclString::known(*v),
                icon: String::new(),
            })
            .collect();

        let mut reconciler = Reconciler::new(vec![AutofillParameter::new(
            "instance_type",
            "t3.large",
            AutofillSource::Url,
        )]);

        match reconciler.apply(snapshot(-1, vec![param])) {
            ApplyOutcome::Applied { seed: Some(seed) } => assert_eq!(seed["instance_type"], "t3.large"),
            other => panic!("expected seed, got {other:?}"),
        }
    }

    #[test]
    fn test_parameters_sorted_by_order() {
        let mut reconciler = Reconciler::new(Vec::new());
        reconciler.apply(snapshot(
            0,
            vec![parameter("last", "", 3), parameter("first", "", 1), parameter("middle", "", 2)],
        ));
        assert_eq!(names(&reconciler), vec!["first", "middle", "last"]);
    }

    #[test]
    fn test_edit_before_first_snapshot_survives_seed() {
        let mut reconciler = Reconciler::new(Vec::new());
        reconciler.set_input("region", "us-east");

        match reconciler.apply(snapshot(-1, vec![parameter("region", "eu-west", 0)])) {
            ApplyOutcome::Applied { seed: Some(seed) } => assert_eq!(seed["region"], "us-east"),
            other => panic!("expected seed, got {other:?}"),
        }
    }

    #[test]
    fn test_view_caught_up() {
        let mut view = SessionView::default();
        assert!(!view.is_caught_up());

        view.latest_id = Some(-1);
        assert!(view.is_caught_up());

        view.last_sent_id = Some(0);
        assert!(!view.is_caught_up());

        view.latest_id = Some(0);
        assert!(view.is_caught_up());

        view.pending_edit = true;
        assert!(!view.is_caught_up());
    }
}
