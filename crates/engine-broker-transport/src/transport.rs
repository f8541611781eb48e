//! Persistent engine connection.
//!
//! A `Transport` is a cheap handle to an actor task that owns the socket, the
//! pending-call table, the connection state and the generation counter. All of
//! those are mutated only inside the actor; handles talk to it over a channel.
//!
//! Lifecycle:
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected
//!                               |                  |
//!                               +--err--> Disconnected
//! Connected --drop--> Reconnecting --ok--> Connected (generation + 1)
//!                          |
//!                          +--attempts exhausted--> Disconnected
//! any --close--> Closed (terminal)
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::Arc,
    time::Duration,
};

use engine_broker_core::{CredentialSupplier, EngineError, NoCredentials, TransportConfig};
use serde_json::Value;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep, sleep_until, timeout},
};

use crate::{
    connector::{Connector, Link},
    protocol::{Inbound, Request},
};

/// Lifecycle events are rare; the channel only absorbs short bursts.
const EVENT_CAPACITY: usize = 256;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State and generation as last published by the actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatus {
    pub state: TransportState,
    pub generation: u64,
}

/// Lifecycle notifications.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// First successful connect after `connect()`.
    Connected { generation: u64 },
    /// The socket closed without `close()` being called.
    Dropped { reason: String },
    /// A reconnect attempt is scheduled.
    Reconnecting { attempt: u32, delay: Duration },
    /// Automatic reconnection succeeded.
    Reconnected { generation: u64 },
    /// Reconnection gave up; the transport is Disconnected.
    ReconnectFailed { attempts: u32, error: EngineError },
    /// `close()` was called.
    Closed,
}

/// Everything needed to spawn a transport.
pub struct TransportOptions {
    pub endpoint: String,
    pub connector: Arc<dyn Connector>,
    pub credentials: Arc<dyn CredentialSupplier>,
    pub credential_type: String,
    pub config: TransportConfig,
    /// Generation to count up from. A replacement transport for the same
    /// context passes the old one's generation so handles stay distinguishable.
    pub initial_generation: u64,
}

impl TransportOptions {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint: endpoint.into(),
            connector,
            credentials: Arc::new(NoCredentials),
            credential_type: String::new(),
            config: TransportConfig::default(),
            initial_generation: 0,
        }
    }

    #[must_use]
    pub fn credentials(
        mut self,
        credentials: Arc<dyn CredentialSupplier>,
        credential_type: impl Into<String>,
    ) -> Self {
        self.credentials = credentials;
        self.credential_type = credential_type.into();
        self
    }

    #[must_use]
    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn initial_generation(mut self, generation: u64) -> Self {
        self.initial_generation = generation;
        self
    }
}

enum Command {
    Connect {
        reply: oneshot::Sender<Result<u64, EngineError>>,
    },
    Call {
        method: String,
        handle: i64,
        params: Value,
        reply: oneshot::Sender<Result<Value, EngineError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
    PendingCount {
        reply: oneshot::Sender<usize>,
    },
}

/// Messages from tasks the actor spawned itself.
enum Internal {
    AttemptFinished {
        attempt_id: u64,
        result: Result<Link, EngineError>,
    },
    ReconnectDue {
        timer_id: u64,
    },
}

/// Handle to a transport actor. Clones share the same connection.
///
/// Dropping the last handle closes the transport.
#[derive(Clone)]
pub struct Transport {
    endpoint: Arc<str>,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TransportStatus>,
    events: broadcast::Sender<TransportEvent>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("endpoint", &self.endpoint)
            .field("status", &*self.status.borrow())
            .finish()
    }
}

impl Transport {
    /// Spawn the actor. Starts Disconnected; call `connect()` to open the socket.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn spawn(options: TransportOptions) -> Self {
        let endpoint: Arc<str> = Arc::from(options.endpoint.as_str());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(TransportStatus {
            state: TransportState::Disconnected,
            generation: options.initial_generation,
        });
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let actor = Actor {
            endpoint: Arc::clone(&endpoint),
            connector: options.connector,
            credentials: options.credentials,
            credential_type: options.credential_type,
            config: options.config,
            state: TransportState::Disconnected,
            generation: options.initial_generation,
            next_id: 1,
            pending: HashMap::new(),
            deadlines: BTreeSet::new(),
            link: None,
            attempt: None,
            timer: None,
            task_seq: 0,
            reconnect_attempt: 0,
            connect_waiters: Vec::new(),
            internal_tx,
            status_tx,
            events: events.clone(),
        };
        tokio::spawn(actor.run(command_rx, internal_rx));

        Self {
            endpoint,
            commands,
            status,
            events,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[must_use]
    pub fn state(&self) -> TransportState {
        self.status.borrow().state
    }

    /// Number of successful connects, counting from the initial generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.status.borrow().generation
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == TransportState::Connected
    }

    /// Watch state and generation changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    /// Lifecycle events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn ask<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    /// Open the socket. A no-op returning the current generation when already
    /// connected; joins the in-flight attempt while connecting or reconnecting.
    ///
    /// # Errors
    /// Returns `EngineError::Connection` on refusal, credential failure or
    /// connect timeout, and `EngineError::Closed` after `close()`.
    pub async fn connect(&self) -> Result<u64, EngineError> {
        self.ask(|reply| Command::Connect { reply }).await?
    }

    /// Issue one call and wait for its matched response.
    ///
    /// # Errors
    /// - `EngineError::Remote` if the engine answered with an error frame
    /// - `EngineError::Timeout` if no response arrived within the request timeout
    /// - `EngineError::ConnectionLost` if the socket dropped first
    /// - `EngineError::Connection` if not connected, `EngineError::Closed` after close
    pub async fn call(
        &self,
        method: &str,
        handle: i64,
        params: Value,
    ) -> Result<Value, EngineError> {
        self.ask(|reply| Command::Call {
            method: method.to_string(),
            handle,
            params,
            reply,
        })
        .await?
    }

    /// Close for good. Pending calls fail with `EngineError::Closed` and any
    /// scheduled reconnect is cancelled.
    pub async fn close(&self) {
        let _ = self.ask(|reply| Command::Close { reply }).await;
    }

    /// Calls still waiting for a response.
    pub async fn pending_requests(&self) -> usize {
        self.ask(|reply| Command::PendingCount { reply })
            .await
            .unwrap_or(0)
    }
}

struct Pending {
    method: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<Value, EngineError>>,
}

struct Actor {
    endpoint: Arc<str>,
    connector: Arc<dyn Connector>,
    credentials: Arc<dyn CredentialSupplier>,
    credential_type: String,
    config: TransportConfig,

    state: TransportState,
    generation: u64,
    next_id: u64,
    pending: HashMap<u64, Pending>,
    deadlines: BTreeSet<(Instant, u64)>,
    link: Option<Link>,

    attempt: Option<(u64, JoinHandle<()>)>,
    timer: Option<(u64, JoinHandle<()>)>,
    task_seq: u64,
    reconnect_attempt: u32,
    connect_waiters: Vec<oneshot::Sender<Result<u64, EngineError>>>,

    internal_tx: mpsc::UnboundedSender<Internal>,
    status_tx: watch::Sender<TransportStatus>,
    events: broadcast::Sender<TransportEvent>,
}

/// One connect attempt: credentials first, then the socket under a deadline.
async fn open_link(
    connector: &dyn Connector,
    credentials: &dyn CredentialSupplier,
    credential_type: &str,
    endpoint: &str,
    connect_timeout: Duration,
) -> Result<Link, EngineError> {
    let headers = credentials.auth_headers(credential_type).await?;
    timeout(connect_timeout, connector.connect(endpoint, &headers))
        .await
        .map_err(|_| {
            EngineError::Connection(format!(
                "Connect to {endpoint} timed out after {connect_timeout:?}"
            ))
        })?
}

async fn next_frame(link: &mut Option<Link>) -> Option<String> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        while self.state != TransportState::Closed {
            let next_deadline = self.deadlines.first().map(|(at, _)| *at);

            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        tracing::debug!(endpoint = %self.endpoint, "All transport handles dropped");
                        self.shutdown();
                    }
                },
                Some(message) = internal.recv() => self.on_internal(message),
                frame = next_frame(&mut self.link), if self.link.is_some() => match frame {
                    Some(text) => self.on_frame(&text),
                    None => self.on_drop(),
                },
                () = sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                    self.expire(Instant::now());
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => self.connect(reply),
            Command::Call {
                method,
                handle,
                params,
                reply,
            } => self.call(method, handle, params, reply),
            Command::Close { reply } => {
                self.shutdown();
                let _ = reply.send(());
            }
            Command::PendingCount { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::AttemptFinished { attempt_id, result } => {
                if self.attempt.as_ref().map(|(id, _)| *id) != Some(attempt_id) {
                    return; // superseded attempt, its link (if any) is dropped here
                }
                self.attempt = None;
                self.attempt_finished(result);
            }
            Internal::ReconnectDue { timer_id } => {
                if self.timer.as_ref().map(|(id, _)| *id) != Some(timer_id) {
                    return;
                }
                self.timer = None;
                if self.state == TransportState::Reconnecting && self.attempt.is_none() {
                    self.start_attempt();
                }
            }
        }
    }

    fn set_state(&mut self, state: TransportState) {
        self.state = state;
        self.status_tx.send_replace(TransportStatus {
            state,
            generation: self.generation,
        });
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event); // nobody listening is fine
    }

    fn connect(&mut self, reply: oneshot::Sender<Result<u64, EngineError>>) {
        match self.state {
            TransportState::Connected => {
                let _ = reply.send(Ok(self.generation));
            }
            TransportState::Connecting => self.connect_waiters.push(reply),
            TransportState::Reconnecting => {
                // An explicit connect skips the rest of the backoff delay
                self.connect_waiters.push(reply);
                if self.attempt.is_none() {
                    self.cancel_timer();
                    self.start_attempt();
                }
            }
            TransportState::Disconnected => {
                self.connect_waiters.push(reply);
                self.set_state(TransportState::Connecting);
                self.start_attempt();
            }
            TransportState::Closed => {
                let _ = reply.send(Err(EngineError::Closed));
            }
        }
    }

    fn start_attempt(&mut self) {
        self.task_seq += 1;
        let attempt_id = self.task_seq;
        let connector = Arc::clone(&self.connector);
        let credentials = Arc::clone(&self.credentials);
        let credential_type = self.credential_type.clone();
        let endpoint = Arc::clone(&self.endpoint);
        let connect_timeout = self.config.connect_timeout;
        let tx = self.internal_tx.clone();

        tracing::debug!(endpoint = %self.endpoint, attempt_id, "Connecting");

        let task = tokio::spawn(async move {
            let result = open_link(
                connector.as_ref(),
                credentials.as_ref(),
                &credential_type,
                &endpoint,
                connect_timeout,
            )
            .await;
            let _ = tx.send(Internal::AttemptFinished { attempt_id, result });
        });
        self.attempt = Some((attempt_id, task));
    }

    fn attempt_finished(&mut self, result: Result<Link, EngineError>) {
        match result {
            Ok(link) => {
                let reconnected = self.state == TransportState::Reconnecting;
                self.link = Some(link);
                self.generation += 1;
                self.reconnect_attempt = 0;
                self.set_state(TransportState::Connected);

                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Ok(self.generation));
                }

                if reconnected {
                    tracing::info!(endpoint = %self.endpoint, generation = self.generation, "Reconnected");
                    self.emit(TransportEvent::Reconnected {
                        generation: self.generation,
                    });
                } else {
                    tracing::info!(endpoint = %self.endpoint, generation = self.generation, "Connected");
                    self.emit(TransportEvent::Connected {
                        generation: self.generation,
                    });
                }
            }
            Err(error) => {
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(error.clone()));
                }
                if self.state == TransportState::Reconnecting {
                    tracing::warn!(
                        endpoint = %self.endpoint,
                        attempt = self.reconnect_attempt,
                        error = %error,
                        "Reconnect attempt failed"
                    );
                    self.schedule_reconnect(Some(error));
                } else {
                    tracing::warn!(endpoint = %self.endpoint, error = %error, "Connect failed");
                    self.set_state(TransportState::Disconnected);
                }
            }
        }
    }

    /// Schedule the next reconnect attempt, or give up once the budget is spent.
    fn schedule_reconnect(&mut self, last_error: Option<EngineError>) {
        if !self.config.auto_reconnect
            || self.reconnect_attempt >= self.config.max_reconnect_attempts
        {
            let error = last_error.unwrap_or(EngineError::ConnectionLost);
            let attempts = self.reconnect_attempt;
            tracing::error!(
                endpoint = %self.endpoint,
                attempts,
                error = %error,
                "Giving up on reconnection"
            );
            self.reconnect_attempt = 0;
            self.set_state(TransportState::Disconnected);
            self.emit(TransportEvent::ReconnectFailed { attempts, error });
            return;
        }

        self.reconnect_attempt += 1;
        let attempt = self.reconnect_attempt;
        let delay = self.config.reconnect_delay(attempt);
        tracing::info!(
            endpoint = %self.endpoint,
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Scheduling reconnect"
        );
        self.emit(TransportEvent::Reconnecting { attempt, delay });

        self.task_seq += 1;
        let timer_id = self.task_seq;
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            sleep(delay).await;
            let _ = tx.send(Internal::ReconnectDue { timer_id });
        });
        self.timer = Some((timer_id, task));
    }

    fn cancel_timer(&mut self) {
        if let Some((_, task)) = self.timer.take() {
            task.abort();
        }
    }

    fn call(
        &mut self,
        method: String,
        handle: i64,
        params: Value,
        reply: oneshot::Sender<Result<Value, EngineError>>,
    ) {
        let link = match (self.state, self.link.as_ref()) {
            (TransportState::Connected, Some(link)) => link,
            (TransportState::Reconnecting, _) => {
                let _ = reply.send(Err(EngineError::ConnectionLost));
                return;
            }
            (TransportState::Closed, _) => {
                let _ = reply.send(Err(EngineError::Closed));
                return;
            }
            (state, _) => {
                let _ = reply.send(Err(EngineError::Connection(format!(
                    "Transport is {state}"
                ))));
                return;
            }
        };

        let id = self.next_id;
        self.next_id += 1;

        let frame = match serde_json::to_string(&Request::new(id, method.as_str(), handle, params)) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = reply.send(Err(EngineError::Protocol(e.to_string())));
                return;
            }
        };

        if link.outbound.send(frame).is_err() {
            // Socket task is gone; the inbound side reports the drop shortly
            let _ = reply.send(Err(EngineError::ConnectionLost));
            return;
        }

        tracing::debug!(id, method = %method, handle, "Call sent");
        let deadline = Instant::now() + self.config.request_timeout;
        self.deadlines.insert((deadline, id));
        self.pending.insert(
            id,
            Pending {
                method,
                deadline,
                reply,
            },
        );
    }

    fn on_frame(&mut self, text: &str) {
        match Inbound::parse(text) {
            Ok(Inbound::Response(response)) => {
                let id = response.id;
                match self.pending.remove(&id) {
                    Some(pending) => {
                        self.deadlines.remove(&(pending.deadline, id));
                        tracing::debug!(id, method = %pending.method, "Response matched");
                        let _ = pending.reply.send(response.into_result());
                    }
                    None => {
                        tracing::warn!(id, "Response matches no pending call (late or unknown id)");
                    }
                }
            }
            Ok(Inbound::Notification(notification)) => {
                tracing::debug!(method = %notification.method, "Engine notification");
            }
            Err(e) => tracing::warn!(endpoint = %self.endpoint, "Unreadable frame: {e}"),
        }
    }

    /// Fail every call whose deadline has passed.
    fn expire(&mut self, now: Instant) {
        while let Some(&(deadline, id)) = self.deadlines.first() {
            if deadline > now {
                break;
            }
            self.deadlines.pop_first();
            if let Some(pending) = self.pending.remove(&id) {
                tracing::warn!(id, method = %pending.method, "Call timed out");
                let _ = pending.reply.send(Err(EngineError::Timeout {
                    method: pending.method,
                    after: self.config.request_timeout,
                }));
            }
        }
    }

    fn fail_pending(&mut self, error: &EngineError) {
        self.deadlines.clear();
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }

    /// The socket went away without `close()`.
    fn on_drop(&mut self) {
        self.link = None;
        let failed = self.pending.len();
        self.fail_pending(&EngineError::ConnectionLost);

        tracing::warn!(
            endpoint = %self.endpoint,
            generation = self.generation,
            failed,
            "Connection dropped"
        );
        self.emit(TransportEvent::Dropped {
            reason: "socket closed by peer".to_string(),
        });

        self.reconnect_attempt = 0;
        self.set_state(TransportState::Reconnecting);
        self.schedule_reconnect(None);
    }

    fn shutdown(&mut self) {
        if self.state == TransportState::Closed {
            return;
        }
        self.cancel_timer();
        if let Some((_, task)) = self.attempt.take() {
            task.abort();
        }
        self.link = None; // dropping the outbound side closes the socket
        self.fail_pending(&EngineError::Closed);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(EngineError::Closed));
        }
        self.set_state(TransportState::Closed);
        tracing::info!(endpoint = %self.endpoint, generation = self.generation, "Transport closed");
        self.emit(TransportEvent::Closed);
    }
}
