use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::domain::{
    ConnectionEvent, ConnectionState, OutboundMessage, Transport, TransportError,
    TransportMessage, TransportSession,
};

use super::config::ConnectionConfig;
use super::reconnect_policy::{Backoff, CircuitBreaker};

/// Result of a `connect()` request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// A new attempt was started
    Started,
    /// Already connecting or connected
    AlreadyActive,
    /// Paused; reconnection waits for `resume()`
    Suppressed,
    /// Circuit open and the cooldown has not elapsed
    Rejected,
    Disposed,
}

/// Mutable state, guarded by a single mutex
struct ManagerState {
    state: ConnectionState,
    /// Failed attempts since the last confirmed connection
    attempt: u32,
    breaker: CircuitBreaker,
    /// Bumped on every attempt, pause and dispose; stale continuations compare
    /// against it before acting
    generation: u64,
    session_id: Option<Uuid>,
    /// Cancels the in-flight attempt or open session
    session: Option<CancellationToken>,
    /// Cancels the pending retry / cooldown timer
    timer: Option<CancellationToken>,
    disposed: bool,
}

/// Owns one persistent socket session.
///
/// Application layer - drives the transport through connect, confirmation,
/// heartbeat, backoff retries and circuit breaking. Failures never cross
/// this boundary: they surface as state transitions on the event stream and
/// the state watch.
pub struct ConnectionManager<T: Transport> {
    config: ConnectionConfig,
    transport: Arc<T>,
    backoff: Backoff,
    state: Mutex<ManagerState>,
    state_tx: watch::Sender<ConnectionState>,
    events_tx: broadcast::Sender<ConnectionEvent>,
    /// Parent of every session and timer token
    shutdown: CancellationToken,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(config: ConnectionConfig, transport: Arc<T>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Arc::new(ConnectionManager {
            backoff: Backoff::new(config.backoff_base, config.backoff_cap),
            state: Mutex::new(ManagerState {
                state: ConnectionState::Disconnected,
                attempt: 0,
                breaker: CircuitBreaker::new(
                    config.circuit_failure_threshold,
                    config.circuit_cooldown,
                ),
                generation: 0,
                session_id: None,
                session: None,
                timer: None,
                disposed: false,
            }),
            config,
            transport,
            state_tx,
            events_tx,
            shutdown: CancellationToken::new(),
        })
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    /// Persistent connectivity indicator
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Ordered stream of state transitions and raw frames
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    /// Failed attempts since the last confirmed connection
    pub fn attempt(&self) -> u32 {
        self.state.lock().attempt
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Start connecting unless a session is already underway
    pub fn connect(self: &Arc<Self>) -> ConnectOutcome {
        let mut st = self.state.lock();
        if st.disposed {
            return ConnectOutcome::Disposed;
        }

        match st.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                ConnectOutcome::AlreadyActive
            }
            ConnectionState::Paused => ConnectOutcome::Suppressed,
            ConnectionState::CircuitOpen => {
                if !st.breaker.try_acquire(Instant::now()) {
                    tracing::debug!("connect rejected, circuit open");
                    return ConnectOutcome::Rejected;
                }
                tracing::info!("Circuit half-open, trying {}", self.config.endpoint);
                self.start_attempt(&mut st);
                ConnectOutcome::Started
            }
            ConnectionState::Disconnected => {
                self.start_attempt(&mut st);
                ConnectOutcome::Started
            }
        }
    }

    /// Suppress reconnection while the network is reported unavailable
    pub fn pause(&self) {
        let mut st = self.state.lock();
        if st.disposed || st.state == ConnectionState::Paused {
            return;
        }

        tracing::info!("Network unavailable, pausing connection");
        Self::cancel_tasks(&mut st);
        st.generation += 1;
        self.transition(&mut st, ConnectionState::Paused);
    }

    /// Leave Paused, reset the backoff ladder and reconnect
    pub fn resume(self: &Arc<Self>) -> ConnectOutcome {
        let mut st = self.state.lock();
        if st.disposed {
            return ConnectOutcome::Disposed;
        }
        if st.state != ConnectionState::Paused {
            drop(st);
            return self.connect();
        }

        tracing::info!("Network available, resuming connection");
        st.attempt = 0;
        st.breaker.reset();
        self.start_attempt(&mut st);
        ConnectOutcome::Started
    }

    /// Close the session, cancel every timer and make the instance inert
    pub fn dispose(&self) {
        let mut st = self.state.lock();
        if st.disposed {
            return;
        }

        Self::cancel_tasks(&mut st);
        st.generation += 1;
        self.transition(&mut st, ConnectionState::Disconnected);
        st.disposed = true;
        self.shutdown.cancel();
        tracing::info!("Connection manager disposed");
    }

    fn cancel_tasks(st: &mut ManagerState) {
        if let Some(token) = st.session.take() {
            token.cancel();
        }
        if let Some(token) = st.timer.take() {
            token.cancel();
        }
        st.session_id = None;
    }

    fn transition(&self, st: &mut ManagerState, next: ConnectionState) {
        if st.state == next {
            return;
        }
        let previous = std::mem::replace(&mut st.state, next);

        tracing::info!(
            session = ?st.session_id,
            "Connection state {} -> {}",
            previous,
            next
        );

        self.state_tx.send_replace(next);
        // No subscribers is fine
        let _ = self.events_tx.send(ConnectionEvent::StateChanged {
            previous,
            current: next,
            at: Instant::now(),
        });
    }

    fn start_attempt(self: &Arc<Self>, st: &mut ManagerState) {
        Self::cancel_tasks(st);
        st.generation += 1;

        let generation = st.generation;
        let session_id = Uuid::new_v4();
        let token = self.shutdown.child_token();
        st.session_id = Some(session_id);
        st.session = Some(token.clone());
        self.transition(st, ConnectionState::Connecting);

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_session(generation, session_id, token).await;
        });
    }

    fn is_current(&self, generation: u64) -> bool {
        let st = self.state.lock();
        !st.disposed && st.generation == generation
    }

    async fn run_session(self: Arc<Self>, generation: u64, session_id: Uuid, token: CancellationToken) {
        tracing::debug!(session = %session_id, "Opening {}", self.config.endpoint);

        let opened = tokio::select! {
            _ = token.cancelled() => return,
            result = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.open(&self.config.endpoint),
            ) => result,
        };

        let session = match opened {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.handle_failure(generation, e);
                return;
            }
            Err(_) => {
                self.handle_failure(
                    generation,
                    TransportError::Timeout(format!(
                        "transport did not open within {:?}",
                        self.config.connect_timeout
                    )),
                );
                return;
            }
        };

        // Paused or disposed while the open was in flight
        if !self.is_current(generation) {
            session.close();
            return;
        }

        tracing::debug!(session = %session_id, "Transport open, awaiting confirmation");

        if let Some(error) = self.read_session(generation, &token, session).await {
            self.handle_failure(generation, error);
        }
    }

    /// Pump one open session until it fails or is cancelled.
    ///
    /// Returns the failure, or None when cancelled or superseded.
    async fn read_session(
        &self,
        generation: u64,
        token: &CancellationToken,
        session: TransportSession,
    ) -> Option<TransportError> {
        let TransportSession {
            mut inbound,
            outbound,
            shutdown,
        } = session;
        let _close_on_exit = shutdown.drop_guard();

        let heartbeat_every = self.config.heartbeat_interval;
        let silence_limit = heartbeat_every * 2;

        let confirm_deadline = tokio::time::sleep(self.config.confirm_timeout);
        tokio::pin!(confirm_deadline);

        let mut heartbeat =
            tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut confirmed = false;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = token.cancelled() => return None,

                _ = &mut confirm_deadline, if !confirmed => {
                    return Some(TransportError::Timeout(format!(
                        "no server message within {:?}",
                        self.config.confirm_timeout
                    )));
                }

                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() >= silence_limit {
                        return Some(TransportError::Timeout(format!(
                            "no inbound traffic for {:?}",
                            silence_limit
                        )));
                    }
                    if outbound.send(OutboundMessage::Ping).await.is_err() {
                        return Some(TransportError::Closed);
                    }
                }

                message = inbound.recv() => {
                    let Some(message) = message else {
                        return Some(TransportError::Closed);
                    };

                    match message {
                        TransportMessage::Text(text) => {
                            last_inbound = Instant::now();
                            if !confirmed {
                                if !self.confirm(generation) {
                                    return None;
                                }
                                confirmed = true;
                            }
                            if !self.emit_frame(generation, text) {
                                return None;
                            }
                        }
                        TransportMessage::Pong | TransportMessage::Ping => {
                            last_inbound = Instant::now();
                            if !confirmed {
                                if !self.confirm(generation) {
                                    return None;
                                }
                                confirmed = true;
                            }
                        }
                        TransportMessage::Closed(reason) => {
                            tracing::debug!("Peer closed session: {:?}", reason);
                            return Some(TransportError::Closed);
                        }
                        TransportMessage::Failed(e) => return Some(e),
                    }
                }
            }
        }
    }

    /// First server message on the session; returns false if superseded
    fn confirm(&self, generation: u64) -> bool {
        let mut st = self.state.lock();
        if st.disposed || st.generation != generation {
            return false;
        }

        st.attempt = 0;
        st.breaker.record_success();
        self.transition(&mut st, ConnectionState::Connected);
        true
    }

    fn emit_frame(&self, generation: u64, text: String) -> bool {
        let st = self.state.lock();
        if st.disposed || st.generation != generation {
            return false;
        }
        let _ = self.events_tx.send(ConnectionEvent::Frame(Arc::from(text)));
        true
    }

    fn handle_failure(self: &Arc<Self>, generation: u64, error: TransportError) {
        let mut st = self.state.lock();
        if st.disposed || st.generation != generation {
            return;
        }

        if let Some(token) = st.session.take() {
            token.cancel();
        }
        st.attempt = st.attempt.saturating_add(1);
        let now = Instant::now();

        if error.is_fatal() {
            tracing::error!(session = ?st.session_id, "Fatal connection error: {}", error);
            st.breaker.trip(now);
            self.open_circuit(&mut st);
            return;
        }

        if st.breaker.record_failure(now) {
            tracing::error!(
                session = ?st.session_id,
                "Connection failed {} times, opening circuit: {}",
                st.breaker.consecutive_failures(),
                error
            );
            self.open_circuit(&mut st);
            return;
        }

        let delay = self.backoff.delay(st.attempt);
        tracing::warn!(
            session = ?st.session_id,
            "Connection failed (attempt {}): {}, retrying in {:?}",
            st.attempt,
            error,
            delay
        );
        self.transition(&mut st, ConnectionState::Disconnected);
        self.schedule_timer(&mut st, delay);
    }

    fn open_circuit(self: &Arc<Self>, st: &mut ManagerState) {
        self.transition(st, ConnectionState::CircuitOpen);
        let cooldown = st
            .breaker
            .remaining_cooldown(Instant::now())
            .unwrap_or(self.config.circuit_cooldown);
        self.schedule_timer(st, cooldown);
    }

    fn schedule_timer(self: &Arc<Self>, st: &mut ManagerState, delay: Duration) {
        if let Some(previous) = st.timer.take() {
            previous.cancel();
        }
        let token = self.shutdown.child_token();
        st.timer = Some(token.clone());

        let generation = st.generation;
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => manager.on_timer(generation),
            }
        });
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let mut st = self.state.lock();
        if st.disposed || st.generation != generation {
            return;
        }
        st.timer = None;

        match st.state {
            ConnectionState::Disconnected => self.start_attempt(&mut st),
            ConnectionState::CircuitOpen => {
                if st.breaker.try_acquire(Instant::now()) {
                    tracing::info!("Cooldown elapsed, half-open retry");
                    self.start_attempt(&mut st);
                }
            }
            _ => {}
        }
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
