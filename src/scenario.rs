//! Concurrent broadcast scenario.
//!
//! A [`BroadcastScenario`] starts a number of clients and services against a
//! [`Relay`] and coordinates them with a [`PhaseBarrier`] through three
//! phases:
//!
//! 1. **startup**: clients connect and services register with the cluster.
//! 2. **broadcasting**: every participant broadcasts its messages to the
//!    cluster.
//! 3. **verification**: every service checks that it received each broadcast
//!    exactly once.
//!
//! The scenario fails with the first phase that collected errors, reporting
//! all errors of that phase.

use std::{thread::JoinHandle, time::Duration};

use ahash::HashSet;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, TrySendError};

use crate::{
    barrier::{CreateError, Participant, PhaseBarrier, PhaseFailed, SyncError, WaitTimeoutError},
    relay::{Handler, Relay, RelayError},
};

const PHASES: [&str; 3] = ["startup", "broadcasting", "verification"];

/// Indicates an error within the scenario configuration.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("At least one server is required")]
    NoServers,

    #[error("At least one message per participant is required")]
    NoMessages,

    #[error("Receive timeout must be greater than zero")]
    ReceiveTimeoutZero,

    #[error("Phase timeout must be greater than the receive timeout")]
    PhaseTimeoutTooShort,
}

/// Configuration of a [`BroadcastScenario`].
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// The number of clients that only broadcast.
    ///
    /// The default is 25.
    pub clients: usize,

    /// The number of services that broadcast and verify.
    ///
    /// The default is 25.
    pub servers: usize,

    /// The number of messages each participant broadcasts.
    ///
    /// The default is 25.
    pub messages: usize,

    /// The time a service waits for each single delivery.
    ///
    /// The default is 1 second.
    pub receive_timeout: Duration,

    /// The time the orchestrator waits for a phase to complete before giving
    /// up on stuck participants.
    ///
    /// The default is 30 seconds.
    pub phase_timeout: Duration,
}

impl BroadcastConfig {
    /// Validates the configuration.
    ///
    /// See [`ConfigError`] for details.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.servers == 0 {
            return Err(ConfigError::NoServers);
        }

        if self.messages == 0 {
            return Err(ConfigError::NoMessages);
        }

        if self.receive_timeout.is_zero() {
            return Err(ConfigError::ReceiveTimeoutZero);
        }

        if self.phase_timeout <= self.receive_timeout {
            return Err(ConfigError::PhaseTimeoutTooShort);
        }
        Ok(())
    }

    /// The number of deliveries each service expects.
    pub fn expected_deliveries(&self) -> usize {
        (self.clients + self.servers) * self.messages
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            clients: 25,
            servers: 25,
            messages: 25,
            receive_timeout: Duration::from_secs(1),
            phase_timeout: Duration::from_secs(30),
        }
    }
}

/// The reason a single participant failed.
#[derive(thiserror::Error, Debug)]
pub enum ParticipantError {
    #[error("connection failed: {0}")]
    Connect(#[source] RelayError),

    #[error("registration failed: {0}")]
    Register(#[source] RelayError),

    #[error("client broadcast failed: {0}")]
    ClientBroadcast(#[source] RelayError),

    #[error("server broadcast failed: {0}")]
    ServerBroadcast(#[source] RelayError),

    #[error("broadcast receive timeout")]
    ReceiveTimeout,

    #[error("broadcast not found: {0}")]
    NotFound(String),

    #[error("duplicate broadcast: {0}")]
    Duplicate(String),

    #[error("barrier misuse: {0}")]
    Sync(#[from] SyncError),
}

/// Indicates that the scenario did not complete successfully.
#[derive(thiserror::Error, Debug)]
pub enum ScenarioError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Barrier error: {0}")]
    Barrier(#[from] CreateError),

    #[error("{name} phase failed: {}", .failed.summary())]
    PhaseFailed {
        name: &'static str,
        #[source]
        failed: PhaseFailed<ParticipantError>,
    },

    /// Some participants neither synced nor exited in time. They are left
    /// running.
    #[error("{name} phase is stuck: {source}")]
    Stuck {
        name: &'static str,
        source: WaitTimeoutError,
    },
}

/// Formats the `index`-th broadcast of a client.
pub fn client_message(client: usize, index: usize) -> String {
    format!("client #{client}, broadcast {index}")
}

/// Formats the `index`-th broadcast of a server.
pub fn server_message(server: usize, index: usize) -> String {
    format!("server #{server}, broadcast {index}")
}

/// Forwards deliveries into a bounded queue that is drained by the service
/// participant.
struct QueueHandler {
    deliveries: Sender<Vec<u8>>,
}

impl Handler for QueueHandler {
    fn handle_broadcast(&mut self, message: Vec<u8>) {
        match self.deliveries.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::warn!("delivery queue full, dropping broadcast"),
            Err(TrySendError::Disconnected(_)) => {
                tracing::trace!("service stopped receiving")
            }
        }
    }
}

/// Runs clients and services through the startup, broadcasting and
/// verification phases.
pub struct BroadcastScenario {
    relay: Relay,
    cluster: String,
    config: BroadcastConfig,
}

impl BroadcastScenario {
    pub fn new(relay: Relay, cluster: impl Into<String>, config: BroadcastConfig) -> Self {
        Self {
            relay,
            cluster: cluster.into(),
            config,
        }
    }

    #[tracing::instrument(skip(self), fields(cluster = %self.cluster))]
    pub fn run(&self) -> Result<(), ScenarioError> {
        self.config.validate()?;

        let mut barrier = PhaseBarrier::new(self.config.clients + self.config.servers)?;
        let mut participants = barrier.participants().into_iter();
        let mut workers = Vec::with_capacity(barrier.total());

        for (client, participant) in (0..self.config.clients).zip(participants.by_ref()) {
            workers.push(self.spawn_client(client, participant));
        }
        for (server, participant) in (0..self.config.servers).zip(participants.by_ref()) {
            workers.push(self.spawn_server(server, participant));
        }
        debug_assert!(participants.next().is_none());
        debug_assert_eq!(workers.len(), barrier.total());

        let mut first_failure = None;
        for name in PHASES {
            match barrier.wait_timeout(self.config.phase_timeout) {
                Ok(errors) if errors.is_empty() => {
                    tracing::debug!(phase = name, "phase completed");
                }
                Ok(errors) => {
                    tracing::debug!(phase = name, errors = errors.len(), "phase failed");
                    if first_failure.is_none() {
                        let phase = barrier.phase() - 1;
                        first_failure = Some(ScenarioError::PhaseFailed {
                            name,
                            failed: PhaseFailed { phase, errors },
                        });
                    }
                }
                Err(source) => return Err(ScenarioError::Stuck { name, source }),
            }
        }

        join(workers);
        first_failure.map_or(Ok(()), Err)
    }

    fn spawn_client(
        &self,
        client: usize,
        participant: Participant<ParticipantError>,
    ) -> JoinHandle<()> {
        let relay = self.relay.clone();
        let cluster = self.cluster.clone();
        let messages = self.config.messages;

        std::thread::spawn(move || {
            let span = tracing::trace_span!("client", client);
            let _guard = span.enter();
            run_participant(participant, |participant| {
                let conn = relay.connect().map_err(ParticipantError::Connect)?;
                participant.sync_wait()?;

                for i in 0..messages {
                    conn.broadcast(&cluster, client_message(client, i).as_bytes())
                        .map_err(ParticipantError::ClientBroadcast)?;
                }
                // Keep the connection open until every participant is done.
                participant.sync_wait()?;
                conn.close();
                Ok(())
            })
        })
    }

    fn spawn_server(
        &self,
        server: usize,
        participant: Participant<ParticipantError>,
    ) -> JoinHandle<()> {
        let relay = self.relay.clone();
        let cluster = self.cluster.clone();
        let config = self.config.clone();

        std::thread::spawn(move || {
            let span = tracing::trace_span!("server", server);
            let _guard = span.enter();
            run_participant(participant, |participant| {
                let (deliveries, received) =
                    crossbeam::channel::bounded(config.expected_deliveries());
                let service = relay
                    .register(&cluster, QueueHandler { deliveries })
                    .map_err(ParticipantError::Register)?;
                participant.sync_wait()?;

                for i in 0..config.messages {
                    service
                        .connection()
                        .broadcast(&cluster, server_message(server, i).as_bytes())
                        .map_err(ParticipantError::ServerBroadcast)?;
                }
                participant.sync_wait()?;

                let result = verify(&received, &config);
                drop(received);
                service.unregister();
                result
            })
        })
    }
}

fn run_participant<F>(mut participant: Participant<ParticipantError>, work: F)
where
    F: FnOnce(&mut Participant<ParticipantError>) -> Result<(), ParticipantError>,
{
    let result = work(&mut participant);
    if let Err(err) = &result {
        tracing::debug!(%err, "participant failed");
    }
    participant.finish(result);
}

/// Collects every expected delivery and checks that each broadcast arrived
/// exactly once.
fn verify(received: &Receiver<Vec<u8>>, config: &BroadcastConfig) -> Result<(), ParticipantError> {
    let mut messages = HashSet::default();
    for _ in 0..config.expected_deliveries() {
        match received.recv_timeout(config.receive_timeout) {
            Ok(message) => {
                let message = String::from_utf8_lossy(&message).into_owned();
                if !messages.insert(message.clone()) {
                    return Err(ParticipantError::Duplicate(message));
                }
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                return Err(ParticipantError::ReceiveTimeout)
            }
        }
    }

    let expected = (0..config.clients)
        .flat_map(|i| (0..config.messages).map(move |j| client_message(i, j)))
        .chain(
            (0..config.servers)
                .flat_map(|i| (0..config.messages).map(move |j| server_message(i, j))),
        );
    for message in expected {
        if !messages.remove(&message) {
            return Err(ParticipantError::NotFound(message));
        }
    }
    Ok(())
}

fn join(workers: Vec<JoinHandle<()>>) {
    for worker in workers {
        if worker.join().is_err() {
            tracing::error!("participant panicked");
        }
    }
}
