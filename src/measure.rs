//! Broadcast latency and throughput measurements.

use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use crossbeam::channel::Receiver;

use crate::{
    pool::{PoolError, ThreadPool},
    relay::{Relay, RelayError, Service},
};

#[derive(thiserror::Error, Debug)]
pub enum MeasureError {
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Broadcast receive timeout after {received} messages")]
    ReceiveTimeout { received: usize },
}

/// The outcome of a measurement.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub messages: usize,
    pub elapsed: Duration,
}

impl Measurement {
    pub fn per_message(&self) -> Duration {
        match u32::try_from(self.messages) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(messages) => self.elapsed / messages,
        }
    }

    pub fn messages_per_second(&self) -> f64 {
        if self.messages == 0 || self.elapsed.is_zero() {
            return 0.0;
        }
        self.messages as f64 / self.elapsed.as_secs_f64()
    }
}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} messages in {:?} ({:?}/msg, {:.0} msg/s)",
            self.messages,
            self.elapsed,
            self.per_message(),
            self.messages_per_second()
        )
    }
}

fn collecting_service(
    relay: &Relay,
    cluster: &str,
    capacity: usize,
) -> Result<(Service, Receiver<Vec<u8>>), RelayError> {
    let (sender, receiver) = crossbeam::channel::bounded(capacity);
    let service = relay.register(cluster, move |message: Vec<u8>| {
        if sender.try_send(message).is_err() {
            tracing::warn!("delivery queue full, dropping broadcast");
        }
    })?;
    Ok((service, receiver))
}

/// Broadcasts `messages` single byte messages one after the other, waiting
/// for each to be delivered before sending the next.
#[tracing::instrument(skip(relay))]
pub fn measure_latency(
    relay: &Relay,
    cluster: &str,
    messages: usize,
    timeout: Duration,
) -> Result<Measurement, MeasureError> {
    let (service, delivered) = collecting_service(relay, cluster, messages.max(1))?;

    let start = Instant::now();
    for i in 0..messages {
        service.connection().broadcast(cluster, &[i as u8])?;
        if delivered.recv_timeout(timeout).is_err() {
            return Err(MeasureError::ReceiveTimeout { received: i });
        }
    }
    let elapsed = start.elapsed();
    service.unregister();

    Ok(Measurement { messages, elapsed })
}

/// Broadcasts `messages` single byte messages from a pool of `threads`
/// workers and measures how long it takes until all of them are delivered.
#[tracing::instrument(skip(relay))]
pub fn measure_throughput(
    relay: &Relay,
    cluster: &str,
    threads: NonZeroUsize,
    messages: usize,
    timeout: Duration,
) -> Result<Measurement, MeasureError> {
    let (service, delivered) = collecting_service(relay, cluster, messages.max(1))?;
    let (failures, failed) = crossbeam::channel::unbounded();

    let mut pool = ThreadPool::new(threads);
    for i in 0..messages {
        let conn = service.connection().clone();
        let cluster = cluster.to_string();
        let failures = failures.clone();
        pool.schedule(move || {
            if let Err(err) = conn.broadcast(&cluster, &[i as u8]) {
                let _ = failures.send(err);
            }
        })?;
    }
    drop(failures);

    let start = Instant::now();
    pool.start()?;
    let mut received = 0;
    while received < messages {
        if delivered.recv_timeout(timeout).is_err() {
            pool.terminate(false);
            return Err(match failed.try_recv() {
                Ok(err) => err.into(),
                Err(_) => MeasureError::ReceiveTimeout { received },
            });
        }
        received += 1;
    }
    let elapsed = start.elapsed();
    pool.terminate(true);
    service.unregister();

    if let Ok(err) = failed.try_recv() {
        return Err(err.into());
    }
    Ok(Measurement { messages, elapsed })
}
