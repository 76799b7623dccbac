use std::{num::NonZeroUsize, time::Duration};

use rendezvous::{
    measure::{measure_latency, measure_throughput},
    relay::Relay,
};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let messages = 100_000;
    let timeout = Duration::from_secs(1);
    let relay = Relay::new();

    let latency = measure_latency(&relay, "latency", messages, timeout).unwrap();
    tracing::info!("latency: {latency}");

    for threads in [1, 2, 4, 8, 16, 32, 64, 128] {
        let threads = NonZeroUsize::new(threads).unwrap();
        let throughput =
            measure_throughput(&relay, "throughput", threads, messages, timeout).unwrap();
        tracing::info!("throughput with {threads} threads: {throughput}");
    }
}
