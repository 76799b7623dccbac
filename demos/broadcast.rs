use std::time::Duration;

use rendezvous::{
    relay::Relay,
    scenario::{BroadcastConfig, BroadcastScenario},
};

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let args = std::env::args().collect::<Vec<_>>();
    let participants = args
        .get(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(25);

    let config = BroadcastConfig {
        clients: participants,
        servers: participants,
        messages: 25,
        receive_timeout: Duration::from_secs(1),
        ..Default::default()
    };

    let relay = Relay::new();
    match BroadcastScenario::new(relay, "broadcast-demo", config).run() {
        Ok(()) => tracing::info!("all broadcasts verified"),
        Err(err) => {
            tracing::error!(%err, "scenario failed");
            std::process::exit(1);
        }
    }
}
