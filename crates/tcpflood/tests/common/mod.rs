#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tcpflood::{EpochCounter, Listener, ListenerEvent};
use tcpflood_common::{ListenerConfig, SenderConfig};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct RunningListener {
    pub addr: SocketAddr,
    pub counter: Arc<EpochCounter>,
    pub events: broadcast::Receiver<ListenerEvent>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<()>,
}

impl RunningListener {
    pub async fn stop(self) {
        self.cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("listener stops after cancel")
            .unwrap();
    }

    /// Sleeps until just after the next epoch boundary so a short batch of
    /// connections lands in a single epoch.
    pub async fn align_to_epoch(&self) {
        let clock = self.counter.clock();
        let next = clock.boundary(clock.now().next());
        tokio::time::sleep_until(next + Duration::from_millis(20)).await;
    }
}

pub fn listener_config() -> ListenerConfig {
    ListenerConfig {
        addr: "127.0.0.1:0".to_string(),
        grace_period_ms: 200,
        idle_timeout_ms: 5_000,
        ..ListenerConfig::default()
    }
}

pub fn sender_config() -> SenderConfig {
    SenderConfig {
        connect_timeout_ms: 1_000,
        reply_timeout_ms: 500,
        slice_ms: 100,
        max_in_flight: 256,
        ..SenderConfig::default()
    }
}

pub async fn start_listener(config: ListenerConfig) -> RunningListener {
    let listener = Listener::bind(config).await.expect("bind loopback");
    let addr = listener.local_addr().unwrap();
    let counter = listener.counter();
    let events = listener.subscribe();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(listener.run(cancel.clone()));
    RunningListener {
        addr,
        counter,
        events,
        cancel,
        handle,
    }
}
