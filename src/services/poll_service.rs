use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::config::settings::PollerSettings;
use crate::modbus::client::ModbusClientTrait;

/// One successfully sampled register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSample {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub address: u16,
    pub value: u16,
}

/// What one poll tick produced.
#[derive(Debug, Clone)]
pub enum PollEvent {
    Samples(Vec<PollSample>),
    Failed(String),
}

/// Periodic reader of a register range over one client connection.
///
/// At most one request is in flight; ticks that fire while a read is still
/// pending are skipped, not queued. A failed tick emits `PollEvent::Failed`
/// and the loop carries on.
pub struct Poller {
    stop_tx: watch::Sender<bool>,
    gate: Arc<Mutex<()>>,
}

impl Poller {
    /// Spawn the poll loop over `client`. Returns the poller handle and the
    /// event stream; the client is closed when the loop exits.
    pub fn start<C>(mut client: C, settings: &PollerSettings) -> (Self, mpsc::Receiver<PollEvent>)
    where
        C: ModbusClientTrait + 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(32);
        let (stop_tx, stop_rx) = watch::channel(false);
        let gate = Arc::new(Mutex::new(()));

        let start_address = settings.start_address;
        let count = settings.count;
        let period = Duration::from_millis(settings.poll_interval_ms);
        let loop_gate = Arc::clone(&gate);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            info!(
                "📊 Polling {} registers from {} every {}ms",
                count,
                start_address,
                period.as_millis()
            );

            loop {
                ticker.tick().await;
                if *stop_rx.borrow() {
                    break;
                }

                let result = client.read_holding_registers(start_address, count).await;

                let event = match result {
                    Ok(values) => {
                        let timestamp = chrono::Utc::now();
                        let samples = values
                            .iter()
                            .enumerate()
                            .map(|(i, &value)| PollSample {
                                timestamp,
                                address: start_address + i as u16,
                                value,
                            })
                            .collect();
                        PollEvent::Samples(samples)
                    }
                    Err(e) => {
                        warn!("⚠️ Poll tick failed: {}", e);
                        PollEvent::Failed(e.to_string())
                    }
                };

                // Delivery happens under the gate; stop() takes the same
                // gate, so once it returns nothing more reaches the consumer
                let guard = loop_gate.lock().await;
                if *stop_rx.borrow() {
                    break;
                }
                match event_tx.try_send(event) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("⚠️ Event channel full, dropping poll result");
                    }
                    Err(TrySendError::Closed(_)) => {
                        debug!("Event consumer gone, stopping poller");
                        break;
                    }
                }
                drop(guard);
            }

            client.close().await;
            info!("🛑 Poller stopped");
        });

        (Self { stop_tx, gate }, event_rx)
    }

    /// Stop polling. Does not wait for an in-flight read to finish, but
    /// once this returns no further events are delivered.
    pub async fn stop(&self) {
        let _guard = self.gate.lock().await;
        let _ = self.stop_tx.send(true);
    }
}
