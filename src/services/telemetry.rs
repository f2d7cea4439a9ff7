use chrono::{DateTime, Datelike, Timelike, Utc};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};

use crate::config::settings::TelemetrySettings;
use crate::modbus::registers::RegisterBank;

/// Writing this value to the command register restarts the uptime counter.
pub const UPTIME_RESET_COMMAND: u16 = 999;

/// Background task that keeps a block of server registers populated with
/// live values: UTC wall clock, a heartbeat toggle and an uptime counter.
///
/// Block layout, relative to the configured base address:
///   +0..=5  year, month, day, hour, minute, second (UTC)
///   +6      heartbeat, alternating 0/1 every tick
///   +7      uptime seconds, low word
///   +8      uptime seconds, high word
pub struct TelemetryFeeder {
    stop_tx: watch::Sender<bool>,
}

fn telemetry_block(now: DateTime<Utc>, heartbeat: bool, uptime_secs: u64) -> [u16; 9] {
    [
        now.year() as u16,
        now.month() as u16,
        now.day() as u16,
        now.hour() as u16,
        now.minute() as u16,
        now.second() as u16,
        heartbeat as u16,
        (uptime_secs & 0xFFFF) as u16,
        (uptime_secs >> 16) as u16,
    ]
}

impl TelemetryFeeder {
    pub fn start(bank: Arc<RegisterBank>, settings: &TelemetrySettings) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let base = settings.base_address;
        let command = settings.command_address;
        let period = Duration::from_millis(settings.update_interval_ms);

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut heartbeat = false;
            let mut epoch = Instant::now();

            info!(
                "📡 Telemetry feeder started: registers {}..={}, command at {}",
                base,
                base + 8,
                command
            );

            loop {
                ticker.tick().await;
                if *stop_rx.borrow() {
                    break;
                }

                match bank.get(command).await {
                    Ok(UPTIME_RESET_COMMAND) => {
                        info!("🔄 Uptime counter reset by command register");
                        epoch = Instant::now();
                        if let Err(e) = bank.set(command, 0).await {
                            warn!("⚠️ Failed to acknowledge reset command: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("⚠️ Command register {} unreadable: {}", command, e);
                    }
                }

                heartbeat = !heartbeat;
                let block = telemetry_block(Utc::now(), heartbeat, epoch.elapsed().as_secs());
                if let Err(e) = bank.write(base, &block).await {
                    warn!("⚠️ Telemetry write failed: {}", e);
                }
            }

            info!("🛑 Telemetry feeder stopped");
        });

        Self { stop_tx }
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}
