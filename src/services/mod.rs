pub mod poll_service;
pub mod tcp_server;
pub mod telemetry;

pub use poll_service::{PollEvent, PollSample, Poller};
pub use tcp_server::ModbusTcpServer;
pub use telemetry::TelemetryFeeder;
