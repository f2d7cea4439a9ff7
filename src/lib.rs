//! Modbus TCP Protocol Engine
//!
//! This library provides both sides of a Modbus TCP conversation: a register
//! server with a shared holding register bank, a client with transaction
//! correlation and timeout recovery, and a periodic poller that turns register
//! reads into a stream of timestamped samples.

pub mod cli;
pub mod config;
pub mod modbus;
pub mod output;
pub mod services;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use modbus::{Frame, ModbusTcpClient, RegisterBank};
pub use output::{ConsoleFormatter, CsvFormatter, EventFormatter, EventSink, JsonFormatter};
pub use services::{ModbusTcpServer, PollEvent, Poller, TelemetryFeeder};
pub use utils::error::{ExceptionCode, ModbusError, ModbusResult};

pub const VERSION: &str = "1.0.0";
