pub mod client;
pub mod frame;
pub mod registers;

pub use client::{ClientStats, ModbusClientTrait, ModbusTcpClient};
pub use frame::{decode_frame, encode_frame, Frame};
pub use registers::RegisterBank;
