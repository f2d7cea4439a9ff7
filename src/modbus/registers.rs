use tokio::sync::RwLock;

use crate::modbus::frame::MAX_READ_COUNT;
use crate::utils::error::{ExceptionCode, ModbusError, ModbusResult};

/// Full 16-bit addressed holding register space.
pub const BANK_CAPACITY: usize = 65536;

/// Thread-safe holding register store.
///
/// Many concurrent readers, serialized writers. A batch write becomes
/// visible to readers either fully-before or fully-after, never mixed.
pub struct RegisterBank {
    registers: RwLock<Vec<u16>>,
}

impl RegisterBank {
    pub fn new() -> Self {
        Self::with_capacity(BANK_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= BANK_CAPACITY,
            "register bank capacity must fit 16-bit addressing, got {}",
            capacity
        );
        Self {
            registers: RwLock::new(vec![0; capacity]),
        }
    }

    /// Read a contiguous run of registers.
    pub async fn read(&self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
        }

        let registers = self.registers.read().await;
        let end = start as usize + count as usize;
        if end > registers.len() {
            return Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress));
        }

        Ok(registers[start as usize..end].to_vec())
    }

    /// Write a contiguous run of registers as one atomic batch.
    pub async fn write(&self, start: u16, values: &[u16]) -> ModbusResult<()> {
        if values.is_empty() || values.len() > MAX_READ_COUNT as usize {
            return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
        }

        let mut registers = self.registers.write().await;
        let end = start as usize + values.len();
        if end > registers.len() {
            return Err(ModbusError::Exception(ExceptionCode::IllegalDataAddress));
        }

        registers[start as usize..end].copy_from_slice(values);
        Ok(())
    }

    pub async fn get(&self, address: u16) -> ModbusResult<u16> {
        Ok(self.read(address, 1).await?[0])
    }

    pub async fn set(&self, address: u16, value: u16) -> ModbusResult<()> {
        self.write(address, &[value]).await
    }

    pub async fn capacity(&self) -> usize {
        self.registers.read().await.len()
    }
}

impl Default for RegisterBank {
    fn default() -> Self {
        Self::new()
    }
}
