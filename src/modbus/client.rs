use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration, Instant};

use crate::modbus::frame::{
    decode_frame, encode_frame, format_packet, Frame, EXCEPTION_FLAG, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_READ_COUNT, MAX_WRITE_COUNT,
};
use crate::utils::error::{ExceptionCode, ModbusError, ModbusResult};

/// Client-side register operations, kept behind a trait so services can run
/// against scripted implementations in tests.
#[async_trait]
pub trait ModbusClientTrait: Send {
    async fn read_holding_registers(&mut self, start: u16, count: u16) -> ModbusResult<Vec<u16>>;
    async fn write_single_register(&mut self, address: u16, value: u16) -> ModbusResult<()>;
    async fn write_multiple_registers(&mut self, start: u16, values: &[u16]) -> ModbusResult<()>;
    async fn close(&mut self);
}

/// Running transport counters for one client.
#[derive(Debug, Clone, Default)]
pub struct ClientStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub timeouts: u64,
    pub exceptions: u64,
    pub stale_discarded: u64,
}

/// Modbus TCP client with one in-flight request at a time.
///
/// Request/response correlation uses a wrapping transaction id counter;
/// id 0 is never issued. A timed-out or failed exchange poisons the stream,
/// and the next request opens a fresh connection instead of reading leftover
/// bytes from the old one.
pub struct ModbusTcpClient {
    address: String,
    unit_id: u8,
    timeout: Duration,
    stream: Option<TcpStream>,
    buffer: BytesMut,
    transaction_id: u16,
    closed: bool,
    stats: ClientStats,
}

fn bump_transaction_id(id: u16) -> u16 {
    // Wraps from 0xFFFF back to 1, skipping 0
    let next = id.wrapping_add(1);
    if next == 0 {
        1
    } else {
        next
    }
}

impl ModbusTcpClient {
    /// Open a TCP connection to a Modbus server. The same deadline applies
    /// to the connect itself and to each later request.
    pub async fn connect(host: &str, port: u16, timeout_ms: u64) -> ModbusResult<Self> {
        let address = format!("{}:{}", host, port);
        let deadline = Duration::from_millis(timeout_ms);
        info!("🔌 Connecting to Modbus server at {}", address);

        let stream = match timeout(deadline, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::ConnectionError(format!(
                    "connect to {} failed: {}",
                    address, e
                )));
            }
            Err(_) => {
                return Err(ModbusError::ConnectionError(format!(
                    "connect to {} timed out after {}ms",
                    address, timeout_ms
                )));
            }
        };

        info!("✅ Connected to {}", address);
        Ok(Self {
            address,
            unit_id: 1,
            timeout: deadline,
            stream: Some(stream),
            buffer: BytesMut::with_capacity(512),
            transaction_id: 0,
            closed: false,
            stats: ClientStats::default(),
        })
    }

    pub fn with_unit_id(mut self, unit_id: u8) -> Self {
        self.unit_id = unit_id;
        self
    }

    /// Override the per-request deadline independently of the connect one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    pub async fn read_holding_registers(&mut self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        if count == 0 || count > MAX_READ_COUNT {
            return Err(ModbusError::InvalidData(format!(
                "register count {} outside 1..={}",
                count, MAX_READ_COUNT
            )));
        }

        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());

        let response = self.request(FC_READ_HOLDING_REGISTERS, payload).await?;

        let data_len = 2 * count as usize;
        if response.payload.len() != data_len + 1 || response.payload[0] as usize != data_len {
            return Err(ModbusError::FramingError(format!(
                "malformed read response for {} registers ({} payload bytes)",
                count,
                response.payload.len()
            )));
        }

        Ok(response.payload[1..]
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub async fn write_single_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&address.to_be_bytes());
        payload.extend_from_slice(&value.to_be_bytes());

        let response = self.request(FC_WRITE_SINGLE_REGISTER, payload.clone()).await?;

        // The server echoes address and value on success
        if response.payload != payload {
            return Err(ModbusError::FramingError(
                "write echo does not match the request".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn write_multiple_registers(&mut self, start: u16, values: &[u16]) -> ModbusResult<()> {
        let count = values.len() as u16;
        if values.is_empty() || count > MAX_WRITE_COUNT {
            return Err(ModbusError::InvalidData(format!(
                "register count {} outside 1..={}",
                values.len(),
                MAX_WRITE_COUNT
            )));
        }

        let mut payload = Vec::with_capacity(5 + 2 * values.len());
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.push((2 * count) as u8);
        for value in values {
            payload.extend_from_slice(&value.to_be_bytes());
        }

        let response = self.request(FC_WRITE_MULTIPLE_REGISTERS, payload).await?;

        if response.payload.len() != 4 || response.payload[..2] != start.to_be_bytes() {
            return Err(ModbusError::FramingError(
                "write acknowledgement does not match the request".to_string(),
            ));
        }
        Ok(())
    }

    /// Close the connection. Further requests fail with a shutdown error.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        info!(
            "🔌 Connection to {} closed ({} requests, {} timeouts, {} stale)",
            self.address, self.stats.requests_sent, self.stats.timeouts, self.stats.stale_discarded
        );
    }

    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = bump_transaction_id(self.transaction_id);
        self.transaction_id
    }

    async fn reconnect(&mut self) -> ModbusResult<()> {
        info!("🔁 Reconnecting to {}", self.address);
        let stream = match timeout(self.timeout, TcpStream::connect(&self.address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(ModbusError::ConnectionError(format!(
                    "reconnect to {} failed: {}",
                    self.address, e
                )));
            }
            Err(_) => {
                return Err(ModbusError::ConnectionError(format!(
                    "reconnect to {} timed out",
                    self.address
                )));
            }
        };
        self.buffer.clear();
        self.stream = Some(stream);
        Ok(())
    }

    /// Send one request frame and wait for its response.
    ///
    /// The stream is held out of `self` while the exchange is in flight and
    /// only put back after a clean response, so timeouts and I/O failures
    /// leave the client disconnected rather than desynchronized.
    async fn request(&mut self, function_code: u8, payload: Vec<u8>) -> ModbusResult<Frame> {
        if self.closed {
            return Err(ModbusError::Shutdown(
                "client connection has been closed".to_string(),
            ));
        }
        if self.stream.is_none() {
            self.reconnect().await?;
        }
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => return Err(ModbusError::ConnectionError("not connected".to_string())),
        };

        let transaction_id = self.next_transaction_id();
        let request = Frame::new(transaction_id, self.unit_id, function_code, payload);
        let bytes = encode_frame(&request);
        debug!("📤 [{}] {}", transaction_id, format_packet(&bytes));

        match timeout(self.timeout, stream.write_all(&bytes)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(ModbusError::ConnectionError(format!("send failed: {}", e)));
            }
            Err(_) => {
                self.stats.timeouts += 1;
                return Err(ModbusError::Timeout);
            }
        }
        self.stats.requests_sent += 1;

        let deadline = Instant::now() + self.timeout;
        loop {
            while let Some(response) = decode_frame(&mut self.buffer)? {
                if response.transaction_id != transaction_id {
                    self.stats.stale_discarded += 1;
                    warn!(
                        "🗑️ Discarding stale response {} while waiting for {}",
                        response.transaction_id, transaction_id
                    );
                    continue;
                }

                self.stats.responses_received += 1;
                debug!(
                    "📥 [{}] function 0x{:02X}, {} payload bytes",
                    transaction_id,
                    response.function_code,
                    response.payload.len()
                );

                if response.function_code == (function_code | EXCEPTION_FLAG) {
                    let code = response
                        .exception_code()
                        .unwrap_or(ExceptionCode::SlaveDeviceFailure);
                    self.stats.exceptions += 1;
                    warn!("⚠️ [{}] server replied {}", transaction_id, code);
                    // The exchange completed, the connection is still good
                    self.stream = Some(stream);
                    return Err(ModbusError::Exception(code));
                }
                if response.function_code != function_code {
                    return Err(ModbusError::FramingError(format!(
                        "response function 0x{:02X} does not match request 0x{:02X}",
                        response.function_code, function_code
                    )));
                }

                self.stream = Some(stream);
                return Ok(response);
            }

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => {
                    self.stats.timeouts += 1;
                    return Err(ModbusError::Timeout);
                }
            };

            match timeout(remaining, stream.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => {
                    return Err(ModbusError::ConnectionError(
                        "server closed the connection".to_string(),
                    ));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    return Err(ModbusError::ConnectionError(format!("receive failed: {}", e)));
                }
                Err(_) => {
                    self.stats.timeouts += 1;
                    return Err(ModbusError::Timeout);
                }
            }
        }
    }
}

#[async_trait]
impl ModbusClientTrait for ModbusTcpClient {
    async fn read_holding_registers(&mut self, start: u16, count: u16) -> ModbusResult<Vec<u16>> {
        ModbusTcpClient::read_holding_registers(self, start, count).await
    }

    async fn write_single_register(&mut self, address: u16, value: u16) -> ModbusResult<()> {
        ModbusTcpClient::write_single_register(self, address, value).await
    }

    async fn write_multiple_registers(&mut self, start: u16, values: &[u16]) -> ModbusResult<()> {
        ModbusTcpClient::write_multiple_registers(self, start, values).await
    }

    async fn close(&mut self) {
        ModbusTcpClient::close(self).await
    }
}
