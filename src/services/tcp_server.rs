use bytes::BytesMut;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::time::{timeout, Duration};

use crate::config::settings::ServerSettings;
use crate::modbus::frame::{
    decode_frame, encode_frame, format_packet, Frame, FC_READ_HOLDING_REGISTERS,
    FC_WRITE_MULTIPLE_REGISTERS, FC_WRITE_SINGLE_REGISTER, MAX_WRITE_COUNT,
};
use crate::modbus::registers::RegisterBank;
use crate::utils::error::{ExceptionCode, ModbusError, ModbusResult};

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub address: String,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub requests_handled: u64,
    pub exceptions_sent: u64,
}

/// Modbus TCP server: one accept loop, one task per client connection.
///
/// All connections share the same register bank. A client that stalls
/// mid-frame only parks its own task; a client that sends bytes the codec
/// rejects gets its connection closed without disturbing the others.
#[derive(Clone)]
pub struct ModbusTcpServer {
    bank: Arc<RegisterBank>,
    clients: Arc<RwLock<HashMap<String, ClientInfo>>>,
    is_running: Arc<RwLock<bool>>,
    shutdown_tx: broadcast::Sender<()>,
    host: String,
    port: u16,
    max_connections: usize,
    idle_timeout: Duration,
}

impl ModbusTcpServer {
    pub fn new(settings: &ServerSettings) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            bank: Arc::new(RegisterBank::new()),
            clients: Arc::new(RwLock::new(HashMap::new())),
            is_running: Arc::new(RwLock::new(false)),
            shutdown_tx,
            host: settings.host.clone(),
            port: settings.port,
            max_connections: settings.max_connections,
            idle_timeout: Duration::from_secs(settings.idle_timeout_secs),
        }
    }

    /// Shared handle to the register bank backing this server.
    pub fn bank(&self) -> Arc<RegisterBank> {
        Arc::clone(&self.bank)
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn get_client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn get_client_stats(&self) -> HashMap<String, ClientInfo> {
        self.clients.read().await.clone()
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address, which matters when the configured port is 0.
    pub async fn start(&self) -> ModbusResult<SocketAddr> {
        let bind_address = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&bind_address).await.map_err(|e| {
            ModbusError::ConnectionError(format!("failed to bind {}: {}", bind_address, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!("🚀 Modbus TCP server listening on {}", local_addr);
        *self.is_running.write().await = true;

        let server = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, addr)) => server.accept_client(stream, addr).await,
                            Err(e) => error!("Failed to accept connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Accept loop stopped");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Stop accepting new connections and close the existing ones. A request
    /// already being dispatched still gets its response before the
    /// connection task exits.
    pub async fn stop(&self) -> ModbusResult<()> {
        info!("🛑 Stopping Modbus TCP server...");
        *self.is_running.write().await = false;
        let _ = self.shutdown_tx.send(());
        self.clients.write().await.clear();
        info!("✅ Modbus TCP server stopped");
        Ok(())
    }

    async fn accept_client(&self, stream: TcpStream, addr: SocketAddr) {
        let active = self.get_client_count().await;
        if active >= self.max_connections {
            warn!(
                "🚫 Rejecting connection from {}, {} clients already connected",
                addr, active
            );
            drop(stream);
            return;
        }

        info!("🔗 Client connected: {}", addr);
        self.clients.write().await.insert(
            addr.to_string(),
            ClientInfo {
                address: addr.to_string(),
                connected_at: chrono::Utc::now(),
                requests_handled: 0,
                exceptions_sent: 0,
            },
        );

        let server = self.clone();
        tokio::spawn(async move {
            server.handle_connection(stream, addr).await;
            server.clients.write().await.remove(&addr.to_string());
        });
    }

    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) {
        let mut buffer = BytesMut::with_capacity(512);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            // Serve every complete frame already buffered before reading more
            loop {
                let request = match decode_frame(&mut buffer) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("❌ Dropping {}: {}", addr, e);
                        return;
                    }
                };

                let response = self.dispatch(request).await;
                let bytes = encode_frame(&response);
                debug!("📤 {} {}", addr, format_packet(&bytes));
                if let Err(e) = stream.write_all(&bytes).await {
                    debug!("Send to {} failed: {}", addr, e);
                    return;
                }
                self.record_request(&addr, response.is_exception()).await;
            }

            tokio::select! {
                result = timeout(self.idle_timeout, stream.read_buf(&mut buffer)) => {
                    match result {
                        Ok(Ok(0)) => {
                            info!("🔌 Client disconnected: {}", addr);
                            return;
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            warn!("Read from {} failed: {}", addr, e);
                            return;
                        }
                        Err(_) => {
                            info!("⏱️ Closing idle connection from {}", addr);
                            return;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Closing {} for shutdown", addr);
                    return;
                }
            }
        }
    }

    /// Route one request frame to its handler and build the response frame.
    /// Transaction id and unit id are echoed back unchanged.
    async fn dispatch(&self, request: Frame) -> Frame {
        let result = match request.function_code {
            FC_READ_HOLDING_REGISTERS => self.handle_read(&request).await,
            FC_WRITE_SINGLE_REGISTER => self.handle_write_single(&request).await,
            FC_WRITE_MULTIPLE_REGISTERS => self.handle_write_multiple(&request).await,
            other => {
                warn!(
                    "❓ Unsupported function 0x{:02X} in transaction {}",
                    other, request.transaction_id
                );
                Err(ModbusError::Exception(ExceptionCode::IllegalFunction))
            }
        };

        match result {
            Ok(payload) => Frame::new(
                request.transaction_id,
                request.unit_id,
                request.function_code,
                payload,
            ),
            Err(ModbusError::Exception(code)) => {
                debug!(
                    "⚠️ Transaction {} rejected with {}",
                    request.transaction_id, code
                );
                Frame::exception(request.transaction_id, request.unit_id, request.function_code, code)
            }
            Err(e) => {
                error!("Handler failed for transaction {}: {}", request.transaction_id, e);
                Frame::exception(
                    request.transaction_id,
                    request.unit_id,
                    request.function_code,
                    ExceptionCode::SlaveDeviceFailure,
                )
            }
        }
    }

    async fn handle_read(&self, request: &Frame) -> ModbusResult<Vec<u8>> {
        let (start, count) = parse_two_words(&request.payload)?;
        let values = self.bank.read(start, count).await?;

        let mut payload = Vec::with_capacity(1 + 2 * values.len());
        payload.push((2 * values.len()) as u8);
        for value in &values {
            payload.extend_from_slice(&value.to_be_bytes());
        }
        Ok(payload)
    }

    async fn handle_write_single(&self, request: &Frame) -> ModbusResult<Vec<u8>> {
        let (address, value) = parse_two_words(&request.payload)?;
        self.bank.write(address, &[value]).await?;
        // Echo address and value on success
        Ok(request.payload.clone())
    }

    async fn handle_write_multiple(&self, request: &Frame) -> ModbusResult<Vec<u8>> {
        let (start, values) = parse_write_values(&request.payload)?;
        self.bank.write(start, &values).await?;
        // Echo starting address and register count
        Ok(request.payload[..4].to_vec())
    }

    async fn record_request(&self, addr: &SocketAddr, exception: bool) {
        let mut clients = self.clients.write().await;
        if let Some(info) = clients.get_mut(&addr.to_string()) {
            info.requests_handled += 1;
            if exception {
                info.exceptions_sent += 1;
            }
        }
    }
}

fn parse_two_words(payload: &[u8]) -> ModbusResult<(u16, u16)> {
    if payload.len() != 4 {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }
    Ok((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
    ))
}

fn parse_write_values(payload: &[u8]) -> ModbusResult<(u16, Vec<u16>)> {
    if payload.len() < 5 {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }
    let start = u16::from_be_bytes([payload[0], payload[1]]);
    let count = u16::from_be_bytes([payload[2], payload[3]]);
    let byte_count = payload[4] as usize;
    let data = &payload[5..];

    if count == 0 || count > MAX_WRITE_COUNT {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }
    if byte_count != 2 * count as usize || data.len() != byte_count {
        return Err(ModbusError::Exception(ExceptionCode::IllegalDataValue));
    }

    let values = data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok((start, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::client::ModbusTcpClient;
    use crate::modbus::frame::EXCEPTION_FLAG;
    use tokio::time::Instant;

    fn test_settings() -> ServerSettings {
        ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            max_connections: 8,
            idle_timeout_secs: 60,
        }
    }

    async fn started_server(settings: ServerSettings) -> (ModbusTcpServer, SocketAddr) {
        let server = ModbusTcpServer::new(&settings);
        let addr = server.start().await.unwrap();
        (server, addr)
    }

    async fn raw_exchange(stream: &mut TcpStream, request: &Frame) -> Frame {
        stream.write_all(&encode_frame(request)).await.unwrap();
        read_one_frame(stream, &mut BytesMut::new()).await
    }

    // The buffer lives with the caller so bytes read past the first frame
    // survive for the next call on the same stream.
    async fn read_one_frame(stream: &mut TcpStream, buf: &mut BytesMut) -> Frame {
        loop {
            if let Some(frame) = decode_frame(buf).unwrap() {
                return frame;
            }
            let n = stream.read_buf(buf).await.unwrap();
            assert!(n > 0, "server closed while a frame was pending");
        }
    }

    fn read_request(transaction_id: u16, start: u16, count: u16) -> Frame {
        let mut payload = Vec::new();
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        Frame::new(transaction_id, 1, FC_READ_HOLDING_REGISTERS, payload)
    }

    #[tokio::test]
    async fn test_read_write_read_cycle() {
        let (server, addr) = started_server(test_settings()).await;
        server.bank().write(100, &[10, 20, 30, 40, 50]).await.unwrap();

        let mut client = ModbusTcpClient::connect("127.0.0.1", addr.port(), 500)
            .await
            .unwrap();

        let values = client.read_holding_registers(100, 5).await.unwrap();
        assert_eq!(values, vec![10, 20, 30, 40, 50]);

        client.write_single_register(102, 99).await.unwrap();
        let values = client.read_holding_registers(100, 5).await.unwrap();
        assert_eq!(values, vec![10, 20, 99, 40, 50]);

        client.write_multiple_registers(200, &[7, 8, 9]).await.unwrap();
        let values = client.read_holding_registers(200, 3).await.unwrap();
        assert_eq!(values, vec![7, 8, 9]);

        client.close().await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_range_read_returns_exception() {
        let (server, addr) = started_server(test_settings()).await;

        let mut client = ModbusTcpClient::connect("127.0.0.1", addr.port(), 500)
            .await
            .unwrap();

        let err = client.read_holding_registers(65530, 10).await.unwrap_err();
        assert!(matches!(
            err,
            ModbusError::Exception(ExceptionCode::IllegalDataAddress)
        ));

        // The connection stays usable after an exception response
        let values = client.read_holding_registers(65530, 6).await.unwrap();
        assert_eq!(values.len(), 6);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_function_code() {
        let (server, addr) = started_server(test_settings()).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = Frame::new(0xABCD, 1, 0x2B, vec![0x0E, 0x01, 0x00]);
        let response = raw_exchange(&mut stream, &request).await;

        assert_eq!(response.transaction_id, 0xABCD);
        assert_eq!(response.unit_id, 1);
        assert_eq!(response.function_code, 0x2B | EXCEPTION_FLAG);
        assert_eq!(response.payload, vec![ExceptionCode::IllegalFunction.as_u8()]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_count_mismatch_rejected() {
        let (server, addr) = started_server(test_settings()).await;

        // count says 2 registers but only one register of data follows
        let mut payload = Vec::new();
        payload.extend_from_slice(&10u16.to_be_bytes());
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.push(2);
        payload.extend_from_slice(&77u16.to_be_bytes());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = Frame::new(5, 1, FC_WRITE_MULTIPLE_REGISTERS, payload);
        let response = raw_exchange(&mut stream, &request).await;

        assert!(response.is_exception());
        assert_eq!(response.exception_code(), Some(ExceptionCode::IllegalDataValue));

        server.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_client_does_not_block_others() {
        let (server, addr) = started_server(test_settings()).await;
        server.bank().write(0, &[0x1234]).await.unwrap();

        // The slow client stalls after three header bytes
        let request = encode_frame(&read_request(9, 0, 1));
        let mut slow = TcpStream::connect(addr).await.unwrap();
        slow.write_all(&request[..3]).await.unwrap();

        let started = Instant::now();
        let mut fast = ModbusTcpClient::connect("127.0.0.1", addr.port(), 500)
            .await
            .unwrap();
        let values = fast.read_holding_registers(0, 1).await.unwrap();
        assert_eq!(values, vec![0x1234]);
        assert!(started.elapsed() < Duration::from_millis(400));

        // The stalled connection is still alive and finishes its frame
        slow.write_all(&request[3..]).await.unwrap();
        let response = read_one_frame(&mut slow, &mut BytesMut::new()).await;
        assert_eq!(response.transaction_id, 9);
        assert_eq!(response.payload, vec![2, 0x12, 0x34]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_framing_error_closes_only_that_connection() {
        let (server, addr) = started_server(test_settings()).await;

        let mut healthy = ModbusTcpClient::connect("127.0.0.1", addr.port(), 500)
            .await
            .unwrap();
        healthy.read_holding_registers(0, 1).await.unwrap();

        // Nonzero protocol id gets this connection dropped
        let mut broken = TcpStream::connect(addr).await.unwrap();
        broken
            .write_all(&[0x00, 0x01, 0xFF, 0xFF, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
            .await
            .unwrap();
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(1), broken.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        // The healthy connection keeps working
        let values = healthy.read_holding_registers(0, 1).await.unwrap();
        assert_eq!(values.len(), 1);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pipelined_requests_answered_in_order() {
        let (server, addr) = started_server(test_settings()).await;
        server.bank().write(0, &[1, 2]).await.unwrap();

        let mut bytes = encode_frame(&read_request(1, 0, 1));
        bytes.extend_from_slice(&encode_frame(&read_request(2, 1, 1)));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&bytes).await.unwrap();

        let mut buf = BytesMut::new();
        let first = read_one_frame(&mut stream, &mut buf).await;
        let second = read_one_frame(&mut stream, &mut buf).await;
        assert_eq!(first.transaction_id, 1);
        assert_eq!(first.payload, vec![2, 0, 1]);
        assert_eq!(second.transaction_id, 2);
        assert_eq!(second.payload, vec![2, 0, 2]);

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_extra_clients() {
        let mut settings = test_settings();
        settings.max_connections = 1;
        let (server, addr) = started_server(settings).await;

        let mut first = ModbusTcpClient::connect("127.0.0.1", addr.port(), 500)
            .await
            .unwrap();
        first.read_holding_registers(0, 1).await.unwrap();
        assert_eq!(server.get_client_count().await, 1);

        // The extra client connects at the TCP level but is dropped
        // before any request gets served
        let mut second = ModbusTcpClient::connect("127.0.0.1", addr.port(), 300)
            .await
            .unwrap();
        assert!(second.read_holding_registers(0, 1).await.is_err());

        // The first client is unaffected
        first.read_holding_registers(0, 1).await.unwrap();

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let mut settings = test_settings();
        settings.idle_timeout_secs = 1;
        let (server, addr) = started_server(settings).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let started = Instant::now();
        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(3), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert!(started.elapsed() >= Duration::from_millis(900));

        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_halts_accepting() {
        let (server, addr) = started_server(test_settings()).await;
        assert!(server.is_running().await);

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_share_the_bank() {
        let (server, addr) = started_server(test_settings()).await;

        let mut writers = Vec::new();
        for i in 0..4u16 {
            let port = addr.port();
            writers.push(tokio::spawn(async move {
                let mut client = ModbusTcpClient::connect("127.0.0.1", port, 500)
                    .await
                    .unwrap();
                client
                    .write_multiple_registers(i * 10, &[i + 1; 5])
                    .await
                    .unwrap();
                client.close().await;
            }));
        }
        for writer in writers {
            writer.await.unwrap();
        }

        let mut reader = ModbusTcpClient::connect("127.0.0.1", addr.port(), 500)
            .await
            .unwrap();
        for i in 0..4u16 {
            let values = reader.read_holding_registers(i * 10, 5).await.unwrap();
            assert_eq!(values, vec![i + 1; 5]);
        }

        server.stop().await.unwrap();
    }
}
