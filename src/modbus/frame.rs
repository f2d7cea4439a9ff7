use bytes::{Buf, BytesMut};

use crate::utils::error::{ExceptionCode, ModbusError, ModbusResult};

/// MBAP header size: transaction id (2) + protocol id (2) + length (2) + unit id (1).
pub const MBAP_HEADER_SIZE: usize = 7;

/// Maximum payload bytes after the function code in one frame.
pub const MAX_PAYLOAD_SIZE: usize = 253;

/// Protocol identifier for Modbus TCP. Always zero on the wire.
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Function codes the engine speaks.
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// High bit flagging an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Protocol limit for registers per read request.
pub const MAX_READ_COUNT: u16 = 125;
/// Protocol limit for registers per write request.
pub const MAX_WRITE_COUNT: u16 = 123;

/// One Modbus TCP application frame.
///
/// The wire length field is derived on encode (payload + unit id + function
/// code) and validated on decode, so it never lives in the struct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(transaction_id: u16, unit_id: u8, function_code: u8, payload: Vec<u8>) -> Self {
        Self {
            transaction_id,
            unit_id,
            function_code,
            payload,
        }
    }

    /// Build the exception response for a request frame.
    pub fn exception(
        transaction_id: u16,
        unit_id: u8,
        function_code: u8,
        code: ExceptionCode,
    ) -> Self {
        Self {
            transaction_id,
            unit_id,
            function_code: function_code | EXCEPTION_FLAG,
            payload: vec![code.as_u8()],
        }
    }

    pub fn is_exception(&self) -> bool {
        self.function_code & EXCEPTION_FLAG != 0
    }

    /// Exception code carried by this frame, if it is an exception response.
    pub fn exception_code(&self) -> Option<ExceptionCode> {
        if self.is_exception() {
            self.payload.first().map(|&b| ExceptionCode::from_u8(b))
        } else {
            None
        }
    }
}

/// Serialize a frame into MBAP wire bytes. Total and deterministic.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    debug_assert!(frame.payload.len() <= MAX_PAYLOAD_SIZE);

    let mut bytes = Vec::with_capacity(MBAP_HEADER_SIZE + 1 + frame.payload.len());
    bytes.extend_from_slice(&frame.transaction_id.to_be_bytes());
    bytes.extend_from_slice(&MODBUS_PROTOCOL_ID.to_be_bytes());
    // Length counts unit id + function code + payload
    let length = (frame.payload.len() as u16) + 2;
    bytes.extend_from_slice(&length.to_be_bytes());
    bytes.push(frame.unit_id);
    bytes.push(frame.function_code);
    bytes.extend_from_slice(&frame.payload);
    bytes
}

/// Try to pull one complete frame off the front of the buffer.
///
/// Returns `Ok(None)` while bytes are still missing (header shorter than 7
/// bytes, or payload shorter than the declared length); the buffer is left
/// untouched so the caller keeps reading. On success exactly one frame's
/// bytes are consumed and any pipelined followers stay in the buffer.
/// Unknown function codes are passed through; only the envelope is validated
/// here.
pub fn decode_frame(buf: &mut BytesMut) -> ModbusResult<Option<Frame>> {
    if buf.len() < MBAP_HEADER_SIZE {
        return Ok(None);
    }

    let transaction_id = u16::from_be_bytes([buf[0], buf[1]]);
    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;

    if protocol_id != MODBUS_PROTOCOL_ID {
        return Err(ModbusError::FramingError(format!(
            "unexpected protocol id 0x{:04X}",
            protocol_id
        )));
    }
    if length < 2 {
        return Err(ModbusError::FramingError(format!(
            "declared length {} below the 2 byte minimum",
            length
        )));
    }
    if length - 2 > MAX_PAYLOAD_SIZE {
        return Err(ModbusError::FramingError(format!(
            "declared payload {} exceeds {} bytes",
            length - 2,
            MAX_PAYLOAD_SIZE
        )));
    }

    // Full frame on the wire is 6 header bytes + length (unit id, function
    // code, payload)
    let frame_size = 6 + length;
    if buf.len() < frame_size {
        return Ok(None);
    }

    let unit_id = buf[6];
    let function_code = buf[7];
    let payload = buf[8..frame_size].to_vec();
    buf.advance(frame_size);

    Ok(Some(Frame {
        transaction_id,
        unit_id,
        function_code,
        payload,
    }))
}

/// Hex rendering for packet logs, two chars per byte, space separated.
pub fn format_packet(data: &[u8]) -> String {
    let hex_string = hex::encode(data);
    hex_string
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or("??"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_request() -> Frame {
        // Read 5 holding registers starting at 100
        Frame::new(
            0x1234,
            0x01,
            FC_READ_HOLDING_REGISTERS,
            vec![0x00, 0x64, 0x00, 0x05],
        )
    }

    #[test]
    fn test_encode_read_request_bytes() {
        let bytes = encode_frame(&read_request());
        assert_eq!(
            bytes,
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x64, 0x00, 0x05]
        );
    }

    #[test]
    fn test_decode_round_trip() {
        let frame = read_request();
        let mut buf = BytesMut::from(&encode_frame(&frame)[..]);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_needs_more_header_bytes() {
        let bytes = encode_frame(&read_request());
        let mut buf = BytesMut::from(&bytes[..6]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        // Nothing consumed
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_decode_needs_more_payload_bytes() {
        let bytes = encode_frame(&read_request());
        let mut buf = BytesMut::from(&bytes[..bytes.len() - 1]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), bytes.len() - 1);
    }

    #[test]
    fn test_decode_one_byte_at_a_time() {
        let frame = read_request();
        let bytes = encode_frame(&frame);
        let mut buf = BytesMut::new();

        for (i, byte) in bytes.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = decode_frame(&mut buf).unwrap();
            if i < bytes.len() - 1 {
                assert!(result.is_none(), "frame complete after {} of {} bytes", i + 1, bytes.len());
            } else {
                assert_eq!(result.unwrap(), frame);
            }
        }
    }

    #[test]
    fn test_decode_rejects_protocol_id() {
        let mut bytes = encode_frame(&read_request());
        bytes[3] = 0x01;
        let mut buf = BytesMut::from(&bytes[..]);
        let err = decode_frame(&mut buf).unwrap_err();
        assert!(matches!(err, ModbusError::FramingError(_)));
    }

    #[test]
    fn test_decode_rejects_zero_length() {
        let mut bytes = encode_frame(&read_request());
        bytes[4] = 0x00;
        bytes[5] = 0x00;
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ModbusError::FramingError(_))
        ));
    }

    #[test]
    fn test_decode_rejects_header_only_length() {
        let mut bytes = encode_frame(&read_request());
        bytes[5] = 0x01;
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ModbusError::FramingError(_))
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let frame = read_request();
        let mut bytes = encode_frame(&frame);
        // Declared payload of 254 bytes, one past the protocol maximum
        bytes[4] = 0x01;
        bytes[5] = 0x00;
        let mut buf = BytesMut::from(&bytes[..]);
        assert!(matches!(
            decode_frame(&mut buf),
            Err(ModbusError::FramingError(_))
        ));
    }

    #[test]
    fn test_decode_accepts_maximum_payload() {
        let frame = Frame::new(7, 1, FC_READ_HOLDING_REGISTERS, vec![0xAB; MAX_PAYLOAD_SIZE]);
        let mut buf = BytesMut::from(&encode_frame(&frame)[..]);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), frame);
    }

    #[test]
    fn test_decode_leaves_pipelined_frame_in_buffer() {
        let first = read_request();
        let second = Frame::new(0x1235, 0x01, FC_WRITE_SINGLE_REGISTER, vec![0x00, 0x66, 0x00, 0x63]);

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(&first));
        buf.extend_from_slice(&encode_frame(&second));

        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_frame(&mut buf).unwrap().unwrap(), second);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_function_code_passes_through() {
        let frame = Frame::new(9, 1, 0x7F, vec![0x01, 0x02]);
        let mut buf = BytesMut::from(&encode_frame(&frame)[..]);
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.function_code, 0x7F);
    }

    #[test]
    fn test_exception_frame_helpers() {
        let frame = Frame::exception(0x42, 1, FC_READ_HOLDING_REGISTERS, ExceptionCode::IllegalDataAddress);
        assert_eq!(frame.function_code, 0x83);
        assert!(frame.is_exception());
        assert_eq!(frame.exception_code(), Some(ExceptionCode::IllegalDataAddress));

        let plain = read_request();
        assert!(!plain.is_exception());
        assert_eq!(plain.exception_code(), None);
    }

    #[test]
    fn test_format_packet() {
        assert_eq!(format_packet(&[0x12, 0x34, 0x00]), "12 34 00");
        assert_eq!(format_packet(&[]), "");
    }
}
