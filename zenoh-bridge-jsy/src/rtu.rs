//! Modbus RTU framing for read-registers transactions.

use crc::{CRC_16_MODBUS, Crc};

use crate::error::TransactionError;
use crate::registers::ReadFunction;

const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Size of a request frame: address, function, start, count, CRC.
pub const REQUEST_LEN: usize = 8;

/// Size of an exception response: address, function | 0x80, code, CRC.
pub const EXCEPTION_LEN: usize = 5;

/// Bit set in the function code of an exception response.
pub const EXCEPTION_FLAG: u8 = 0x80;

/// CRC-16/Modbus of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC (low byte first) to a frame body.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Format a frame as hex for trace logging.
pub fn hex(frame: &[u8]) -> String {
    frame
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// A read holding/input registers request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub address: u8,
    pub function: ReadFunction,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn new(address: u8, function: ReadFunction, start: u16, count: u16) -> Self {
        Self {
            address,
            function,
            start,
            count,
        }
    }

    /// Encode the request frame, CRC included.
    pub fn encode(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(REQUEST_LEN);
        frame.push(self.address);
        frame.push(self.function.code());
        frame.extend_from_slice(&self.start.to_be_bytes());
        frame.extend_from_slice(&self.count.to_be_bytes());
        append_crc(&mut frame);
        frame
    }

    /// Length of a normal response: `3 + 2 * count + 2`.
    pub fn response_len(&self) -> usize {
        3 + 2 * self.count as usize + 2
    }

    /// Validate a complete response frame and return the register data.
    ///
    /// The CRC is checked before anything else so a corrupted frame is never
    /// interpreted.
    pub fn parse_response<'a>(&self, frame: &'a [u8]) -> Result<&'a [u8], TransactionError> {
        if frame.len() < EXCEPTION_LEN {
            return Err(TransactionError::ShortRead {
                expected: self.response_len(),
                received: frame.len(),
            });
        }

        let (body, crc_bytes) = frame.split_at(frame.len() - 2);
        let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        let computed = crc16(body);
        if received != computed {
            return Err(TransactionError::CrcMismatch { received, computed });
        }

        if body[0] != self.address {
            return Err(TransactionError::UnexpectedResponse(format!(
                "address 0x{:02X}, expected 0x{:02X}",
                body[0], self.address
            )));
        }

        let function = body[1];
        if function == self.function.code() | EXCEPTION_FLAG {
            return Err(TransactionError::DeviceException(body[2].into()));
        }
        if function != self.function.code() {
            return Err(TransactionError::UnexpectedResponse(format!(
                "function 0x{:02X}, expected 0x{:02X}",
                function,
                self.function.code()
            )));
        }

        let byte_count = body[2] as usize;
        let data = &body[3..];
        if byte_count != 2 * self.count as usize || data.len() != byte_count {
            return Err(TransactionError::UnexpectedResponse(format!(
                "byte count {} with {} data bytes, expected {}",
                byte_count,
                data.len(),
                2 * self.count
            )));
        }

        Ok(data)
    }
}

/// Build a normal read response frame (used by simulators and tests).
pub fn encode_read_response(address: u8, function: ReadFunction, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 5);
    frame.push(address);
    frame.push(function.code());
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    append_crc(&mut frame);
    frame
}

/// Build an exception response frame.
pub fn encode_exception(address: u8, function: ReadFunction, code: u8) -> Vec<u8> {
    let mut frame = vec![address, function.code() | EXCEPTION_FLAG, code];
    append_crc(&mut frame);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExceptionCode;

    #[test]
    fn test_crc16_known_vectors() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
        assert_eq!(crc16(&[0x01, 0x04, 0x00, 0x00, 0x00, 0x02]), 0xCB71);
    }

    #[test]
    fn test_encode_input_request() {
        let request = ReadRequest::new(0x01, ReadFunction::Input, 0x0000, 2);
        assert_eq!(
            request.encode(),
            vec![0x01, 0x04, 0x00, 0x00, 0x00, 0x02, 0x71, 0xCB]
        );
        assert_eq!(request.response_len(), 9);
    }

    #[test]
    fn test_encode_meter_block_request() {
        let request = ReadRequest::new(0x01, ReadFunction::Holding, 0x0100, 0x44);
        assert_eq!(
            request.encode(),
            vec![0x01, 0x03, 0x01, 0x00, 0x00, 0x44, 0x44, 0x05]
        );
        assert_eq!(request.response_len(), 141);
    }

    #[test]
    fn test_parse_response_strips_header_and_crc() {
        let request = ReadRequest::new(0x01, ReadFunction::Input, 0, 2);
        let frame = encode_read_response(0x01, ReadFunction::Input, &[0x00, 0x00, 0x27, 0x10]);

        assert_eq!(request.parse_response(&frame).unwrap(), &[0x00, 0x00, 0x27, 0x10]);
    }

    #[test]
    fn test_flipped_data_bit_is_crc_mismatch() {
        let request = ReadRequest::new(0x07, ReadFunction::Holding, 0x0100, 3);
        let good = encode_read_response(0x07, ReadFunction::Holding, &[1, 2, 3, 4, 5, 6]);

        for byte in 3..good.len() - 2 {
            for bit in 0..8 {
                let mut bad = good.clone();
                bad[byte] ^= 1 << bit;
                assert!(
                    matches!(
                        request.parse_response(&bad),
                        Err(TransactionError::CrcMismatch { .. })
                    ),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn test_exception_response() {
        let request = ReadRequest::new(0x01, ReadFunction::Holding, 0x0100, 0x44);
        let frame = encode_exception(0x01, ReadFunction::Holding, 0x02);

        match request.parse_response(&frame) {
            Err(TransactionError::DeviceException(code)) => {
                assert_eq!(code, ExceptionCode::IllegalDataAddress);
            }
            other => panic!("expected exception, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_address() {
        let request = ReadRequest::new(0x01, ReadFunction::Holding, 0, 1);
        let frame = encode_read_response(0x02, ReadFunction::Holding, &[0, 1]);

        assert!(matches!(
            request.parse_response(&frame),
            Err(TransactionError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_wrong_byte_count() {
        let request = ReadRequest::new(0x01, ReadFunction::Holding, 0, 2);
        let frame = encode_read_response(0x01, ReadFunction::Holding, &[0, 1]);

        assert!(matches!(
            request.parse_response(&frame),
            Err(TransactionError::UnexpectedResponse(_))
        ));
    }

    #[test]
    fn test_truncated_frame() {
        let request = ReadRequest::new(0x01, ReadFunction::Holding, 0, 2);

        assert!(matches!(
            request.parse_response(&[0x01, 0x03]),
            Err(TransactionError::ShortRead {
                expected: 9,
                received: 2
            })
        ));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x01, 0xAB, 0x00]), "01 AB 00");
    }
}
