// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTU request framing and response validation.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt as _};
use bytes::{BufMut as _, Bytes, BytesMut};

use super::{u16_len, u8_len, CRC_SIZE};
use crate::{
    error::{Error, ProtocolError, Result},
    frame::{Address, FunctionCode, Quantity, Request, Word},
    slave::Slave,
};

/// Smallest response that carries a slave, a function code and a CRC.
pub const MIN_RESPONSE_LEN: usize = 1 + 1 + CRC_SIZE;

/// Builds the request ADU without its CRC trailer.
#[must_use]
pub fn encode_request(slave: Slave, request: &Request<'_>) -> BytesMut {
    let mut buf = BytesMut::with_capacity(request_len(request));
    buf.put_u8(slave.0);
    buf.put_u8(request.function_code().value());
    match request {
        Request::ReadHoldingRegisters(address, quantity) => {
            buf.put_u16(*address);
            buf.put_u16(*quantity);
        }
        Request::WriteSingleRegister(address, word) => {
            buf.put_u16(*address);
            buf.put_u16(*word);
        }
        Request::WriteMultipleRegisters(address, words) => {
            buf.put_u16(*address);
            let len = words.len();
            buf.put_u16(u16_len(len));
            buf.put_u8(u8_len(len * 2));
            for w in words.as_ref() {
                buf.put_u16(*w);
            }
        }
    }
    buf
}

fn request_len(request: &Request<'_>) -> usize {
    match request {
        Request::ReadHoldingRegisters(_, _) | Request::WriteSingleRegister(_, _) => 6,
        Request::WriteMultipleRegisters(_, words) => 7 + words.len() * 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Header {
    slave: Slave,
    function: FunctionCode,
}

fn verify_response_header(
    request: Slave,
    response: &[u8],
    min_len: usize,
) -> std::result::Result<Header, ProtocolError> {
    if response.len() < min_len {
        return Err(ProtocolError::ShortResponse {
            expected: min_len,
            actual: response.len(),
        });
    }
    let hdr = Header {
        slave: Slave(response[0]),
        function: FunctionCode::new(response[1]),
    };
    if hdr.slave != request {
        return Err(ProtocolError::SlaveMismatch {
            request,
            response: hdr.slave,
        });
    }
    Ok(hdr)
}

/// Extracts the register bytes from a read holding registers response.
///
/// The returned bytes keep the big-endian wire order.
pub fn decode_read_holding_registers(
    slave: Slave,
    quantity: Quantity,
    response: &Bytes,
) -> Result<Bytes> {
    let hdr = verify_response_header(slave, response, MIN_RESPONSE_LEN + 1)?;
    if hdr.function != FunctionCode::ReadHoldingRegisters {
        return Err(Error::ReadErrorResponse(hdr.function));
    }
    let expected = 2 * usize::from(quantity);
    let actual = usize::from(response[2]);
    if actual != expected {
        return Err(ProtocolError::ByteCountMismatch { expected, actual }.into());
    }
    let end = 3 + expected;
    if response.len() < end + CRC_SIZE {
        return Err(ProtocolError::ShortResponse {
            expected: end + CRC_SIZE,
            actual: response.len(),
        }
        .into());
    }
    Ok(response.slice(3..end))
}

fn check_write_echo_len(response: &[u8]) -> std::result::Result<(), ProtocolError> {
    const ECHO_LEN: usize = 6 + CRC_SIZE;
    if response.len() < ECHO_LEN {
        return Err(ProtocolError::ShortResponse {
            expected: ECHO_LEN,
            actual: response.len(),
        });
    }
    Ok(())
}

/// Validates the echo of a write single register request and returns the echoed value.
pub fn decode_write_single_register(slave: Slave, address: Address, response: &[u8]) -> Result<Word> {
    let hdr = verify_response_header(slave, response, MIN_RESPONSE_LEN)?;
    if hdr.function != FunctionCode::WriteSingleRegister {
        return Err(Error::WriteErrorResponse);
    }
    check_write_echo_len(response)?;
    let mut rdr = Cursor::new(&response[2..6]);
    let echoed_address = rdr.read_u16::<BigEndian>()?;
    let value = rdr.read_u16::<BigEndian>()?;
    if echoed_address != address {
        return Err(Error::WriteErrorResponse);
    }
    Ok(value)
}

/// Validates the echo of a write multiple registers request.
pub fn decode_write_multiple_registers(
    slave: Slave,
    address: Address,
    quantity: Quantity,
    response: &[u8],
) -> Result<()> {
    let hdr = verify_response_header(slave, response, MIN_RESPONSE_LEN)?;
    if hdr.function != FunctionCode::WriteMultipleRegisters {
        return Err(Error::WriteErrorResponse);
    }
    check_write_echo_len(response)?;
    let mut rdr = Cursor::new(&response[2..6]);
    let echoed_address = rdr.read_u16::<BigEndian>()?;
    let echoed_quantity = rdr.read_u16::<BigEndian>()?;
    if echoed_address != address || echoed_quantity != quantity {
        return Err(Error::WriteErrorResponse);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::append_crc;

    fn framed(data: &[u8]) -> Bytes {
        let mut buf = BytesMut::from(data);
        append_crc(&mut buf);
        buf.freeze()
    }

    #[test]
    fn encode_read_holding_registers() {
        let buf = encode_request(Slave(0x01), &Request::ReadHoldingRegisters(0x082B, 2));
        assert_eq!(&buf[..], &[0x01, 0x03, 0x08, 0x2B, 0x00, 0x02]);
    }

    #[test]
    fn encode_write_multiple_registers() {
        let buf = encode_request(
            Slave(0xA4),
            &Request::WriteMultipleRegisters(0x012A, vec![0x6500, 0x1234].into()),
        );
        assert_eq!(
            &buf[..],
            &[0xA4, 0x10, 0x01, 0x2A, 0x00, 0x02, 0x04, 0x65, 0x00, 0x12, 0x34]
        );
    }

    #[test]
    fn decode_read_response() {
        // Given
        let rsp = framed(&[0x10, 0x03, 0x02, 0xAB, 0xCD]);

        // When
        let data = decode_read_holding_registers(Slave(0x10), 1, &rsp).unwrap();

        // Then
        assert_eq!(&data[..], &[0xAB, 0xCD]);
    }

    #[test]
    fn read_response_from_other_slave() {
        let rsp = framed(&[0x11, 0x03, 0x02, 0xAB, 0xCD]);
        let err = decode_read_holding_registers(Slave(0x10), 1, &rsp).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::SlaveMismatch { .. })
        ));
    }

    #[test]
    fn read_response_with_exception() {
        let rsp = framed(&[0x10, 0x83, 0x02, 0x00, 0x00]);
        let err = decode_read_holding_registers(Slave(0x10), 1, &rsp).unwrap_err();
        assert!(matches!(
            err,
            Error::ReadErrorResponse(FunctionCode::Custom(0x83))
        ));
    }

    #[test]
    fn read_response_with_wrong_byte_count() {
        let rsp = framed(&[0x10, 0x03, 0x04, 0xAB, 0xCD, 0x00, 0x00]);
        let err = decode_read_holding_registers(Slave(0x10), 1, &rsp).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ByteCountMismatch {
                expected: 2,
                actual: 4
            })
        ));
    }

    #[test]
    fn truncated_read_response() {
        let rsp = framed(&[0x10, 0x03, 0x04, 0xAB]);
        let err = decode_read_holding_registers(Slave(0x10), 2, &rsp).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::ShortResponse { .. })
        ));
    }

    #[test]
    fn write_single_register_echo() {
        let rsp = framed(&[0xA4, 0x06, 0x00, 0xA3, 0x00, 0x02]);
        assert_eq!(decode_write_single_register(Slave(0xA4), 0xA3, &rsp).unwrap(), 2);

        let rsp = framed(&[0xA4, 0x86, 0x00, 0xA3, 0x00, 0x02]);
        assert!(matches!(
            decode_write_single_register(Slave(0xA4), 0xA3, &rsp),
            Err(Error::WriteErrorResponse)
        ));
    }

    #[test]
    fn write_response_with_exception() {
        // Given
        let single = framed(&[0xA0, 0x86, 0x02]);
        let multiple = framed(&[0xA0, 0x90, 0x02]);

        // When
        let single = decode_write_single_register(Slave(0xA0), 0xA3, &single);
        let multiple = decode_write_multiple_registers(Slave(0xA0), 0x012A, 2, &multiple);

        // Then
        assert!(matches!(single, Err(Error::WriteErrorResponse)));
        assert!(matches!(multiple, Err(Error::WriteErrorResponse)));
        assert_eq!(
            single.unwrap_err().code(),
            crate::error::ErrorCode::WriteErrorResponse
        );
    }

    #[test]
    fn truncated_write_echo() {
        let rsp = framed(&[0xA0, 0x06, 0x00]);
        assert!(matches!(
            decode_write_single_register(Slave(0xA0), 0xA3, &rsp),
            Err(Error::Protocol(ProtocolError::ShortResponse {
                expected: 8,
                actual: 5
            }))
        ));
        let rsp = framed(&[0xA1, 0x86, 0x02]);
        assert!(matches!(
            decode_write_single_register(Slave(0xA0), 0xA3, &rsp),
            Err(Error::Protocol(ProtocolError::SlaveMismatch { .. }))
        ));
    }

    #[test]
    fn write_multiple_registers_echo_count() {
        let rsp = framed(&[0xA4, 0x10, 0x01, 0x2A, 0x00, 0x02]);
        assert!(decode_write_multiple_registers(Slave(0xA4), 0x012A, 2, &rsp).is_ok());

        let rsp = framed(&[0xA4, 0x10, 0x01, 0x2A, 0x00, 0x01]);
        assert!(matches!(
            decode_write_multiple_registers(Slave(0xA4), 0x012A, 2, &rsp),
            Err(Error::WriteErrorResponse)
        ));
    }
}
