//! Packed transaction encoding for the MultiSend relay contract.
//!
//! Each call becomes one record, concatenated in order with no padding:
//!
//! | bytes | field                              |
//! |-------|------------------------------------|
//! | 1     | operation (0 = call, 1 = delegate) |
//! | 20    | target address                     |
//! | 32    | value, big-endian                  |
//! | 32    | data length, big-endian            |
//! | N     | data                               |

use ethers::types::{Address, Bytes, U256};

use crate::error::AccountError;
use crate::types::MultiSendCall;

const HEADER_LEN: usize = 1 + 20 + 32 + 32;

pub fn encode_multi_send(calls: &[MultiSendCall]) -> Bytes {
    let len = calls.iter().map(|c| HEADER_LEN + c.data.len()).sum();
    let mut out = Vec::with_capacity(len);
    for call in calls {
        encode_call(call, &mut out);
    }
    Bytes::from(out)
}

fn encode_call(call: &MultiSendCall, out: &mut Vec<u8>) {
    let mut word = [0u8; 32];
    out.push(u8::from(call.delegate_call));
    out.extend_from_slice(call.to.as_bytes());
    call.value.to_big_endian(&mut word);
    out.extend_from_slice(&word);
    U256::from(call.data.len()).to_big_endian(&mut word);
    out.extend_from_slice(&word);
    out.extend_from_slice(call.data.as_ref());
}

pub fn decode_multi_send(encoded: &[u8]) -> Result<Vec<MultiSendCall>, AccountError> {
    let mut calls = Vec::new();
    let mut rest = encoded;
    while !rest.is_empty() {
        if rest.len() < HEADER_LEN {
            return Err(AccountError::Encoding(format!(
                "truncated record header: {} bytes left",
                rest.len()
            )));
        }
        let delegate_call = match rest[0] {
            0 => false,
            1 => true,
            op => {
                return Err(AccountError::Encoding(format!(
                    "unknown operation type {op}"
                )))
            }
        };
        let to = Address::from_slice(&rest[1..21]);
        let value = U256::from_big_endian(&rest[21..53]);
        let data_len = U256::from_big_endian(&rest[53..HEADER_LEN]);
        let body = &rest[HEADER_LEN..];
        if data_len > U256::from(body.len()) {
            return Err(AccountError::Encoding(format!(
                "record declares {data_len} data bytes, {} available",
                body.len()
            )));
        }
        let data_len = data_len.as_usize();
        calls.push(MultiSendCall {
            to,
            data: Bytes::from(body[..data_len].to_vec()),
            value,
            delegate_call,
        });
        rest = &body[data_len..];
    }
    Ok(calls)
}
