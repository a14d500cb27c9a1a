use crate::types::UserOperation;
use anyhow::Context;
use ethers::types::{Address, Bytes, U256};
use serde_json::Value;

pub fn fmt_address(addr: Address) -> String {
    format!("0x{}", hex::encode(addr.as_bytes()))
}

/// JSON-RPC "quantity" encoding.
pub fn fmt_u256(v: U256) -> String {
    if v.is_zero() {
        "0x0".to_string()
    } else {
        format!("0x{:x}", v)
    }
}

pub fn fmt_bytes(b: &Bytes) -> String {
    format!("0x{}", hex::encode(b.as_ref()))
}

/// JSON-safe form of an operation: addresses and byte fields as 0x-hex,
/// integers as quantities.
pub fn user_op_to_json(op: &UserOperation) -> Value {
    serde_json::json!({
        "sender": fmt_address(op.sender),
        "nonce": fmt_u256(op.nonce),
        "initCode": fmt_bytes(&op.init_code),
        "callData": fmt_bytes(&op.call_data),
        "callGasLimit": fmt_u256(op.call_gas_limit),
        "verificationGasLimit": fmt_u256(op.verification_gas_limit),
        "preVerificationGas": fmt_u256(op.pre_verification_gas),
        "maxFeePerGas": fmt_u256(op.max_fee_per_gas),
        "maxPriorityFeePerGas": fmt_u256(op.max_priority_fee_per_gas),
        "paymasterAndData": fmt_bytes(&op.paymaster_and_data),
        "signature": fmt_bytes(&op.signature),
    })
}

/// Parses a JSON-RPC quantity. Decimal strings and JSON numbers are accepted
/// too since some paymaster services return them.
pub fn parse_u256_value(v: &Value) -> anyhow::Result<U256> {
    match v {
        Value::String(s) => match s.strip_prefix("0x") {
            Some("") => Ok(U256::zero()),
            Some(hex_str) => Ok(U256::from_str_radix(hex_str, 16)?),
            None => Ok(U256::from_dec_str(s)?),
        },
        Value::Number(n) => n
            .as_u64()
            .map(U256::from)
            .ok_or_else(|| anyhow::anyhow!("quantity {n} is not an unsigned integer")),
        other => anyhow::bail!("expected quantity, got {other}"),
    }
}

pub fn parse_bytes(s: &str) -> anyhow::Result<Bytes> {
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(hex_str).with_context(|| format!("invalid hex bytes {s}"))?;
    Ok(Bytes::from(bytes))
}

/// Reads `key` from a JSON object as a quantity, `None` when absent or null.
pub fn opt_u256_field(v: &Value, key: &str) -> anyhow::Result<Option<U256>> {
    match v.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(x) => parse_u256_value(x)
            .with_context(|| format!("invalid field {key}"))
            .map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn quantities_use_minimal_hex() {
        assert_eq!(fmt_u256(U256::zero()), "0x0");
        assert_eq!(fmt_u256(U256::from(70_000u64)), "0x11170");
    }

    #[test]
    fn user_op_json_hex_encodes_byte_fields() {
        let op = UserOperation {
            call_data: Bytes::from(vec![0x12, 0x34]),
            ..UserOperation::default()
        };
        let v = user_op_to_json(&op);
        assert_eq!(v["callData"], "0x1234");
        assert_eq!(v["initCode"], "0x");
        assert_eq!(v["sender"], "0x0000000000000000000000000000000000000000");
        assert_eq!(v["callGasLimit"], "0x88b8");
    }

    #[test]
    fn parse_quantity_shapes() {
        assert_eq!(parse_u256_value(&json!("0x10")).unwrap(), U256::from(16u64));
        assert_eq!(parse_u256_value(&json!("0x")).unwrap(), U256::zero());
        assert_eq!(parse_u256_value(&json!("42")).unwrap(), U256::from(42u64));
        assert_eq!(parse_u256_value(&json!(7)).unwrap(), U256::from(7u64));
        assert!(parse_u256_value(&json!(true)).is_err());
    }

    #[test]
    fn opt_field_treats_null_as_missing() {
        let v = json!({ "a": null, "b": "0x1" });
        assert_eq!(opt_u256_field(&v, "a").unwrap(), None);
        assert_eq!(opt_u256_field(&v, "c").unwrap(), None);
        assert_eq!(opt_u256_field(&v, "b").unwrap(), Some(U256::one()));
    }
}
