use ethers::types::{Address, Bytes, U256};

use crate::error::AccountError;

pub const DEFAULT_CALL_GAS_LIMIT: u64 = 35_000;
pub const DEFAULT_VERIFICATION_GAS_LIMIT: u64 = 70_000;
pub const DEFAULT_PRE_VERIFICATION_GAS: u64 = 21_000;

/// ERC-4337 UserOperation (EntryPoint v0.6 layout).
///
/// Every field always holds a concrete value. `Default` gives the starting
/// point of a build: zero sender and nonce, empty byte fields and the
/// standard gas limit guesses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl Default for UserOperation {
    fn default() -> Self {
        Self {
            sender: Address::zero(),
            nonce: U256::zero(),
            init_code: Bytes::new(),
            call_data: Bytes::new(),
            call_gas_limit: U256::from(DEFAULT_CALL_GAS_LIMIT),
            verification_gas_limit: U256::from(DEFAULT_VERIFICATION_GAS_LIMIT),
            pre_verification_gas: U256::from(DEFAULT_PRE_VERIFICATION_GAS),
            max_fee_per_gas: U256::zero(),
            max_priority_fee_per_gas: U256::zero(),
            paymaster_and_data: Bytes::new(),
            signature: Bytes::new(),
        }
    }
}

impl UserOperation {
    pub fn apply(&mut self, value: FieldValue) {
        match value {
            FieldValue::Sender(v) => self.sender = v,
            FieldValue::Nonce(v) => self.nonce = v,
            FieldValue::InitCode(v) => self.init_code = v,
            FieldValue::CallData(v) => self.call_data = v,
            FieldValue::CallGasLimit(v) => self.call_gas_limit = v,
            FieldValue::VerificationGasLimit(v) => self.verification_gas_limit = v,
            FieldValue::PreVerificationGas(v) => self.pre_verification_gas = v,
            FieldValue::MaxFeePerGas(v) => self.max_fee_per_gas = v,
            FieldValue::MaxPriorityFeePerGas(v) => self.max_priority_fee_per_gas = v,
            FieldValue::PaymasterAndData(v) => self.paymaster_and_data = v,
            FieldValue::Signature(v) => self.signature = v,
        }
    }
}

/// Field names of a [`UserOperation`], in struct order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserOpField {
    Sender,
    Nonce,
    InitCode,
    CallData,
    CallGasLimit,
    VerificationGasLimit,
    PreVerificationGas,
    MaxFeePerGas,
    MaxPriorityFeePerGas,
    PaymasterAndData,
    Signature,
}

/// A value for one [`UserOperation`] field, tagged with the field it targets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Sender(Address),
    Nonce(U256),
    InitCode(Bytes),
    CallData(Bytes),
    CallGasLimit(U256),
    VerificationGasLimit(U256),
    PreVerificationGas(U256),
    MaxFeePerGas(U256),
    MaxPriorityFeePerGas(U256),
    PaymasterAndData(Bytes),
    Signature(Bytes),
}

impl FieldValue {
    pub fn field(&self) -> UserOpField {
        match self {
            FieldValue::Sender(_) => UserOpField::Sender,
            FieldValue::Nonce(_) => UserOpField::Nonce,
            FieldValue::InitCode(_) => UserOpField::InitCode,
            FieldValue::CallData(_) => UserOpField::CallData,
            FieldValue::CallGasLimit(_) => UserOpField::CallGasLimit,
            FieldValue::VerificationGasLimit(_) => UserOpField::VerificationGasLimit,
            FieldValue::PreVerificationGas(_) => UserOpField::PreVerificationGas,
            FieldValue::MaxFeePerGas(_) => UserOpField::MaxFeePerGas,
            FieldValue::MaxPriorityFeePerGas(_) => UserOpField::MaxPriorityFeePerGas,
            FieldValue::PaymasterAndData(_) => UserOpField::PaymasterAndData,
            FieldValue::Signature(_) => UserOpField::Signature,
        }
    }
}

/// One sub-call of a MultiSend batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultiSendCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
    /// `true` runs the call with DELEGATECALL in the account's storage context.
    pub delegate_call: bool,
}

impl MultiSendCall {
    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            value: U256::zero(),
            delegate_call: false,
        }
    }

    pub fn delegate(to: Address, data: Bytes) -> Self {
        Self {
            delegate_call: true,
            ..Self::call(to, data)
        }
    }

    /// Builds a call from an untyped hex target. The target must be exactly
    /// 20 bytes.
    pub fn parse(
        to: &str,
        data: Bytes,
        value: Option<U256>,
        delegate_call: bool,
    ) -> Result<Self, AccountError> {
        let hex_str = to.strip_prefix("0x").unwrap_or(to);
        let raw = hex::decode(hex_str)
            .map_err(|e| AccountError::Encoding(format!("invalid target {to}: {e}")))?;
        if raw.len() != 20 {
            return Err(AccountError::Encoding(format!(
                "invalid target {to}: expected 20 bytes, got {}",
                raw.len()
            )));
        }
        Ok(Self {
            to: Address::from_slice(&raw),
            data,
            value: value.unwrap_or_default(),
            delegate_call,
        })
    }
}
