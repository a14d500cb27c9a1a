use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::types::{Address, Bytes, U256};

use crate::builder::{UserOpContext, UserOperationMiddleware};
use crate::encoding::user_op_to_json;
use crate::error::AccountError;
use crate::provider::AccountProvider;

pub const SIGNATURE_LEN: usize = 65;
pub const PAYMASTER_AND_DATA_LEN: usize = 20 + 32 + 32 + SIGNATURE_LEN;

/// 65-byte ECDSA-shaped placeholder (r, s, v) used until the op is signed.
///
/// Gas estimation charges calldata by byte, so the placeholder must match the
/// length of a real signature and use mostly non-zero bytes.
pub fn dummy_signature() -> Bytes {
    let mut sig = Vec::with_capacity(SIGNATURE_LEN);
    sig.extend([0xff; 15]);
    sig.push(0xf0);
    sig.extend([0x00; 16]);
    sig.push(0x7a);
    sig.extend([0xaa; 31]);
    sig.push(0x1c);
    Bytes::from(sig)
}

/// Placeholder in the verifying paymaster layout:
/// `paymaster(20) || abi.encode(validUntil, validAfter)(64) || signature(65)`.
pub fn dummy_paymaster_and_data() -> Bytes {
    let mut data = Vec::with_capacity(PAYMASTER_AND_DATA_LEN);
    data.extend([0x01; 20]);
    let mut valid_until = [0u8; 32];
    valid_until[26..].copy_from_slice(&[0xff; 6]);
    data.extend(valid_until);
    data.extend([0u8; 32]);
    data.extend(dummy_signature().as_ref());
    Bytes::from(data)
}

/// Sets nonce and init code from the account's deployment status.
///
/// An undeployed account gets nonce 0 and its factory init code; a deployed
/// one gets its on-chain nonce and empty init code. Deployment status is
/// queried on every build. Must run before gas estimation.
pub struct ResolveAccount<P> {
    provider: Arc<P>,
    account: Address,
    init_code: Bytes,
}

impl<P> ResolveAccount<P> {
    pub fn new(provider: Arc<P>, account: Address, init_code: Bytes) -> Self {
        Self {
            provider,
            account,
            init_code,
        }
    }
}

#[async_trait]
impl<P: AccountProvider> UserOperationMiddleware for ResolveAccount<P> {
    fn name(&self) -> &'static str {
        "resolve_account"
    }

    async fn process(&self, ctx: &mut UserOpContext) -> anyhow::Result<()> {
        let code = self
            .provider
            .get_code(self.account)
            .await
            .context("failed to query account code")?;
        let deployed = !code.is_empty();

        if deployed {
            ctx.op.nonce = self
                .provider
                .get_account_nonce(self.account)
                .await
                .context("failed to query account nonce")?;
            ctx.op.init_code = Bytes::new();
        } else {
            ctx.op.nonce = U256::zero();
            ctx.op.init_code = self.init_code.clone();
        }

        tracing::debug!(account = ?self.account, deployed, nonce = %ctx.op.nonce, "resolved account");
        Ok(())
    }
}

/// Writes current network fees into the operation.
pub struct GasPrice<P> {
    provider: Arc<P>,
    multiplier_bps: u64,
}

impl<P> GasPrice<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self {
            provider,
            multiplier_bps: 10_000,
        }
    }

    /// Scales both fee fields, in basis points (15000 = 1.5x). Zero is
    /// rejected since it would zero out both fees.
    pub fn with_multiplier_bps(mut self, bps: u64) -> Result<Self, AccountError> {
        if bps == 0 {
            return Err(AccountError::Argument(
                "gas multiplier must be greater than 0 bps".to_string(),
            ));
        }
        self.multiplier_bps = bps;
        Ok(self)
    }

    fn scale(&self, fee: U256) -> anyhow::Result<U256> {
        fee.checked_mul(U256::from(self.multiplier_bps))
            .map(|scaled| scaled / U256::from(10_000u64))
            .ok_or_else(|| anyhow!("fee {fee} overflows at {} bps", self.multiplier_bps))
    }
}

#[async_trait]
impl<P: AccountProvider> UserOperationMiddleware for GasPrice<P> {
    fn name(&self) -> &'static str {
        "gas_price"
    }

    async fn process(&self, ctx: &mut UserOpContext) -> anyhow::Result<()> {
        let fees = self
            .provider
            .get_fee_data()
            .await
            .context("failed to fetch fee data")?;

        ctx.op.max_fee_per_gas = self.scale(fees.max_fee_per_gas)?;
        ctx.op.max_priority_fee_per_gas = self.scale(fees.max_priority_fee_per_gas)?;

        if self.multiplier_bps != 10_000 {
            tracing::info!(
                "gas multiplier applied: {} bps (maxFeePerGas={}, maxPriorityFeePerGas={})",
                self.multiplier_bps,
                ctx.op.max_fee_per_gas,
                ctx.op.max_priority_fee_per_gas
            );
        }
        Ok(())
    }
}

/// Fills the three gas limits from `eth_estimateUserOperationGas`.
pub struct EstimateGas<P> {
    provider: Arc<P>,
}

impl<P> EstimateGas<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl<P: AccountProvider> UserOperationMiddleware for EstimateGas<P> {
    fn name(&self) -> &'static str {
        "estimate_gas"
    }

    async fn process(&self, ctx: &mut UserOpContext) -> anyhow::Result<()> {
        let est = self
            .provider
            .estimate_user_operation_gas(user_op_to_json(&ctx.op), ctx.entry_point)
            .await
            .context("bundler gas estimate failed")?;

        ctx.op.pre_verification_gas = est.pre_verification_gas;
        ctx.op.verification_gas_limit = est.verification_gas_limit;
        ctx.op.call_gas_limit = est.call_gas_limit;
        Ok(())
    }
}
