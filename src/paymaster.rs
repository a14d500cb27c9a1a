use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ethers::types::{Bytes, U256};
use serde_json::Value;

use crate::builder::{UserOpContext, UserOperationMiddleware};
use crate::encoding::{self, opt_u256_field, parse_bytes};
use crate::provider::AccountProvider;

const SPONSOR_METHOD: &str = "pm_sponsorUserOperation";

/// Verification gas is inflated before sponsorship since the paymaster's own
/// validation runs inside the verification phase.
const VERIFICATION_GAS_MULTIPLIER: u64 = 3;

/// Sponsorship stage for a verifying paymaster service
/// (`pm_sponsorUserOperation(op, entryPoint, context)`).
///
/// Replaces the default gas estimation stage: the service returns
/// `paymasterAndData` together with the gas limits it signed over.
pub struct VerifyingPaymaster<P> {
    provider: Arc<P>,
    context: Value,
}

impl<P> VerifyingPaymaster<P> {
    /// `context` is passed through opaquely, e.g. `{"type": "payg"}` or a
    /// policy id object.
    pub fn new(provider: Arc<P>, context: Value) -> Self {
        Self { provider, context }
    }
}

/// Fields a sponsor may return. Each absent field keeps the op's prior value.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SponsorResult {
    pub paymaster_and_data: Option<Bytes>,
    pub pre_verification_gas: Option<U256>,
    pub verification_gas_limit: Option<U256>,
    pub call_gas_limit: Option<U256>,
}

impl SponsorResult {
    pub fn parse(result: &Value) -> Result<Self> {
        if !result.is_object() {
            return Err(anyhow!("unexpected {SPONSOR_METHOD} result shape: {result}"));
        }

        // Some services wrap the v0.6 answer:
        //   { "entrypointV06Response": { "paymasterAndData": "0x..." , ... } }
        let body = if result.get("paymasterAndData").is_some() {
            result
        } else {
            result
                .get("entrypointV06Response")
                .or_else(|| result.get("entryPointV06Response"))
                .unwrap_or(result)
        };

        let paymaster_and_data = match body.get("paymasterAndData") {
            None | Some(Value::Null) => None,
            Some(v) => {
                let s = v
                    .as_str()
                    .ok_or_else(|| anyhow!("paymasterAndData is not a string"))?;
                Some(parse_bytes(s).context("invalid hex in paymasterAndData")?)
            }
        };

        Ok(Self {
            paymaster_and_data,
            pre_verification_gas: opt_u256_field(body, "preVerificationGas")?,
            verification_gas_limit: opt_u256_field(body, "verificationGasLimit")?,
            call_gas_limit: opt_u256_field(body, "callGasLimit")?,
        })
    }

    fn apply(self, ctx: &mut UserOpContext) {
        let op = &mut ctx.op;
        if let Some(v) = self.paymaster_and_data {
            op.paymaster_and_data = v;
        }
        if let Some(v) = self.pre_verification_gas {
            op.pre_verification_gas = v;
        }
        if let Some(v) = self.verification_gas_limit {
            op.verification_gas_limit = v;
        }
        if let Some(v) = self.call_gas_limit {
            op.call_gas_limit = v;
        }
    }
}

#[async_trait]
impl<P: AccountProvider> UserOperationMiddleware for VerifyingPaymaster<P> {
    fn name(&self) -> &'static str {
        "verifying_paymaster"
    }

    async fn process(&self, ctx: &mut UserOpContext) -> anyhow::Result<()> {
        ctx.op.verification_gas_limit = ctx
            .op
            .verification_gas_limit
            .checked_mul(U256::from(VERIFICATION_GAS_MULTIPLIER))
            .ok_or_else(|| anyhow!("verificationGasLimit overflow"))?;

        let params = serde_json::json!([
            encoding::user_op_to_json(&ctx.op),
            encoding::fmt_address(ctx.entry_point),
            self.context,
        ]);
        let res = self
            .provider
            .request(SPONSOR_METHOD, params)
            .await
            .context("pm_sponsorUserOperation RPC failed")?;

        let sponsored = SponsorResult::parse(&res)?;
        tracing::debug!(
            has_paymaster_data = sponsored.paymaster_and_data.is_some(),
            "paymaster sponsored operation"
        );
        sponsored.apply(ctx);
        Ok(())
    }
}
