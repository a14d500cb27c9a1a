use crate::encoding::{fmt_address, opt_u256_field};
use anyhow::{anyhow, Context, Result};
use ethers::types::{Address, U256};
use serde_json::Value;

/// Plain JSON-RPC client for ERC-4337 node methods (`eth_estimateUserOperationGas`,
/// `pm_*`), which the chain provider does not model.
#[derive(Debug, Clone)]
pub struct BundlerClient {
    url: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GasEstimates {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
}

impl BundlerClient {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entrypoint: Address,
    ) -> Result<GasEstimates> {
        let params = serde_json::json!([user_op, fmt_address(entrypoint)]);
        let res = self
            .request("eth_estimateUserOperationGas", params)
            .await
            .context("eth_estimateUserOperationGas failed")?;
        parse_gas_estimates(&res)
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let req = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&req)
            .send()
            .await
            .with_context(|| format!("POST {} failed", self.url))?;

        let status = resp.status();
        let body: Value = resp.json().await.context("failed to decode JSON")?;

        if !status.is_success() {
            return Err(anyhow!("HTTP {}: {}", status, body));
        }

        if let Some(err) = body.get("error") {
            return Err(anyhow!("RPC error: {}", err));
        }

        body.get("result")
            .cloned()
            .ok_or_else(|| anyhow!("missing result field"))
    }
}

fn parse_gas_estimates(res: &Value) -> Result<GasEstimates> {
    let required = |key: &str| -> Result<U256> {
        opt_u256_field(res, key)?.ok_or_else(|| anyhow!("missing field {key}"))
    };

    // Older bundlers report `verificationGas` instead of `verificationGasLimit`.
    let verification_gas_limit = match opt_u256_field(res, "verificationGasLimit")? {
        Some(v) => v,
        None => required("verificationGas")?,
    };

    Ok(GasEstimates {
        call_gas_limit: required("callGasLimit")?,
        verification_gas_limit,
        pre_verification_gas: required("preVerificationGas")?,
    })
}
