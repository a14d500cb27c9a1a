use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ethers::abi::{AbiParser, ParamType, Token};
use ethers::contract::{Contract, ContractError};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockNumber, Bytes, U256};
#[cfg(test)]
use mockall::automock;
use serde_json::Value;

use crate::bundler::{BundlerClient, GasEstimates};

/// Outcome of the simulated `EntryPoint.getSenderAddress(initCode)` call.
///
/// The entry point always reverts with `SenderAddressResult(address)`, so a
/// revert carrying that error is the success path.
#[derive(Debug)]
pub enum SenderAddressOutcome {
    Predicted(Address),
    /// The call returned normally. Entry point version mismatch.
    Unexpected,
    /// Any other failure, passed through untouched.
    Opaque(anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FeeData {
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

/// Network capability used by account resolution and the middleware stages.
///
/// Implementations hold no per-call state and are shared read-only.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccountProvider: Send + Sync + 'static {
    async fn chain_id(&self) -> anyhow::Result<u64>;

    async fn get_sender_address(
        &self,
        entry_point: Address,
        init_code: Bytes,
    ) -> SenderAddressOutcome;

    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes>;

    /// Nonce counter exposed by the account contract itself (`getNonce()`).
    async fn get_account_nonce(&self, account: Address) -> anyhow::Result<U256>;

    async fn get_fee_data(&self) -> anyhow::Result<FeeData>;

    async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entry_point: Address,
    ) -> anyhow::Result<GasEstimates>;

    /// Arbitrary JSON-RPC call against the node, e.g. paymaster methods.
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value>;
}

/// [`AccountProvider`] backed by an ethers middleware for chain reads and a
/// raw JSON-RPC client for ERC-4337 methods.
#[derive(Debug, Clone)]
pub struct NodeClient<M> {
    client: Arc<M>,
    bundler: BundlerClient,
}

impl NodeClient<Provider<Http>> {
    /// Uses one endpoint for both chain reads and ERC-4337 methods, which is
    /// how bundler-hosted node URLs are served.
    pub fn connect(url: &str) -> anyhow::Result<Self> {
        let provider = Provider::<Http>::try_from(url)
            .with_context(|| format!("invalid RPC url {url}"))?
            .interval(Duration::from_millis(350));
        Ok(Self::new(Arc::new(provider), BundlerClient::new(url.to_string())))
    }
}

impl<M> NodeClient<M> {
    pub fn new(client: Arc<M>, bundler: BundlerClient) -> Self {
        Self { client, bundler }
    }
}

#[async_trait]
impl<M> AccountProvider for NodeClient<M>
where
    M: Middleware + 'static,
    M::Error: 'static,
{
    async fn chain_id(&self) -> anyhow::Result<u64> {
        Ok(self
            .client
            .get_chainid()
            .await
            .context("eth_chainId failed")?
            .as_u64())
    }

    async fn get_sender_address(
        &self,
        entry_point: Address,
        init_code: Bytes,
    ) -> SenderAddressOutcome {
        let abi = match AbiParser::default().parse(&["function getSenderAddress(bytes initCode)"]) {
            Ok(abi) => abi,
            Err(e) => return SenderAddressOutcome::Opaque(e.into()),
        };
        let entry_point = Contract::new(entry_point, abi, self.client.clone());
        let call = match entry_point.method::<_, ()>("getSenderAddress", init_code) {
            Ok(call) => call,
            Err(e) => return SenderAddressOutcome::Opaque(e.into()),
        };

        let error = match call.call().await {
            Ok(()) => return SenderAddressOutcome::Unexpected,
            Err(error) => error,
        };
        if let ContractError::Revert(revert_data) = &error {
            if let Some(sender) = decode_sender_address_result(revert_data) {
                return SenderAddressOutcome::Predicted(sender);
            }
        }
        SenderAddressOutcome::Opaque(error.into())
    }

    async fn get_code(&self, address: Address) -> anyhow::Result<Bytes> {
        self.client
            .get_code(address, None)
            .await
            .context("eth_getCode failed")
    }

    async fn get_account_nonce(&self, account: Address) -> anyhow::Result<U256> {
        let abi = AbiParser::default().parse(&["function getNonce() view returns (uint256)"])?;
        let account_c = Contract::new(account, abi, self.client.clone());
        let nonce: U256 = account_c
            .method("getNonce", ())?
            .call()
            .await
            .context("account.getNonce failed")?;
        Ok(nonce)
    }

    async fn get_fee_data(&self) -> anyhow::Result<FeeData> {
        let base_fee = match self.client.get_block(BlockNumber::Latest).await {
            Ok(block) => block.and_then(|b| b.base_fee_per_gas),
            Err(e) => {
                tracing::debug!(error = %e, "latest block query failed");
                None
            }
        };
        let priority_fee: Option<U256> = match self
            .client
            .provider()
            .request("eth_maxPriorityFeePerGas", ())
            .await
        {
            Ok(fee) => Some(fee),
            Err(e) => {
                tracing::debug!(error = %e, "eth_maxPriorityFeePerGas unsupported");
                None
            }
        };

        if let Some(fees) = eip1559_fees(base_fee, priority_fee) {
            return Ok(fees);
        }

        // Legacy chains: a single gas price covers both fields.
        let gas_price = self
            .client
            .get_gas_price()
            .await
            .context("failed to fetch gas price")?;
        Ok(FeeData {
            max_fee_per_gas: gas_price,
            max_priority_fee_per_gas: gas_price,
        })
    }

    async fn estimate_user_operation_gas(
        &self,
        user_op: Value,
        entry_point: Address,
    ) -> anyhow::Result<GasEstimates> {
        self.bundler
            .estimate_user_operation_gas(user_op, entry_point)
            .await
    }

    async fn request(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        self.bundler.request(method, params).await
    }
}

/// `maxFeePerGas = 2 * baseFee + priorityFee`, saturating at `U256::MAX`;
/// `None` unless both inputs are known.
fn eip1559_fees(base_fee: Option<U256>, priority_fee: Option<U256>) -> Option<FeeData> {
    let (base_fee, priority_fee) = (base_fee?, priority_fee?);
    Some(FeeData {
        max_fee_per_gas: base_fee
            .saturating_mul(U256::from(2u64))
            .saturating_add(priority_fee),
        max_priority_fee_per_gas: priority_fee,
    })
}

/// Extracts the sender from `SenderAddressResult(address)` revert data.
pub fn decode_sender_address_result(data: &[u8]) -> Option<Address> {
    let selector = ethers::utils::id("SenderAddressResult(address)");
    let args = data.strip_prefix(selector.as_slice())?;
    match ethers::abi::decode(&[ParamType::Address], args).ok()?.as_slice() {
        [Token::Address(sender)] => Some(*sender),
        _ => None,
    }
}
