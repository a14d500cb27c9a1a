use std::sync::Arc;

use ethers::abi::{AbiParser, Tokenize};
use ethers::contract::BaseContract;
use ethers::types::{Address, Bytes, H160, U256};

use crate::builder::{UserOperationBuilder, UserOperationMiddleware};
use crate::error::AccountError;
use crate::middleware::{
    dummy_paymaster_and_data, dummy_signature, EstimateGas, GasPrice, ResolveAccount,
};
use crate::multisend::encode_multi_send;
use crate::provider::{AccountProvider, SenderAddressOutcome};
use crate::types::{FieldValue, MultiSendCall, UserOperation};

/// MultiSend deployment used for batched calls (0x8ae01fcf7c655655ff2c6ef907b8b4718ab4ef0b).
pub const DEFAULT_MULTISEND_ADDRESS: Address = H160([
    0x8a, 0xe0, 0x1f, 0xcf, 0x7c, 0x65, 0x56, 0x55, 0xff, 0x2c, 0x6e, 0xf9, 0x07, 0xb8, 0xb4,
    0x71, 0x8a, 0xb4, 0xef, 0x0b,
]);

/// Kernel `Operation` enum: plain call or delegatecall.
const OPERATION_CALL: u8 = 0;
const OPERATION_DELEGATE_CALL: u8 = 1;

#[derive(Clone, Debug)]
pub struct KernelConfig {
    pub owner: Address,
    pub entry_point: Address,
    pub factory: Address,
    /// Deployment index passed to `createAccount`, one account per index.
    pub index: U256,
    pub multi_send: Address,
    /// Applied to fetched gas fees, in basis points.
    pub gas_multiplier_bps: u64,
}

impl KernelConfig {
    pub fn new(owner: Address, entry_point: Address, factory: Address) -> Self {
        Self {
            owner,
            entry_point,
            factory,
            index: U256::zero(),
            multi_send: DEFAULT_MULTISEND_ADDRESS,
            gas_multiplier_bps: 10_000,
        }
    }
}

/// Kernel smart account bound to a resolved (possibly counterfactual) address.
///
/// Holds the op builder; the `execute*` methods set its call data and
/// [`KernelAccount::build_op`] runs the pipeline.
pub struct KernelAccount<P> {
    builder: UserOperationBuilder,
    provider: Arc<P>,
    config: KernelConfig,
    proxy: Address,
    init_code: Bytes,
    chain_id: u64,
}

impl<P: AccountProvider> KernelAccount<P> {
    /// Resolves the account address and registers the build pipeline:
    /// account resolution, gas price, then `paymaster` if given or bundler
    /// gas estimation otherwise.
    pub async fn init(
        provider: Arc<P>,
        config: KernelConfig,
        paymaster: Option<Arc<dyn UserOperationMiddleware>>,
    ) -> Result<Self, AccountError> {
        let init_code = factory_init_code(config.factory, config.owner, config.index)?;
        let proxy =
            resolve_sender_address(provider.as_ref(), config.entry_point, init_code.clone())
                .await?;
        let chain_id = provider.chain_id().await?;

        tracing::info!(
            owner = ?config.owner,
            index = %config.index,
            account = ?proxy,
            chain_id,
            "resolved kernel account"
        );

        let mut builder = UserOperationBuilder::new();
        builder
            .use_defaults([
                FieldValue::Sender(proxy),
                FieldValue::Signature(dummy_signature()),
            ])
            .use_middleware(Arc::new(ResolveAccount::new(
                provider.clone(),
                proxy,
                init_code.clone(),
            )))
            .use_middleware(Arc::new(
                GasPrice::new(provider.clone()).with_multiplier_bps(config.gas_multiplier_bps)?,
            ));
        // Unsponsored ops keep empty paymaster data; the placeholder is only
        // sized for the verifying paymaster's eventual payload.
        match paymaster {
            Some(pm) => builder
                .use_defaults([FieldValue::PaymasterAndData(dummy_paymaster_and_data())])
                .use_middleware(pm),
            None => builder.use_middleware(Arc::new(EstimateGas::new(provider.clone()))),
        };

        Ok(Self {
            builder,
            provider,
            config,
            proxy,
            init_code,
            chain_id,
        })
    }

    pub fn address(&self) -> Address {
        self.proxy
    }

    /// `factory || createAccount(owner, index)`, attached while undeployed.
    pub fn init_code(&self) -> &Bytes {
        &self.init_code
    }

    pub fn entry_point(&self) -> Address {
        self.config.entry_point
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn builder(&self) -> &UserOperationBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut UserOperationBuilder {
        &mut self.builder
    }

    pub async fn is_deployed(&self) -> Result<bool, AccountError> {
        let code = self.provider.get_code(self.proxy).await?;
        Ok(!code.is_empty())
    }

    pub fn execute(
        &mut self,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> Result<&mut Self, AccountError> {
        let call_data = encode_execute_and_revert(to, value, data, OPERATION_CALL)?;
        self.builder.set_call_data(call_data);
        Ok(self)
    }

    /// Like [`KernelAccount::execute`], but runs `data` via delegatecall in
    /// the account's storage context.
    pub fn execute_delegate(
        &mut self,
        to: Address,
        value: U256,
        data: Bytes,
    ) -> Result<&mut Self, AccountError> {
        let call_data = encode_execute_and_revert(to, value, data, OPERATION_DELEGATE_CALL)?;
        self.builder.set_call_data(call_data);
        Ok(self)
    }

    /// Batches calls through MultiSend, delegatecalled from the account so
    /// every sub-call runs as the account. All three slices must have the same
    /// length.
    pub fn execute_batch(
        &mut self,
        to: &[Address],
        data: &[Bytes],
        delegate_call: &[bool],
    ) -> Result<&mut Self, AccountError> {
        if to.len() != data.len() || to.len() != delegate_call.len() {
            return Err(AccountError::Argument(format!(
                "batch length mismatch: {} targets, {} payloads, {} delegate flags",
                to.len(),
                data.len(),
                delegate_call.len()
            )));
        }

        let calls: Vec<MultiSendCall> = to
            .iter()
            .zip(data)
            .zip(delegate_call)
            .map(|((to, data), delegate_call)| MultiSendCall {
                to: *to,
                data: data.clone(),
                value: U256::zero(),
                delegate_call: *delegate_call,
            })
            .collect();

        let multi_send_calldata = encode_multi_send_call(&calls)?;
        self.execute_delegate(self.config.multi_send, U256::zero(), multi_send_calldata)
    }

    /// Runs the pipeline against this account's entry point and chain.
    pub async fn build_op(&mut self) -> Result<UserOperation, AccountError> {
        self.builder
            .build_op(self.config.entry_point, self.chain_id)
            .await
    }
}

/// Predicts the account address via `EntryPoint.getSenderAddress(initCode)`.
///
/// The simulated call must revert with `SenderAddressResult`. A normal return
/// is a [`AccountError::Resolution`]; any other failure is returned as is.
pub async fn resolve_sender_address<P: AccountProvider + ?Sized>(
    provider: &P,
    entry_point: Address,
    init_code: Bytes,
) -> Result<Address, AccountError> {
    match provider.get_sender_address(entry_point, init_code).await {
        SenderAddressOutcome::Predicted(sender) => Ok(sender),
        SenderAddressOutcome::Unexpected => Err(AccountError::Resolution(
            "getSenderAddress: unexpected result".to_string(),
        )),
        SenderAddressOutcome::Opaque(e) => Err(AccountError::Rpc(e)),
    }
}

pub fn factory_init_code(
    factory: Address,
    owner: Address,
    index: U256,
) -> Result<Bytes, AccountError> {
    let create_calldata = encode_function(
        "function createAccount(address _owner, uint256 _index) returns (address)",
        "createAccount",
        (owner, index),
    )
    .map_err(|e| AccountError::Resolution(format!("failed to build createAccount calldata: {e}")))?;

    let mut v = Vec::with_capacity(20 + create_calldata.len());
    v.extend_from_slice(factory.as_bytes());
    v.extend_from_slice(create_calldata.as_ref());
    Ok(Bytes::from(v))
}

fn encode_execute_and_revert(
    to: Address,
    value: U256,
    data: Bytes,
    operation: u8,
) -> Result<Bytes, AccountError> {
    encode_function(
        "function executeAndRevert(address to, uint256 value, bytes data, uint8 operation)",
        "executeAndRevert",
        (to, value, data, operation),
    )
    .map_err(|e| AccountError::Encoding(format!("failed to build executeAndRevert calldata: {e}")))
}

fn encode_multi_send_call(calls: &[MultiSendCall]) -> Result<Bytes, AccountError> {
    encode_function(
        "function multiSend(bytes transactions)",
        "multiSend",
        encode_multi_send(calls),
    )
    .map_err(|e| AccountError::Encoding(format!("failed to build multiSend calldata: {e}")))
}

fn encode_function<T: Tokenize>(signature: &str, name: &str, args: T) -> anyhow::Result<Bytes> {
    let abi = AbiParser::default().parse(&[signature])?;
    Ok(BaseContract::from(abi).encode(name, args)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundler::GasEstimates;
    use crate::multisend::decode_multi_send;
    use crate::paymaster::VerifyingPaymaster;
    use crate::provider::{FeeData, MockAccountProvider};
    use mockall::predicate::eq;
    use serde_json::json;

    const OWNER: Address = H160([0xaa; 20]);
    const ENTRY_POINT: Address = H160([0xe4; 20]);
    const FACTORY: Address = H160([0xfa; 20]);
    const SENDER: Address = H160([0xbe; 20]);

    fn config() -> KernelConfig {
        KernelConfig::new(OWNER, ENTRY_POINT, FACTORY)
    }

    fn resolving_provider() -> MockAccountProvider {
        let mut provider = MockAccountProvider::new();
        let expected_init_code = factory_init_code(FACTORY, OWNER, U256::zero()).unwrap();
        provider
            .expect_get_sender_address()
            .with(eq(ENTRY_POINT), eq(expected_init_code))
            .times(1)
            .returning(|_, _| SenderAddressOutcome::Predicted(SENDER));
        provider.expect_chain_id().times(1).returning(|| Ok(1));
        provider
    }

    fn decode_execute(call_data: &Bytes) -> (Address, U256, Bytes, u8) {
        let abi = AbiParser::default()
            .parse(&["function executeAndRevert(address to, uint256 value, bytes data, uint8 operation)"])
            .unwrap();
        BaseContract::from(abi)
            .decode("executeAndRevert", call_data)
            .unwrap()
    }

    #[test]
    fn init_code_is_factory_then_create_account() {
        let init_code = factory_init_code(FACTORY, OWNER, U256::zero()).unwrap();
        assert_eq!(&init_code[..20], FACTORY.as_bytes());
        assert_eq!(
            &init_code[20..24],
            &ethers::utils::id("createAccount(address,uint256)")
        );
        assert_eq!(init_code.len(), 20 + 4 + 64);
    }

    #[test]
    fn default_multi_send_address() {
        assert_eq!(
            crate::encoding::fmt_address(DEFAULT_MULTISEND_ADDRESS),
            "0x8ae01fcf7c655655ff2c6ef907b8b4718ab4ef0b"
        );
    }

    #[tokio::test]
    async fn init_resolves_counterfactual_address() {
        let account = KernelAccount::init(Arc::new(resolving_provider()), config(), None)
            .await
            .unwrap();

        assert_eq!(account.address(), SENDER);
        assert_eq!(account.chain_id(), 1);
        assert_eq!(
            account.builder().middleware_names(),
            vec!["resolve_account", "gas_price", "estimate_gas"]
        );

        let op = account.builder().get_op();
        assert_eq!(op.sender, SENDER);
        assert_eq!(op.signature, dummy_signature());
        assert!(op.paymaster_and_data.is_empty());
    }

    #[tokio::test]
    async fn init_with_paymaster_replaces_estimation() {
        let provider = Arc::new(resolving_provider());
        let pm: Arc<dyn UserOperationMiddleware> =
            Arc::new(VerifyingPaymaster::new(provider.clone(), json!({})));
        let account = KernelAccount::init(provider, config(), Some(pm)).await.unwrap();

        assert_eq!(
            account.builder().middleware_names(),
            vec!["resolve_account", "gas_price", "verifying_paymaster"]
        );
        assert_eq!(
            account.builder().get_op().paymaster_and_data,
            dummy_paymaster_and_data()
        );
    }

    #[tokio::test]
    async fn init_rejects_zero_gas_multiplier() {
        let mut config = config();
        config.gas_multiplier_bps = 0;
        let err = KernelAccount::init(Arc::new(resolving_provider()), config, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AccountError::Argument(_)));
    }

    #[tokio::test]
    async fn init_fails_when_simulation_does_not_revert() {
        let mut provider = MockAccountProvider::new();
        provider
            .expect_get_sender_address()
            .returning(|_, _| SenderAddressOutcome::Unexpected);
        provider.expect_chain_id().never();

        let err = KernelAccount::init(Arc::new(provider), config(), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AccountError::Resolution(_)));
    }

    #[tokio::test]
    async fn init_propagates_unrecognized_revert() {
        let mut provider = MockAccountProvider::new();
        provider.expect_get_sender_address().returning(|_, _| {
            SenderAddressOutcome::Opaque(anyhow::anyhow!("execution reverted: AA13 initCode failed"))
        });

        let err = KernelAccount::init(Arc::new(provider), config(), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AccountError::Rpc(_)));
        assert!(err.to_string().contains("AA13"));
    }

    #[tokio::test]
    async fn execute_encodes_execute_and_revert_call() {
        let mut account = KernelAccount::init(Arc::new(resolving_provider()), config(), None)
            .await
            .unwrap();
        let target = Address::repeat_byte(0x70);

        account
            .execute(target, U256::zero(), Bytes::from(vec![0x12, 0x34]))
            .unwrap();

        let call_data = account.builder().get_op().call_data;
        assert_eq!(
            call_data,
            encode_execute_and_revert(target, U256::zero(), Bytes::from(vec![0x12, 0x34]), 0)
                .unwrap()
        );
        assert_eq!(
            decode_execute(&call_data),
            (target, U256::zero(), Bytes::from(vec![0x12, 0x34]), 0)
        );
    }

    #[tokio::test]
    async fn execute_delegate_sets_delegate_operation() {
        let mut account = KernelAccount::init(Arc::new(resolving_provider()), config(), None)
            .await
            .unwrap();
        account
            .execute_delegate(Address::repeat_byte(0x70), U256::from(5u64), Bytes::new())
            .unwrap();

        let (_, value, _, operation) = decode_execute(&account.builder().get_op().call_data);
        assert_eq!(value, U256::from(5u64));
        assert_eq!(operation, 1);
    }

    #[tokio::test]
    async fn execute_batch_delegates_to_multi_send() {
        let mut account = KernelAccount::init(Arc::new(resolving_provider()), config(), None)
            .await
            .unwrap();
        let (a, b) = (Address::repeat_byte(0x0a), Address::repeat_byte(0x0b));
        let (d1, d2) = (Bytes::from(vec![0xd1]), Bytes::from(vec![0xd2, 0xd2]));

        account
            .execute_batch(&[a, b], &[d1.clone(), d2.clone()], &[false, true])
            .unwrap();

        let expected_calls = vec![
            MultiSendCall::call(a, d1),
            MultiSendCall::delegate(b, d2),
        ];
        let (to, value, data, operation) = decode_execute(&account.builder().get_op().call_data);
        assert_eq!(to, DEFAULT_MULTISEND_ADDRESS);
        assert_eq!(value, U256::zero());
        assert_eq!(operation, 1);
        assert_eq!(data, encode_multi_send_call(&expected_calls).unwrap());

        let abi = AbiParser::default()
            .parse(&["function multiSend(bytes transactions)"])
            .unwrap();
        let packed: Bytes = BaseContract::from(abi).decode("multiSend", &data).unwrap();
        assert_eq!(decode_multi_send(&packed).unwrap(), expected_calls);
    }

    #[tokio::test]
    async fn execute_batch_rejects_length_mismatch() {
        // Only init is primed: any further provider call would panic.
        let mut account = KernelAccount::init(Arc::new(resolving_provider()), config(), None)
            .await
            .unwrap();
        let a = Address::repeat_byte(0x0a);

        let err = account
            .execute_batch(&[a, a], &[Bytes::new()], &[false, true])
            .err()
            .unwrap();

        assert!(matches!(err, AccountError::Argument(_)));
        assert!(account.builder().get_op().call_data.is_empty());
    }

    #[tokio::test]
    async fn build_op_for_undeployed_account() {
        let mut provider = resolving_provider();
        provider
            .expect_get_code()
            .with(eq(SENDER))
            .returning(|_| Ok(Bytes::new()));
        provider.expect_get_fee_data().returning(|| {
            Ok(FeeData {
                max_fee_per_gas: U256::from(30u64),
                max_priority_fee_per_gas: U256::from(2u64),
            })
        });
        provider
            .expect_estimate_user_operation_gas()
            .withf(|op, ep| {
                *ep == ENTRY_POINT
                    && op["nonce"] == "0x0"
                    && op["initCode"] != "0x"
                    && op["paymasterAndData"] == "0x"
            })
            .returning(|_, _| {
                Ok(GasEstimates {
                    call_gas_limit: U256::from(11u64),
                    verification_gas_limit: U256::from(22u64),
                    pre_verification_gas: U256::from(33u64),
                })
            });

        let mut account = KernelAccount::init(Arc::new(provider), config(), None)
            .await
            .unwrap();
        account
            .execute(Address::repeat_byte(0x70), U256::zero(), Bytes::from(vec![0x12, 0x34]))
            .unwrap();
        let op = account.build_op().await.unwrap();

        assert_eq!(op.sender, SENDER);
        assert_eq!(op.nonce, U256::zero());
        assert_eq!(&op.init_code, account.init_code());
        assert_eq!(op.max_fee_per_gas, U256::from(30u64));
        assert_eq!(op.max_priority_fee_per_gas, U256::from(2u64));
        assert_eq!(op.call_gas_limit, U256::from(11u64));
        assert_eq!(op.verification_gas_limit, U256::from(22u64));
        assert_eq!(op.pre_verification_gas, U256::from(33u64));
        assert_eq!(op.signature.len(), 65);
        assert!(op.paymaster_and_data.is_empty());
        assert!(!op.call_data.is_empty());
    }

    #[tokio::test]
    async fn build_op_requeries_deployment_each_time() {
        let mut provider = resolving_provider();
        let mut seq = mockall::Sequence::new();
        provider
            .expect_get_code()
            .with(eq(SENDER))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Bytes::new()));
        provider
            .expect_get_code()
            .with(eq(SENDER))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Bytes::from(vec![0x60, 0x80])));
        provider
            .expect_get_account_nonce()
            .with(eq(SENDER))
            .times(1)
            .returning(|_| Ok(U256::from(7u64)));
        provider.expect_get_fee_data().times(2).returning(|| {
            Ok(FeeData {
                max_fee_per_gas: U256::from(30u64),
                max_priority_fee_per_gas: U256::from(2u64),
            })
        });
        provider
            .expect_estimate_user_operation_gas()
            .times(2)
            .returning(|_, _| {
                Ok(GasEstimates {
                    call_gas_limit: U256::from(11u64),
                    verification_gas_limit: U256::from(22u64),
                    pre_verification_gas: U256::from(33u64),
                })
            });

        let mut account = KernelAccount::init(Arc::new(provider), config(), None)
            .await
            .unwrap();
        account
            .execute(Address::repeat_byte(0x70), U256::zero(), Bytes::new())
            .unwrap();

        let first = account.build_op().await.unwrap();
        assert_eq!(first.nonce, U256::zero());
        assert_eq!(&first.init_code, account.init_code());

        let second = account.build_op().await.unwrap();
        assert_eq!(second.nonce, U256::from(7u64));
        assert!(second.init_code.is_empty());
    }

    #[tokio::test]
    async fn build_op_aborts_on_stage_failure() {
        let mut provider = resolving_provider();
        provider.expect_get_code().returning(|_| Ok(Bytes::new()));
        provider
            .expect_get_fee_data()
            .returning(|| Err(anyhow::anyhow!("rate limited")));
        provider.expect_estimate_user_operation_gas().never();

        let mut account = KernelAccount::init(Arc::new(provider), config(), None)
            .await
            .unwrap();
        let err = account.build_op().await.unwrap_err();

        assert!(matches!(err, AccountError::Pipeline { stage: "gas_price", .. }));
    }
}
