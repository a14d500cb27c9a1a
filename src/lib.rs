//! Builds ERC-4337 UserOperations for Kernel smart accounts.
//!
//! [`KernelAccount`] resolves the account's counterfactual address through the
//! entry point, then drives a [`UserOperationBuilder`] whose middleware stages
//! fill nonce, init code, fees, gas limits and optional paymaster data.
//! Batched calls are packed for the MultiSend relay by [`encode_multi_send`].

pub mod builder;
pub mod bundler;
pub mod config;
pub mod encoding;
pub mod error;
pub mod kernel;
pub mod middleware;
pub mod multisend;
pub mod paymaster;
pub mod provider;
pub mod types;

pub use builder::{UserOpContext, UserOperationBuilder, UserOperationMiddleware};
pub use error::AccountError;
pub use kernel::{KernelAccount, KernelConfig, DEFAULT_MULTISEND_ADDRESS};
pub use multisend::{decode_multi_send, encode_multi_send};
pub use paymaster::VerifyingPaymaster;
pub use provider::{AccountProvider, NodeClient, SenderAddressOutcome};
pub use types::{FieldValue, MultiSendCall, UserOpField, UserOperation};
