use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::{Address, Bytes};

use crate::error::AccountError;
use crate::types::{FieldValue, UserOpField, UserOperation};

/// Shared state handed to every middleware stage of one build.
#[derive(Clone, Debug)]
pub struct UserOpContext {
    pub op: UserOperation,
    pub entry_point: Address,
    pub chain_id: u64,
}

/// One stage of the build pipeline.
///
/// Stages run strictly in registration order and each one finishes before the
/// next starts, so a stage can rely on fields written by earlier ones.
#[async_trait]
pub trait UserOperationMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, ctx: &mut UserOpContext) -> anyhow::Result<()>;
}

/// Staged builder turning a partial operation into a complete one.
///
/// `build_op` borrows the builder mutably, so two builds of the same builder
/// cannot overlap; callers sharing one across tasks must serialize access.
#[derive(Default)]
pub struct UserOperationBuilder {
    defaults: BTreeMap<UserOpField, FieldValue>,
    fields: BTreeMap<UserOpField, FieldValue>,
    middleware: Vec<Arc<dyn UserOperationMiddleware>>,
}

impl UserOperationBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers default values. A field already defaulted by an earlier call
    /// keeps its first value.
    pub fn use_defaults(&mut self, values: impl IntoIterator<Item = FieldValue>) -> &mut Self {
        for value in values {
            self.defaults.entry(value.field()).or_insert(value);
        }
        self
    }

    pub fn use_middleware(&mut self, stage: Arc<dyn UserOperationMiddleware>) -> &mut Self {
        self.middleware.push(stage);
        self
    }

    /// Sets one field for the next builds, overriding any default.
    pub fn set_field(&mut self, value: FieldValue) -> &mut Self {
        self.fields.insert(value.field(), value);
        self
    }

    pub fn set_call_data(&mut self, call_data: Bytes) -> &mut Self {
        self.set_field(FieldValue::CallData(call_data))
    }

    /// Drops every explicitly set field. Defaults and stages are kept.
    pub fn reset_op(&mut self) -> &mut Self {
        self.fields.clear();
        self
    }

    pub fn middleware_names(&self) -> Vec<&'static str> {
        self.middleware.iter().map(|m| m.name()).collect()
    }

    /// The operation as it enters the first stage.
    pub fn get_op(&self) -> UserOperation {
        let mut op = UserOperation::default();
        for value in self.defaults.values().chain(self.fields.values()) {
            op.apply(value.clone());
        }
        op
    }

    /// Runs every stage in order against a fresh context and returns the
    /// finished operation. The first failing stage aborts the build and the
    /// partially processed operation is dropped.
    pub async fn build_op(
        &mut self,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<UserOperation, AccountError> {
        let mut ctx = UserOpContext {
            op: self.get_op(),
            entry_point,
            chain_id,
        };

        for stage in &self.middleware {
            tracing::debug!(stage = stage.name(), "running middleware");
            stage
                .process(&mut ctx)
                .await
                .map_err(|source| AccountError::Pipeline {
                    stage: stage.name(),
                    source,
                })?;
        }

        Ok(ctx.op)
    }
}
