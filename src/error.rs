use thiserror::Error;

#[derive(Error, Debug)]
pub enum AccountError {
    /// Counterfactual address prediction failed. Fatal for account init.
    #[error("address resolution failed: {0}")]
    Resolution(String),

    #[error("batch encoding failed: {0}")]
    Encoding(String),

    #[error("invalid arguments: {0}")]
    Argument(String),

    /// A middleware stage failed; the build was aborted and its operation discarded.
    #[error("middleware `{stage}` failed: {source:#}")]
    Pipeline {
        stage: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Rpc(#[from] anyhow::Error),
}
