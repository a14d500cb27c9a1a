use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use ethers::types::{Address, U256};
use kernel_userop::config::{load_deployment, parse_addr};
use kernel_userop::encoding::{self, parse_bytes};
use kernel_userop::{
    KernelAccount, KernelConfig, MultiSendCall, NodeClient, UserOperationMiddleware,
    VerifyingPaymaster,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "kernel-userop", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the counterfactual Kernel account address (and deployment status).
    Address(AddressArgs),

    /// Build a fully populated (unsigned) UserOperation and print it as JSON.
    Build(BuildArgs),
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Optional deployment artifact (chainId, rpc, entryPoint, factory, multiSend).
    #[arg(long)]
    deployment: Option<PathBuf>,

    /// ERC-4337 node RPC URL (serves both chain reads and bundler methods).
    #[arg(long, env = "KERNEL_USEROP_RPC_URL")]
    rpc: Option<String>,

    /// EntryPoint address.
    #[arg(long, env = "KERNEL_USEROP_ENTRYPOINT")]
    entrypoint: Option<String>,

    /// KernelFactory address.
    #[arg(long, env = "KERNEL_USEROP_FACTORY")]
    factory: Option<String>,

    /// MultiSend relay address used for batches.
    #[arg(long, env = "KERNEL_USEROP_MULTISEND")]
    multi_send: Option<String>,

    /// Account owner address.
    #[arg(long, env = "KERNEL_USEROP_OWNER")]
    owner: String,

    /// Deployment index passed to createAccount.
    #[arg(long, default_value_t = 0)]
    index: u64,

    /// Gas price multiplier in basis points (e.g. 15000 = 1.5x).
    #[arg(long, default_value_t = 10000, env = "KERNEL_USEROP_GAS_MULTIPLIER_BPS")]
    gas_multiplier_bps: u64,
}

#[derive(Args, Debug)]
struct AddressArgs {
    #[command(flatten)]
    common: CommonArgs,
}

#[derive(Args, Debug)]
struct BuildArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Call as `<to>:<data>[:delegate|:call]`. Repeat to batch through MultiSend.
    #[arg(long = "call", required = true)]
    calls: Vec<String>,

    /// Wei sent with a single call (decimal). Batched calls carry no value.
    #[arg(long)]
    value: Option<String>,

    /// Paymaster RPC URL; defaults to --rpc.
    #[arg(long, env = "KERNEL_USEROP_PAYMASTER_URL")]
    paymaster_url: Option<String>,

    /// Opaque JSON context for pm_sponsorUserOperation. Enables sponsorship.
    #[arg(long, env = "KERNEL_USEROP_PAYMASTER_CONTEXT")]
    paymaster_context: Option<String>,
}

struct Resolved {
    rpc_url: String,
    expected_chain_id: Option<u64>,
    config: KernelConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        // Logs go to stderr; stdout carries only the command result.
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.cmd {
        Command::Address(args) => cmd_address(args).await,
        Command::Build(args) => cmd_build(args).await,
    }
}

async fn cmd_address(args: AddressArgs) -> Result<()> {
    let resolved = resolve_common(&args.common)?;
    let provider = Arc::new(NodeClient::connect(&resolved.rpc_url)?);
    let account = KernelAccount::init(provider, resolved.config.clone(), None).await?;
    check_chain_id(resolved.expected_chain_id, account.chain_id())?;
    let deployed = account.is_deployed().await?;

    let out = serde_json::json!({
        "owner": encoding::fmt_address(resolved.config.owner),
        "index": resolved.config.index.to_string(),
        "smartAccount": encoding::fmt_address(account.address()),
        "entryPoint": encoding::fmt_address(account.entry_point()),
        "chainId": account.chain_id(),
        "isDeployed": deployed,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn cmd_build(args: BuildArgs) -> Result<()> {
    let resolved = resolve_common(&args.common)?;
    let calls = args
        .calls
        .iter()
        .map(|s| parse_call(s))
        .collect::<Result<Vec<_>>>()?;
    let value = args
        .value
        .as_deref()
        .map(U256::from_dec_str)
        .transpose()
        .context("invalid --value")?
        .unwrap_or_default();

    let provider = Arc::new(NodeClient::connect(&resolved.rpc_url)?);

    let paymaster: Option<Arc<dyn UserOperationMiddleware>> = match &args.paymaster_context {
        Some(raw) => {
            let context: serde_json::Value =
                serde_json::from_str(raw).context("--paymaster-context must be JSON")?;
            let url = args.paymaster_url.as_deref().unwrap_or(&resolved.rpc_url);
            let pm_provider = Arc::new(NodeClient::connect(url)?);
            Some(Arc::new(VerifyingPaymaster::new(pm_provider, context)))
        }
        None => None,
    };

    let mut account = KernelAccount::init(provider, resolved.config, paymaster).await?;
    check_chain_id(resolved.expected_chain_id, account.chain_id())?;

    match calls.as_slice() {
        [single] if !single.delegate_call => {
            account.execute(single.to, value, single.data.clone())?;
        }
        [single] => {
            account.execute_delegate(single.to, value, single.data.clone())?;
        }
        batch => {
            if !value.is_zero() {
                return Err(anyhow!("--value is only supported for a single --call"));
            }
            let to: Vec<Address> = batch.iter().map(|c| c.to).collect();
            let data: Vec<_> = batch.iter().map(|c| c.data.clone()).collect();
            let delegate: Vec<bool> = batch.iter().map(|c| c.delegate_call).collect();
            account.execute_batch(&to, &data, &delegate)?;
        }
    }

    let op = account.build_op().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&encoding::user_op_to_json(&op))?
    );
    Ok(())
}

fn resolve_common(common: &CommonArgs) -> Result<Resolved> {
    let deployment = common
        .deployment
        .as_ref()
        .map(|path| load_deployment(path, common.rpc.clone()))
        .transpose()?;

    let rpc_url = match (&deployment, &common.rpc) {
        (Some(dep), _) => dep.rpc_url.clone(),
        (None, Some(rpc)) => rpc.clone(),
        (None, None) => return Err(anyhow!("missing --rpc (or KERNEL_USEROP_RPC_URL)")),
    };

    let entry_point = match (&common.entrypoint, &deployment) {
        (Some(s), _) => parse_addr(s).context("invalid --entrypoint address")?,
        (None, Some(dep)) => dep.entry_point,
        (None, None) => return Err(anyhow!("missing --entrypoint (or KERNEL_USEROP_ENTRYPOINT)")),
    };

    let factory = match (&common.factory, &deployment) {
        (Some(s), _) => parse_addr(s).context("invalid --factory address")?,
        (None, Some(dep)) => dep.factory,
        (None, None) => return Err(anyhow!("missing --factory (or KERNEL_USEROP_FACTORY)")),
    };

    let owner = parse_addr(&common.owner).context("invalid --owner address")?;

    let mut config = KernelConfig::new(owner, entry_point, factory);
    config.index = U256::from(common.index);
    config.gas_multiplier_bps = common.gas_multiplier_bps;
    if let Some(s) = &common.multi_send {
        config.multi_send = parse_addr(s).context("invalid --multi-send address")?;
    } else if let Some(addr) = deployment.as_ref().and_then(|d| d.multi_send) {
        config.multi_send = addr;
    }

    Ok(Resolved {
        rpc_url,
        expected_chain_id: deployment.map(|d| d.chain_id),
        config,
    })
}

fn check_chain_id(expected: Option<u64>, actual: u64) -> Result<()> {
    match expected {
        Some(expected) if expected != actual => Err(anyhow!(
            "chainId mismatch: deployment has {}, RPC returned {}",
            expected,
            actual
        )),
        _ => Ok(()),
    }
}

/// Parses `<to>:<data>[:delegate|:call]`.
fn parse_call(s: &str) -> Result<MultiSendCall> {
    let mut parts = s.split(':');
    let to = parts.next().unwrap_or_default();
    let data = parse_bytes(parts.next().unwrap_or("0x")).context("invalid call data")?;
    let delegate_call = match parts.next() {
        None | Some("call") => false,
        Some("delegate") => true,
        Some(other) => return Err(anyhow!("unknown call kind `{other}` in {s}")),
    };
    if parts.next().is_some() {
        return Err(anyhow!("too many `:` segments in call {s}"));
    }
    Ok(MultiSendCall::parse(to, data, None, delegate_call)?)
}
