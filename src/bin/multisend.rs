use alloy_primitives::Address;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use token_desk::batch::{BatchRequest, ReadBatcher};
use token_desk::config::Config;
use token_desk::contracts::IERC20;
use token_desk::orchestrator::{TransferError, TransferOrchestrator};
use token_desk::report::commands::{DistributionInput, cmd_preview, cmd_send};
use token_desk::report::formatters::OutputFormat;
use token_desk::rpc::RpcClient;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "multisend")]
#[command(
    about = "Distribute an ERC-20 token to many recipients in one transaction",
    long_about = None
)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse the recipient list and compare gas against separate transfers
    Preview {
        token: String,
        /// One `<address> <amount>` per line
        recipients: PathBuf,
        /// Token decimals, read from the token when omitted
        #[arg(long)]
        decimals: Option<u8>,
    },
    /// Approve if needed, then send the batch transfer
    Send {
        token: String,
        recipients: PathBuf,
        #[arg(long)]
        decimals: Option<u8>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        match e.downcast_ref::<TransferError>() {
            Some(transfer) => error!("{:?} error: {:#}", transfer.category(), e),
            None => error!("{:#}", e),
        }
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let format = OutputFormat::from(cli.format.as_str());
    let config = Config::from_env()?;
    let spender = config.require_multisend()?;

    let client = Arc::new(RpcClient::from_config(&config)?);
    let batcher = Arc::new(ReadBatcher::new().with_source(client.clone()));

    match cli.command {
        Commands::Preview {
            token,
            recipients,
            decimals,
        } => {
            let token = parse_token(&token)?;
            let decimals = resolve_decimals(&batcher, config.chain_id, token, decimals).await?;
            let text = read_recipients(&recipients)?;
            let input = DistributionInput {
                text: &text,
                token,
                decimals,
                spender,
            };
            cmd_preview(client, input, &format).await?;
        }
        Commands::Send {
            token,
            recipients,
            decimals,
        } => {
            let token = parse_token(&token)?;
            let decimals = resolve_decimals(&batcher, config.chain_id, token, decimals).await?;
            let text = read_recipients(&recipients)?;
            let input = DistributionInput {
                text: &text,
                token,
                decimals,
                spender,
            };
            let orchestrator = TransferOrchestrator::new(batcher, client, config.chain_id)
                .with_policy(config.confirmations);
            cmd_send(orchestrator, input, &format).await?;
        }
    }

    Ok(())
}

fn parse_token(raw: &str) -> Result<Address> {
    Address::from_str(raw).with_context(|| format!("Invalid token address: {raw}"))
}

fn read_recipients(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read recipients from {}", path.display()))
}

async fn resolve_decimals(
    batcher: &ReadBatcher,
    chain_id: u64,
    token: Address,
    decimals: Option<u8>,
) -> Result<u8> {
    if let Some(decimals) = decimals {
        return Ok(decimals);
    }

    let mut request = BatchRequest::new();
    let slot = request.add(token, IERC20::decimalsCall {});
    let decimals = batcher
        .execute(chain_id, &request)
        .await?
        .into_response()
        .and_then(|response| response.decode(&slot))
        .with_context(|| format!("No decimals for {token:?}, pass --decimals"))?;
    info!("Token {:?} uses {} decimals", token, decimals);
    Ok(decimals)
}
