use alloy_primitives::{Address, address};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use token_desk::batch::ReadBatcher;
use token_desk::config::Config;
use token_desk::liquidity::LiquidityReader;
use token_desk::portfolio::{JsonPositionFeed, Portfolio, PositionFeed, TrackedToken};
use token_desk::pricing::PriceOracle;
use token_desk::report::commands::{cmd_holdings, cmd_positions};
use token_desk::report::formatters::OutputFormat;
use token_desk::rpc::RpcClient;
use token_desk::tokens::{DescriptorCache, TokenDescriptor};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const UNISWAP_V3_POSITION_MANAGER: Address = address!("0xC36442b4a4522E871399CD717aBDD847Ab11FE88");

#[derive(Parser)]
#[command(name = "portfolio")]
#[command(about = "Value ERC-20 holdings and list liquidity positions", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "table")]
    format: String,

    /// Account to inspect, defaults to the PRIVATE_KEY account
    #[arg(long)]
    owner: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Holdings {
        /// Extra token:pair entries on top of TRACKED_TOKENS
        #[arg(long)]
        track: Vec<String>,

        /// Lending positions exported as a JSON array
        #[arg(long)]
        lending: Option<PathBuf>,

        /// USD price of the quote asset, overrides QUOTE_USD_PRICE
        #[arg(long)]
        quote_price: Option<String>,
    },
    Positions {
        #[arg(default_value = "1")]
        page: u64,

        #[arg(long)]
        manager: Option<String>,
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
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let format = OutputFormat::from(cli.format.as_str());
    let config = Config::from_env()?;
    info!(
        "RPC URLs: {} endpoint(s) configured",
        config.json_rpc_urls.len()
    );

    let owner = cli
        .owner
        .as_deref()
        .map(parse_owner)
        .transpose()?
        .or_else(|| config.account())
        .context("Pass --owner or set PRIVATE_KEY in .env")?;

    let client = Arc::new(RpcClient::from_config(&config)?);
    let block = client.get_latest_block().await?;
    info!("Connected to chain {} at block {}", config.chain_id, block);
    let batcher = Arc::new(ReadBatcher::new().with_source(client));

    match cli.command {
        Commands::Holdings {
            track,
            lending,
            quote_price,
        } => {
            let quote_usd_price = match quote_price {
                Some(raw) => Decimal::from_str(&raw).context("Invalid --quote-price")?,
                None => config.require_quote_usd_price()?,
            };
            let quote = TokenDescriptor {
                address: config.quote_token_address,
                decimals: config.quote_token_decimals,
                name: "Quote asset".to_string(),
                symbol: "QUOTE".to_string(),
            };

            let mut tracked = config.tracked_tokens.clone();
            for entry in &track {
                let token = TrackedToken::from_str(entry)
                    .with_context(|| format!("Invalid --track entry: {entry}"))?;
                tracked.push(token);
            }

            let portfolio = Arc::new(Portfolio::new(
                batcher,
                DescriptorCache::new(),
                PriceOracle::new(quote, quote_usd_price),
                config.chain_id,
            ));
            let feed = lending.map(JsonPositionFeed::new);
            cmd_holdings(
                portfolio,
                feed.as_ref().map(|f| f as &dyn PositionFeed),
                owner,
                tracked,
                &format,
            )
            .await?;
        }
        Commands::Positions { page, manager } => {
            let manager = match manager {
                Some(raw) => Address::from_str(&raw).context("Invalid --manager address")?,
                None => UNISWAP_V3_POSITION_MANAGER,
            };
            let reader = LiquidityReader::new(batcher, config.chain_id, manager);
            cmd_positions(&reader, owner, page, &format).await?;
        }
    }

    Ok(())
}

fn parse_owner(raw: &str) -> Result<Address> {
    Address::from_str(raw).with_context(|| format!("Invalid owner address: {raw}"))
}
