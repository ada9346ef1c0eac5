use crate::contracts::{MAINNET_WETH, MULTICALL3_ADDRESS};
use crate::orchestrator::{APPROVAL_CONFIRMATIONS, ConfirmationPolicy, TRANSFER_CONFIRMATIONS};
use crate::portfolio::TrackedToken;
use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub json_rpc_urls: Vec<String>,
    pub chain_id: u64,
    pub multicall_address: Address,
    pub multisend_address: Option<Address>,
    pub quote_token_address: Address,
    pub quote_token_decimals: u8,
    pub quote_usd_price: Option<Decimal>,
    pub signer: Option<PrivateKeySigner>,
    pub confirmations: ConfirmationPolicy,
    pub tracked_tokens: Vec<TrackedToken>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from any variable source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let urls = var("JSON_RPC_URLS")
            .or_else(|| var("JSON_RPC_URL"))
            .context("JSON_RPC_URLS (or JSON_RPC_URL) must be set in .env")?;
        let json_rpc_urls = split_list(&urls).map(str::to_string).collect();

        let chain_id: u64 = match var("CHAIN_ID") {
            Some(raw) => raw.trim().parse().context("Invalid CHAIN_ID format")?,
            None => 1,
        };

        let multicall_address = match var("MULTICALL_ADDRESS") {
            Some(raw) => parse_address(&raw).context("Invalid MULTICALL_ADDRESS format")?,
            None => MULTICALL3_ADDRESS,
        };

        let multisend_address = var("MULTISEND_ADDRESS")
            .map(|raw| parse_address(&raw).context("Invalid MULTISEND_ADDRESS format"))
            .transpose()?;

        let quote_token_address = match var("QUOTE_TOKEN_ADDRESS") {
            Some(raw) => parse_address(&raw).context("Invalid QUOTE_TOKEN_ADDRESS format")?,
            None => MAINNET_WETH,
        };

        let quote_token_decimals: u8 = match var("QUOTE_TOKEN_DECIMALS") {
            Some(raw) => raw
                .trim()
                .parse()
                .context("Invalid QUOTE_TOKEN_DECIMALS format")?,
            None => 18,
        };

        let quote_usd_price = var("QUOTE_USD_PRICE")
            .map(|raw| Decimal::from_str(raw.trim()).context("Invalid QUOTE_USD_PRICE format"))
            .transpose()?;

        let signer = var("PRIVATE_KEY")
            .map(|raw| PrivateKeySigner::from_str(raw.trim()).context("Invalid PRIVATE_KEY format"))
            .transpose()?;

        let approval: u64 = match var("APPROVAL_CONFIRMATIONS") {
            Some(raw) => raw
                .trim()
                .parse()
                .context("Invalid APPROVAL_CONFIRMATIONS format")?,
            None => APPROVAL_CONFIRMATIONS,
        };
        let transfer: u64 = match var("TRANSFER_CONFIRMATIONS") {
            Some(raw) => raw
                .trim()
                .parse()
                .context("Invalid TRANSFER_CONFIRMATIONS format")?,
            None => TRANSFER_CONFIRMATIONS,
        };
        let timeout = var("CONFIRMATION_TIMEOUT_SECS")
            .map(|raw| {
                raw.trim()
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .context("Invalid CONFIRMATION_TIMEOUT_SECS format")
            })
            .transpose()?;

        let tracked_tokens = match var("TRACKED_TOKENS") {
            Some(raw) => split_list(&raw)
                .map(TrackedToken::from_str)
                .collect::<Result<Vec<_>, _>>()
                .context("Invalid TRACKED_TOKENS format, expected token:pair,...")?,
            None => Vec::new(),
        };

        Ok(Config {
            json_rpc_urls,
            chain_id,
            multicall_address,
            multisend_address,
            quote_token_address,
            quote_token_decimals,
            quote_usd_price,
            signer,
            confirmations: ConfirmationPolicy {
                approval,
                transfer,
                timeout,
            },
            tracked_tokens,
        })
    }

    pub fn account(&self) -> Option<Address> {
        self.signer.as_ref().map(PrivateKeySigner::address)
    }

    pub fn require_multisend(&self) -> Result<Address> {
        self.multisend_address
            .context("MULTISEND_ADDRESS must be set in .env")
    }

    pub fn require_quote_usd_price(&self) -> Result<Decimal> {
        self.quote_usd_price
            .context("QUOTE_USD_PRICE must be set in .env")
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
}

fn parse_address(raw: &str) -> Result<Address> {
    Ok(Address::from_str(raw.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("JSON_RPC_URL", "http://localhost:8545")]).unwrap();

        assert_eq!(
            config.json_rpc_urls,
            vec!["http://localhost:8545".to_string()]
        );
        assert_eq!(config.chain_id, 1);
        assert_eq!(config.multicall_address, MULTICALL3_ADDRESS);
        assert_eq!(config.quote_token_address, MAINNET_WETH);
        assert_eq!(config.quote_token_decimals, 18);
        assert_eq!(config.confirmations, ConfirmationPolicy::default());
        assert!(config.signer.is_none());
        assert!(config.tracked_tokens.is_empty());
        assert!(config.require_multisend().is_err());
    }

    #[test]
    fn test_url_list_takes_precedence() {
        let config = config(&[
            ("JSON_RPC_URLS", "http://a:8545, http://b:8545,"),
            ("JSON_RPC_URL", "http://ignored:8545"),
        ])
        .unwrap();

        assert_eq!(config.json_rpc_urls, vec!["http://a:8545", "http://b:8545"]);
    }

    #[test]
    fn test_missing_url_is_an_error() {
        let err = config(&[("CHAIN_ID", "5")]).unwrap_err();
        assert!(err.to_string().contains("JSON_RPC_URLS"));
    }

    #[test]
    fn test_invalid_value_names_the_variable() {
        let err =
            config(&[("JSON_RPC_URL", "http://x"), ("MULTISEND_ADDRESS", "0x12")]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid MULTISEND_ADDRESS format");
    }

    #[test]
    fn test_full_configuration() {
        let config = config(&[
            ("JSON_RPC_URL", "http://x"),
            ("CHAIN_ID", "421614"),
            (
                "MULTISEND_ADDRESS",
                "0x0C149FbbBE49baB59B1d1d0749f4109F02a46F77",
            ),
            ("QUOTE_USD_PRICE", "3000.25"),
            (
                "PRIVATE_KEY",
                "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            ),
            ("TRANSFER_CONFIRMATIONS", "5"),
            ("CONFIRMATION_TIMEOUT_SECS", "600"),
            (
                "TRACKED_TOKENS",
                concat!(
                    "0x1111111111111111111111111111111111111111:",
                    "0x2222222222222222222222222222222222222222"
                ),
            ),
        ])
        .unwrap();

        assert_eq!(config.chain_id, 421614);
        assert_eq!(
            config.require_multisend().unwrap(),
            address!("0x0C149FbbBE49baB59B1d1d0749f4109F02a46F77")
        );
        assert_eq!(
            config.require_quote_usd_price().unwrap(),
            Decimal::new(300025, 2)
        );
        assert_eq!(
            config.account(),
            Some(address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"))
        );
        assert_eq!(config.confirmations.approval, 1);
        assert_eq!(config.confirmations.transfer, 5);
        assert_eq!(config.confirmations.timeout, Some(Duration::from_secs(600)));
        assert_eq!(
            config.tracked_tokens,
            vec![TrackedToken {
                token: address!("0x1111111111111111111111111111111111111111"),
                pair: address!("0x2222222222222222222222222222222222222222"),
            }]
        );
    }
}
