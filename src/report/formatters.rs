use crate::gas::GasComparison;
use crate::liquidity::PositionPage;
use crate::orchestrator::TransferState;
use crate::portfolio::{LendingPosition, PortfolioSummary, Valuation};
use crate::recipients::Distribution;
use alloy_primitives::utils::format_units;
use alloy_primitives::{Address, U256};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use rust_decimal::Decimal;
use serde_json::json;

#[derive(Debug, Clone)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn csv_string(wtr: Writer<Vec<u8>>) -> String {
    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

fn units(value: U256, decimals: u8) -> String {
    format_units(value, decimals).unwrap_or_else(|_| value.to_string())
}

pub fn format_holdings(valuation: &Valuation, format: &OutputFormat) -> String {
    let tokens = valuation.tokens();
    match format {
        OutputFormat::Table => {
            if matches!(valuation, Valuation::Disabled) {
                return "No account connected.".to_string();
            }
            if tokens.is_empty() {
                return "No holdings found.".to_string();
            }
            let mut table = table(vec![
                "Token",
                "Symbol",
                "Balance",
                "Price (USD)",
                "Value (USD)",
            ]);
            for priced in tokens {
                let token = &priced.balance.token;
                table.add_row(vec![
                    Cell::new(short_address(&token.address)),
                    Cell::new(&token.symbol),
                    Cell::new(units(priced.balance.raw_balance, token.decimals)),
                    Cell::new(priced.usd_unit_price.round_dp(6)),
                    Cell::new(priced.usd_balance.round_dp(2)),
                ]);
            }
            table.add_row(vec![
                Cell::new("Total"),
                Cell::new(""),
                Cell::new(""),
                Cell::new(""),
                Cell::new(valuation.total_usd().round_dp(2)),
            ]);
            table.to_string()
        }
        OutputFormat::Json => {
            let json_tokens: Vec<_> = tokens
                .iter()
                .map(|priced| {
                    let token = &priced.balance.token;
                    json!({
                        "address": token.address,
                        "name": token.name,
                        "symbol": token.symbol,
                        "decimals": token.decimals,
                        "balance": units(priced.balance.raw_balance, token.decimals),
                        "balance_raw": priced.balance.raw_balance.to_string(),
                        "usd_unit_price": priced.usd_unit_price.to_string(),
                        "usd_balance": priced.usd_balance.to_string(),
                    })
                })
                .collect();
            serde_json::to_string_pretty(&json!({
                "tokens": json_tokens,
                "total_usd": valuation.total_usd().to_string(),
            }))
            .unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record([
                "address",
                "symbol",
                "balance",
                "balance_raw",
                "usd_unit_price",
                "usd_balance",
            ]);
            for priced in tokens {
                let token = &priced.balance.token;
                let _ = wtr.write_record([
                    &format!("{:?}", token.address),
                    &token.symbol,
                    &units(priced.balance.raw_balance, token.decimals),
                    &priced.balance.raw_balance.to_string(),
                    &priced.usd_unit_price.to_string(),
                    &priced.usd_balance.to_string(),
                ]);
            }
            csv_string(wtr)
        }
    }
}

pub fn format_lending(positions: &[LendingPosition], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if positions.is_empty() {
                return "No lending positions.".to_string();
            }
            let mut table = table(vec!["Market", "Asset", "Balance", "Value (USD)", "APY"]);
            for position in positions {
                let apy = (position.apy * Decimal::ONE_HUNDRED).round_dp(2);
                table.add_row(vec![
                    Cell::new(&position.market),
                    Cell::new(&position.asset_symbol),
                    Cell::new(position.balance),
                    Cell::new(position.usd_value.round_dp(2)),
                    Cell::new(format!("{apy}%")),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            serde_json::to_string_pretty(positions).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["market", "asset", "balance", "usd_value", "apy"]);
            for position in positions {
                let _ = wtr.write_record([
                    &position.market,
                    &position.asset_symbol,
                    &position.balance.to_string(),
                    &position.usd_value.to_string(),
                    &position.apy.to_string(),
                ]);
            }
            csv_string(wtr)
        }
    }
}

pub fn format_summary(summary: &PortfolioSummary, format: &OutputFormat) -> String {
    let rows = [
        ("Tokens (USD)", "tokens_usd", summary.tokens_usd),
        ("Lending (USD)", "lending_usd", summary.lending_usd),
        ("Total (USD)", "total_usd", summary.total_usd),
    ];
    match format {
        OutputFormat::Table => {
            let mut table = table(vec!["Metric", "Value"]);
            for (label, _, value) in rows {
                table.add_row(vec![Cell::new(label), Cell::new(value.round_dp(2))]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            serde_json::to_string_pretty(summary).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["metric", "value"]);
            for (_, key, value) in rows {
                let _ = wtr.write_record([key, &value.to_string()]);
            }
            csv_string(wtr)
        }
    }
}

pub fn format_distribution(
    distribution: &Distribution,
    decimals: u8,
    format: &OutputFormat,
) -> String {
    match format {
        OutputFormat::Table => {
            let mut table = table(vec!["#", "Recipient", "Amount", "Amount (base units)"]);
            for (i, instruction) in distribution.instructions().iter().enumerate() {
                table.add_row(vec![
                    Cell::new(i + 1),
                    Cell::new(instruction.address.to_checksum(None)),
                    Cell::new(units(instruction.amount, decimals)),
                    Cell::new(instruction.amount.to_string()),
                ]);
            }
            table.add_row(vec![
                Cell::new("Total"),
                Cell::new(format!("{} recipients", distribution.len())),
                Cell::new(units(distribution.total(), decimals)),
                Cell::new(distribution.total().to_string()),
            ]);
            table.to_string()
        }
        OutputFormat::Json => {
            let recipients: Vec<_> = distribution
                .instructions()
                .iter()
                .map(|i| {
                    json!({
                        "address": i.address,
                        "amount": units(i.amount, decimals),
                        "amount_raw": i.amount.to_string(),
                    })
                })
                .collect();
            serde_json::to_string_pretty(&json!({
                "recipients": recipients,
                "total": units(distribution.total(), decimals),
                "total_raw": distribution.total().to_string(),
            }))
            .unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["address", "amount", "amount_raw"]);
            for instruction in distribution.instructions() {
                let _ = wtr.write_record([
                    &instruction.address.to_checksum(None),
                    &units(instruction.amount, decimals),
                    &instruction.amount.to_string(),
                ]);
            }
            csv_string(wtr)
        }
    }
}

pub fn format_gas(comparison: Option<&GasComparison>, format: &OutputFormat) -> String {
    let Some(comparison) = comparison else {
        return match format {
            OutputFormat::Json => "null".to_string(),
            _ => "Gas estimate unavailable.".to_string(),
        };
    };
    match format {
        OutputFormat::Table => {
            let mut table = table(vec!["Metric", "Gas"]);
            table.add_row(vec![
                Cell::new("Batched transfer"),
                Cell::new(comparison.batched),
            ]);
            table.add_row(vec![
                Cell::new("Single transfer"),
                Cell::new(comparison.single_transfer),
            ]);
            table.add_row(vec![
                Cell::new(format!("{} separate transfers", comparison.recipients)),
                Cell::new(comparison.separate_total()),
            ]);
            table.add_row(vec![
                Cell::new("Savings"),
                Cell::new(format!(
                    "{} ({:.1}%)",
                    comparison.savings(),
                    comparison.savings_percent()
                )),
            ]);
            table.to_string()
        }
        OutputFormat::Json => serde_json::to_string_pretty(&json!({
            "recipients": comparison.recipients,
            "batched": comparison.batched,
            "single_transfer": comparison.single_transfer,
            "separate_total": comparison.separate_total(),
            "savings": comparison.savings().to_string(),
        }))
        .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record([
                "recipients",
                "batched",
                "single_transfer",
                "separate_total",
                "savings",
            ]);
            let _ = wtr.write_record([
                comparison.recipients.to_string(),
                comparison.batched.to_string(),
                comparison.single_transfer.to_string(),
                comparison.separate_total().to_string(),
                comparison.savings().to_string(),
            ]);
            csv_string(wtr)
        }
    }
}

pub fn format_positions(page: &PositionPage, format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if page.positions.is_empty() {
                return format!(
                    "No positions on page {} of {}.",
                    page.page,
                    page.page_count().max(1)
                );
            }
            let mut table = table(vec![
                "Token ID",
                "Pair",
                "Ticks",
                "Liquidity",
                "Owed 0",
                "Owed 1",
            ]);
            for position in &page.positions {
                table.add_row(vec![
                    Cell::new(position.token_id),
                    Cell::new(format!(
                        "{} / {}",
                        short_address(&position.token0),
                        short_address(&position.token1)
                    )),
                    Cell::new(format!(
                        "[{}, {}]",
                        position.tick_lower, position.tick_upper
                    )),
                    Cell::new(position.liquidity),
                    Cell::new(position.tokens_owed0),
                    Cell::new(position.tokens_owed1),
                ]);
            }
            format!(
                "{}\nPage {} of {} ({} positions)",
                table,
                page.page,
                page.page_count(),
                page.total
            )
        }
        OutputFormat::Json => {
            serde_json::to_string_pretty(page).unwrap_or_else(|_| "{}".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record([
                "token_id",
                "token0",
                "token1",
                "tick_lower",
                "tick_upper",
                "liquidity",
                "fee_growth_inside0_last_x128",
                "fee_growth_inside1_last_x128",
                "tokens_owed0",
                "tokens_owed1",
            ]);
            for p in &page.positions {
                let _ = wtr.write_record([
                    p.token_id.to_string(),
                    format!("{:?}", p.token0),
                    format!("{:?}", p.token1),
                    p.tick_lower.to_string(),
                    p.tick_upper.to_string(),
                    p.liquidity.to_string(),
                    p.fee_growth_inside0_last_x128.to_string(),
                    p.fee_growth_inside1_last_x128.to_string(),
                    p.tokens_owed0.to_string(),
                    p.tokens_owed1.to_string(),
                ]);
            }
            csv_string(wtr)
        }
    }
}

/// One progress line per orchestrator state.
pub fn format_transfer_state(state: &TransferState) -> String {
    match state {
        TransferState::Idle => "Idle".to_string(),
        TransferState::AllowanceChecked {
            allowance,
            required,
        } => format!(
            "Allowance checked: {} available, {} required",
            allowance, required
        ),
        TransferState::Approving { tx_hash: None } => "Approving: waiting for wallet".to_string(),
        TransferState::Approving { tx_hash: Some(tx) } => format!(
            "Approving: {} awaiting confirmation",
            short_hash(&format!("{tx:?}"))
        ),
        TransferState::Approved { tx_hash: None } => {
            "Approved: existing allowance suffices".to_string()
        }
        TransferState::Approved { tx_hash: Some(tx) } => {
            format!("Approved in {}", short_hash(&format!("{tx:?}")))
        }
        TransferState::Sending => "Sending batch transfer".to_string(),
        TransferState::Confirming { tx_hash } => {
            format!("Confirming: {}", short_hash(&format!("{tx_hash:?}")))
        }
        TransferState::Confirmed {
            tx_hash,
            block_number,
        } => format!(
            "Confirmed: {:?} in block {}",
            tx_hash,
            block_number.map_or("N/A".to_string(), |b| b.to_string())
        ),
        TransferState::Errored { message } => format!("Failed: {message}"),
    }
}

pub fn short_address(address: &Address) -> String {
    short_hash(&address.to_checksum(None))
}

/// `0x1234...abcd` for anything long enough to shorten.
pub fn short_hash(hash: &str) -> String {
    if hash.len() <= 10 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::PricedToken;
    use crate::recipients::RecipientParser;
    use crate::tokens::{TokenBalance, TokenDescriptor};
    use alloy_primitives::address;
    use rust_decimal::Decimal;

    fn valuation() -> Valuation {
        Valuation::Priced(vec![PricedToken {
            balance: TokenBalance {
                token: TokenDescriptor {
                    address: address!("0x1111111111111111111111111111111111111111"),
                    decimals: 6,
                    name: "USD Coin".to_string(),
                    symbol: "USDC".to_string(),
                },
                raw_balance: U256::from(2_500_000u64),
                owner: Address::ZERO,
            },
            usd_unit_price: Decimal::ONE,
            usd_balance: Decimal::new(25, 1),
        }])
    }

    #[test]
    fn test_output_format_parsing() {
        assert!(matches!(OutputFormat::from("JSON"), OutputFormat::Json));
        assert!(matches!(OutputFormat::from("csv"), OutputFormat::Csv));
        assert!(matches!(OutputFormat::from("other"), OutputFormat::Table));
    }

    #[test]
    fn test_short_forms() {
        assert_eq!(
            short_address(&address!("0x0C149FbbBE49baB59B1d1d0749f4109F02a46F77")),
            "0x0C14...6F77"
        );
        assert_eq!(short_hash("0x12"), "0x12");
    }

    #[test]
    fn test_holdings_csv() {
        let csv = format_holdings(&valuation(), &OutputFormat::Csv);
        let lines: Vec<_> = csv.lines().collect();

        assert_eq!(
            lines[0],
            "address,symbol,balance,balance_raw,usd_unit_price,usd_balance"
        );
        assert_eq!(
            lines[1],
            "0x1111111111111111111111111111111111111111,USDC,2.500000,2500000,1,2.5"
        );
    }

    #[test]
    fn test_holdings_json_total() {
        let json: serde_json::Value =
            serde_json::from_str(&format_holdings(&valuation(), &OutputFormat::Json)).unwrap();

        assert_eq!(json["total_usd"], "2.5");
        assert_eq!(json["tokens"][0]["symbol"], "USDC");
    }

    #[test]
    fn test_disabled_holdings_table() {
        assert_eq!(
            format_holdings(&Valuation::Disabled, &OutputFormat::Table),
            "No account connected."
        );
    }

    #[test]
    fn test_distribution_table_lists_total() {
        let recipient = "0x4186A3B76843Ab221c4d4dE1f9C83623C2db9D90";
        let distribution = RecipientParser::new(18)
            .parse(&format!("{recipient} 1.5"))
            .unwrap();

        let table = format_distribution(&distribution, 18, &OutputFormat::Table);

        assert!(table.contains(recipient));
        assert!(table.contains("1 recipients"));
        assert!(table.contains("1500000000000000000"));
    }

    #[test]
    fn test_missing_gas_estimate() {
        assert_eq!(
            format_gas(None, &OutputFormat::Table),
            "Gas estimate unavailable."
        );
    }

    #[test]
    fn test_transfer_state_lines() {
        assert_eq!(
            format_transfer_state(&TransferState::Approved { tx_hash: None }),
            "Approved: existing allowance suffices"
        );
        assert_eq!(
            format_transfer_state(&TransferState::Errored {
                message: "Insufficient balance".to_string()
            }),
            "Failed: Insufficient balance"
        );
    }
}
