use crate::gas::spawn_gas_comparison;
use crate::liquidity::LiquidityReader;
use crate::orchestrator::{
    TransferError, TransferOrchestrator, TransferRequest, TransferState, WriteSource,
};
use crate::portfolio::{Portfolio, PortfolioSummary, PositionFeed, TrackedToken, Valuation};
use crate::recipients::RecipientParser;
use crate::report::formatters::{
    OutputFormat, format_distribution, format_gas, format_holdings, format_lending,
    format_positions, format_summary, format_transfer_state,
};
use alloy_primitives::Address;
use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub async fn cmd_holdings(
    portfolio: Arc<Portfolio>,
    feed: Option<&dyn PositionFeed>,
    owner: Address,
    tracked: Vec<TrackedToken>,
    format: &OutputFormat,
) -> Result<()> {
    if tracked.is_empty() {
        return Err(anyhow!(
            "No tokens to value, set TRACKED_TOKENS or pass --track"
        ));
    }

    let valuation = portfolio.spawn_valuation(Some(owner), tracked);
    let lending = async {
        match feed {
            Some(feed) => feed.positions(owner).await.map(Some),
            None => Ok(None),
        }
    };
    let (valuation, lending) = futures::future::join(valuation.wait(), lending).await;

    let valuation = valuation.context("Valuation failed, see log for details")?;
    println!("{}", format_holdings(&valuation, format));

    let lending = match lending {
        Ok(lending) => lending,
        Err(e) => {
            warn!("Skipping lending positions: {}", e);
            None
        }
    };
    if let Some(lending) = lending {
        println!("{}", format_lending(&lending, format));
        let summary = PortfolioSummary::new(&valuation, &lending);
        println!("{}", format_summary(&summary, format));
    } else if matches!(valuation, Valuation::Priced(_)) {
        let summary = PortfolioSummary::new(&valuation, &[]);
        println!("{}", format_summary(&summary, format));
    }

    Ok(())
}

pub async fn cmd_positions(
    reader: &LiquidityReader,
    owner: Address,
    page: u64,
    format: &OutputFormat,
) -> Result<()> {
    let page = reader
        .page(Some(owner), page)
        .await?
        .context("No position data returned")?;
    println!("{}", format_positions(&page, format));

    Ok(())
}

/// Everything `preview` and `send` need to know about the distribution.
pub struct DistributionInput<'a> {
    pub text: &'a str,
    pub token: Address,
    pub decimals: u8,
    pub spender: Address,
}

impl DistributionInput<'_> {
    pub fn request(&self) -> Result<TransferRequest, TransferError> {
        let distribution = RecipientParser::new(self.decimals).parse(self.text)?;
        Ok(TransferRequest::new(self.token, distribution, self.spender))
    }
}

pub async fn cmd_preview<W: WriteSource + 'static>(
    writer: Arc<W>,
    input: DistributionInput<'_>,
    format: &OutputFormat,
) -> Result<()> {
    let request = input.request().context("Recipient list rejected")?;
    println!(
        "{}",
        format_distribution(&request.distribution, input.decimals, format)
    );

    let comparison = spawn_gas_comparison(writer, request).wait().await;
    println!("{}", format_gas(comparison.as_ref(), format));

    Ok(())
}

pub async fn cmd_send<W: WriteSource + 'static>(
    mut orchestrator: TransferOrchestrator<W>,
    input: DistributionInput<'_>,
    format: &OutputFormat,
) -> Result<()> {
    let request = input.request().context("Recipient list rejected")?;
    println!(
        "{}",
        format_distribution(&request.distribution, input.decimals, format)
    );

    let snapshot = orchestrator.load_account(&request).await?;

    let printer = print_transitions(orchestrator.subscribe());
    let mut gas = spawn_gas_comparison(orchestrator.writer().clone(), request.clone());

    let result = orchestrator.run(&request, snapshot.as_ref()).await;
    drop(orchestrator);
    if let Err(e) = printer.await {
        warn!("Transition printer stopped: {}", e);
    }

    match gas.try_take() {
        Some(comparison) => println!("{}", format_gas(Some(&comparison), format)),
        None => debug!("Gas comparison did not arrive before the transfer finished"),
    }

    let confirmed = result?;
    info!(
        tx_hash = %confirmed.tx_hash,
        gas_used = confirmed.gas_used,
        "Distributed to {} recipients",
        request.distribution.len()
    );

    Ok(())
}

/// Prints transitions until a terminal one arrives or the orchestrator is dropped.
fn print_transitions(mut transitions: broadcast::Receiver<TransferState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                Ok(state) => {
                    println!("{}", format_transfer_state(&state));
                    if state.is_terminal() {
                        break;
                    }
                }
                Err(RecvError::Lagged(missed)) => warn!("Missed {} transitions", missed),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ReadBatcher;
    use crate::batch::test_support::StaticReadSource;
    use crate::contracts::IERC20;
    use crate::orchestrator::test_support::{OWNER, RecordingWriter, SPENDER, TOKEN, WriterCall};
    use alloy::sol_types::SolValue;
    use alloy_primitives::U256;

    const CHAIN: u64 = 1;
    const RECIPIENTS: &str = "0x4186A3B76843Ab221c4d4dE1f9C83623C2db9D90 1\n\
                              0x69aDB71215B1906a913bC8f2eca5881Ba62ABAa6 2";

    fn input() -> DistributionInput<'static> {
        DistributionInput {
            text: RECIPIENTS,
            token: TOKEN,
            decimals: 0,
            spender: SPENDER,
        }
    }

    fn orchestrator(
        writer: Arc<RecordingWriter>,
        balance: u64,
        allowance: u64,
    ) -> TransferOrchestrator<RecordingWriter> {
        let source = Arc::new(StaticReadSource::new(CHAIN));
        source.answer(
            TOKEN,
            IERC20::balanceOfCall { owner: OWNER },
            U256::from(balance).abi_encode(),
        );
        source.answer(
            TOKEN,
            IERC20::allowanceCall {
                owner: OWNER,
                spender: SPENDER,
            },
            U256::from(allowance).abi_encode(),
        );
        let batcher = Arc::new(ReadBatcher::new().with_source(source));
        TransferOrchestrator::new(batcher, writer, CHAIN)
    }

    #[tokio::test]
    async fn test_send_estimates_gas_alongside_the_transfer() {
        let writer = Arc::new(RecordingWriter::connected(OWNER));
        let orchestrator = orchestrator(writer.clone(), 10, 0);

        cmd_send(orchestrator, input(), &OutputFormat::Json)
            .await
            .unwrap();

        let calls = writer.calls();
        assert!(calls.contains(&WriterCall::Estimate { target: SPENDER }));
        assert!(calls.contains(&WriterCall::Estimate { target: TOKEN }));
        assert_eq!(writer.submissions().len(), 2);
    }

    #[tokio::test]
    async fn test_send_reports_insufficient_balance() {
        let writer = Arc::new(RecordingWriter::connected(OWNER));
        let orchestrator = orchestrator(writer.clone(), 1, 0);

        let err = cmd_send(orchestrator, input(), &OutputFormat::Table)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<TransferError>(),
            Some(TransferError::InsufficientBalance { .. })
        ));
        assert!(writer.submissions().is_empty());
    }

    #[tokio::test]
    async fn test_printer_ends_when_orchestrator_is_dropped() {
        let writer = Arc::new(RecordingWriter::connected(OWNER));
        let orchestrator = orchestrator(writer, 10, 0);

        let printer = print_transitions(orchestrator.subscribe());
        drop(orchestrator);

        printer.await.unwrap();
    }
}
