//! Gas estimate of one multisend against separate `transfer` calls.

use crate::background::BackgroundTask;
use crate::orchestrator::{TransferRequest, WriteError, WriteSource};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GasComparison {
    pub recipients: usize,
    /// Estimate for the single multisend transaction.
    pub batched: u64,
    /// Estimate for one plain transfer to the first recipient.
    pub single_transfer: u64,
}

impl GasComparison {
    /// What sending every instruction as its own transfer would cost.
    pub fn separate_total(&self) -> u64 {
        self.single_transfer.saturating_mul(self.recipients as u64)
    }

    /// Positive when batching is cheaper.
    pub fn savings(&self) -> i128 {
        i128::from(self.separate_total()) - i128::from(self.batched)
    }

    pub fn savings_percent(&self) -> f64 {
        let separate = self.separate_total();
        if separate == 0 {
            return 0.0;
        }
        self.savings() as f64 * 100.0 / separate as f64
    }
}

/// Runs both estimates concurrently.
pub async fn compare_gas<W: WriteSource + ?Sized>(
    writer: &W,
    request: &TransferRequest,
) -> Result<GasComparison, WriteError> {
    let (batched, single_transfer) = tokio::try_join!(
        writer.estimate_gas(request.spender, request.multisend_calldata()),
        writer.estimate_gas(request.token, request.single_transfer_calldata()),
    )?;

    let comparison = GasComparison {
        recipients: request.distribution.len(),
        batched,
        single_transfer,
    };
    info!(
        "Gas estimate: batched {} vs {} separately",
        comparison.batched,
        comparison.separate_total()
    );
    Ok(comparison)
}

/// Starts the comparison without blocking the caller. It yields nothing when
/// either estimate fails.
pub fn spawn_gas_comparison<W: WriteSource + 'static>(
    writer: Arc<W>,
    request: TransferRequest,
) -> BackgroundTask<GasComparison> {
    BackgroundTask::spawn("gas comparison", async move {
        compare_gas(writer.as_ref(), &request).await
    })
}
