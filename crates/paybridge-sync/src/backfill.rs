//! EPP cost backfill: fill in the financing cost on installment-plan
//! payments that do not have one yet. Rows already carrying a nonzero cost
//! are never re-selected, so repeated runs are no-ops.

use anyhow::Context;
use paybridge_core::{compute_epp_cost, BackfillSkip, BackfillSummary, EppRateTable, PaymentRecord};
use tracing::warn;

use crate::store::BridgeStore;

/// Scan for cost-less EPP payments and persist the computed cost. A row
/// with a missing input or an unknown (bank, tenure) rate is skipped with
/// a reason, not treated as an error.
pub async fn run_epp_backfill(
    store: &dyn BridgeStore,
    rates: &EppRateTable,
) -> anyhow::Result<BackfillSummary> {
    let candidates = store
        .payments_missing_epp_cost()
        .await
        .context("selecting payments missing an EPP cost")?;

    let mut summary = BackfillSummary::default();
    for payment in &candidates {
        match cost_for(payment, rates) {
            Ok(cost) => match store.set_epp_cost(&payment.bubble_id, cost).await {
                Ok(()) => summary.updated += 1,
                Err(error) => {
                    warn!(id = %payment.bubble_id, %error, "failed to persist EPP cost");
                    summary.errors += 1;
                }
            },
            Err(reason) => {
                summary.skipped += 1;
                summary.skips.push(BackfillSkip {
                    id: payment.bubble_id.clone(),
                    reason,
                });
            }
        }
    }
    Ok(summary)
}

fn cost_for(payment: &PaymentRecord, rates: &EppRateTable) -> Result<f64, String> {
    if payment.amount <= 0.0 {
        return Err("missing amount".to_string());
    }
    let bank = payment
        .issuer_bank
        .as_deref()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| "missing issuer bank".to_string())?;
    let months = payment
        .epp_month
        .ok_or_else(|| "missing EPP month".to_string())?;
    let rate = rates
        .lookup(bank, months)
        .ok_or_else(|| format!("no rate for {bank} at {months} months"))?;
    Ok(compute_epp_cost(payment.amount, rate))
}
