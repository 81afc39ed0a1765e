//! Invoice payment recalculation: re-derive percent-paid and status for
//! every invoice from the current payment rows. Always a full recompute;
//! nothing is read from previously derived values.

use anyhow::Context;
use paybridge_core::{derive_invoice_payment_state, RecalcSummary};
use tracing::warn;

use crate::store::BridgeStore;

pub async fn run_payment_recalculation(store: &dyn BridgeStore) -> anyhow::Result<RecalcSummary> {
    let totals = store
        .invoice_payment_totals()
        .await
        .context("aggregating invoice payment totals")?;

    let mut summary = RecalcSummary {
        invoices: totals.len(),
        ..Default::default()
    };

    for row in &totals {
        let (percent_paid, status) = derive_invoice_payment_state(row.total_amount, row.paid_sum);
        match store
            .update_invoice_payment_state(&row.bubble_id, percent_paid, status)
            .await
        {
            Ok(()) => summary.updated += 1,
            Err(error) => {
                warn!(id = %row.bubble_id, %error, "failed to persist invoice payment state");
                summary.errors += 1;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryStore;
    use paybridge_core::{ExternalId, InvoiceRecord, PaymentRecord, PaymentStatus};

    fn invoice(id: &str, total: f64, percent: f64, status: PaymentStatus) -> InvoiceRecord {
        InvoiceRecord {
            bubble_id: ExternalId::from(id),
            customer_bubble_id: None,
            total_amount: total,
            percent_paid: percent,
            payment_status: status,
        }
    }

    fn payment(id: &str, invoice_id: &str, amount: f64) -> PaymentRecord {
        PaymentRecord {
            bubble_id: ExternalId::from(id),
            amount,
            issuer_bank: None,
            epp_type: None,
            epp_month: None,
            epp_cost: None,
            invoice_bubble_id: Some(ExternalId::from(invoice_id)),
            agent_bubble_id: None,
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn invoice_without_payments_recomputes_to_zero() {
        let store = MemoryStore::new();
        // Stale derived values must be overwritten, not trusted.
        store.insert_invoice(invoice("inv-1", 500.0, 80.0, PaymentStatus::Partial));

        let summary = run_payment_recalculation(&store).await.expect("run");

        assert_eq!(summary.invoices, 1);
        assert_eq!(summary.updated, 1);
        let invoices = store.invoices();
        assert_eq!(invoices["inv-1"].percent_paid, 0.0);
        assert_eq!(invoices["inv-1"].payment_status, PaymentStatus::Unpaid);
    }

    #[tokio::test]
    async fn partial_and_paid_invoices_derive_from_payment_sums() {
        let store = MemoryStore::new();
        store.insert_invoice(invoice("inv-1", 200.0, 0.0, PaymentStatus::Unpaid));
        store.insert_invoice(invoice("inv-2", 100.0, 0.0, PaymentStatus::Unpaid));
        store.insert_payment(payment("p1", "inv-1", 50.0));
        store.insert_payment(payment("p2", "inv-2", 60.0));
        store.insert_payment(payment("p3", "inv-2", 40.0));

        let summary = run_payment_recalculation(&store).await.expect("run");
        assert_eq!(summary.updated, 2);

        let invoices = store.invoices();
        assert_eq!(invoices["inv-1"].percent_paid, 25.0);
        assert_eq!(invoices["inv-1"].payment_status, PaymentStatus::Partial);
        assert_eq!(invoices["inv-2"].percent_paid, 100.0);
        assert_eq!(invoices["inv-2"].payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn recalculation_is_stable_across_runs() {
        let store = MemoryStore::new();
        store.insert_invoice(invoice("inv-1", 300.0, 0.0, PaymentStatus::Unpaid));
        store.insert_payment(payment("p1", "inv-1", 100.0));

        run_payment_recalculation(&store).await.expect("first");
        let after_first = store.invoices();
        run_payment_recalculation(&store).await.expect("second");
        let after_second = store.invoices();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second["inv-1"].percent_paid, 33.33);
    }
}
