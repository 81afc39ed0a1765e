//! Core domain model for PayBridge: externally-keyed records, run
//! summaries, progress snapshots and the pure payment derivations.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "paybridge-core";

/// Identifier assigned by the external record source. Stored as the
/// `bubble_id` column in every local table and used as the only reliable
/// cross-system join key; local serial ids never leave the database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Local payment row keyed by its external id. Invoice and agent links are
/// soft references: the external id is stored, existence is checked at
/// join time, and no database constraint enforces them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub bubble_id: ExternalId,
    pub amount: f64,
    pub issuer_bank: Option<String>,
    pub epp_type: Option<String>,
    pub epp_month: Option<i32>,
    pub epp_cost: Option<f64>,
    pub invoice_bubble_id: Option<ExternalId>,
    pub agent_bubble_id: Option<ExternalId>,
    pub paid_at: Option<DateTime<Utc>>,
}

impl PaymentRecord {
    /// Whether the row is an installment-plan payment still awaiting a
    /// computed financing cost.
    pub fn needs_epp_cost(&self) -> bool {
        self.is_epp_plan() && self.epp_cost.map_or(true, |c| c == 0.0)
    }

    pub fn is_epp_plan(&self) -> bool {
        self.epp_type
            .as_deref()
            .map_or(false, |t| t.eq_ignore_ascii_case("epp"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Partial => "partial",
            PaymentStatus::Paid => "paid",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Local invoice row with payment state derived from the payments that
/// reference it; `percent_paid` and `payment_status` are recomputed, never
/// independently authored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRecord {
    pub bubble_id: ExternalId,
    pub customer_bubble_id: Option<ExternalId>,
    pub total_amount: f64,
    pub percent_paid: f64,
    pub payment_status: PaymentStatus,
}

/// A sync failure recorded for operator review; lives until explicitly
/// cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProblemEntry {
    pub id: ExternalId,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl ProblemEntry {
    pub fn new(id: ExternalId, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub updated: usize,
    pub skipped: usize,
    pub errored: usize,
    pub problems: Vec<ProblemEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackfillSkip {
    pub id: ExternalId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackfillSummary {
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
    pub skips: Vec<BackfillSkip>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RecalcSummary {
    pub invoices: usize,
    pub updated: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunReport {
    pub run_id: Uuid,
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub summary: SyncSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Failed,
}

/// Point-in-time view of a progress session, polled by clients while a
/// background operation runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSnapshot {
    pub session_id: String,
    pub total: usize,
    pub processed: usize,
    pub errors: usize,
    pub status: ProgressStatus,
}

/// One rate-table row: financing rate in percent for a (bank, tenure)
/// pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EppRate {
    pub bank: String,
    pub months: i32,
    pub rate_percent: f64,
}

/// Static lookup of installment financing rates. Bank names compare
/// case-insensitively; an unknown (bank, months) pair yields no rate and
/// the caller skips the row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EppRateTable {
    pub rates: Vec<EppRate>,
}

impl EppRateTable {
    pub fn new(rates: Vec<EppRate>) -> Self {
        Self { rates }
    }

    /// Table used when no rates file is configured.
    pub fn builtin() -> Self {
        let rate = |bank: &str, months: i32, rate_percent: f64| EppRate {
            bank: bank.to_string(),
            months,
            rate_percent,
        };
        Self {
            rates: vec![
                rate("Maybank", 6, 2.0),
                rate("Maybank", 12, 4.0),
                rate("Maybank", 24, 7.0),
                rate("CIMB", 6, 2.5),
                rate("CIMB", 12, 4.5),
                rate("CIMB", 24, 7.5),
                rate("Public Bank", 6, 3.0),
                rate("Public Bank", 12, 5.0),
                rate("RHB", 12, 5.0),
                rate("RHB", 24, 8.0),
            ],
        }
    }

    pub fn lookup(&self, bank: &str, months: i32) -> Option<f64> {
        self.rates
            .iter()
            .find(|r| r.months == months && r.bank.eq_ignore_ascii_case(bank))
            .map(|r| r.rate_percent)
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }
}

/// Round half-up to two decimals; every persisted derived amount goes
/// through this so repeated runs produce identical values.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Financing cost for an EPP payment: `amount * rate / 100`, two-decimal.
pub fn compute_epp_cost(amount: f64, rate_percent: f64) -> f64 {
    round2(amount * rate_percent / 100.0)
}

/// Derive percent-paid and status for an invoice from the current sum of
/// its linked payments. Zero linked payments is a valid state, not an
/// error: 0% / unpaid. A zero-total invoice with payments counts as paid.
pub fn derive_invoice_payment_state(total_amount: f64, paid_sum: f64) -> (f64, PaymentStatus) {
    if paid_sum <= 0.0 {
        return (0.0, PaymentStatus::Unpaid);
    }
    if total_amount <= 0.0 {
        return (100.0, PaymentStatus::Paid);
    }
    let percent = round2(paid_sum / total_amount * 100.0);
    let status = if percent >= 100.0 {
        PaymentStatus::Paid
    } else {
        PaymentStatus::Partial
    };
    (percent, status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epp_cost_formula_is_exact_at_two_decimals() {
        assert_eq!(compute_epp_cost(1000.0, 5.0), 50.0);
        assert_eq!(compute_epp_cost(999.99, 2.5), 25.0);
        assert_eq!(compute_epp_cost(1234.56, 4.0), 49.38);
        // Stable across repeated evaluation.
        assert_eq!(compute_epp_cost(1234.56, 4.0), compute_epp_cost(1234.56, 4.0));
    }

    #[test]
    fn rate_lookup_is_case_insensitive_and_pair_keyed() {
        let table = EppRateTable::builtin();
        assert_eq!(table.lookup("maybank", 12), Some(4.0));
        assert_eq!(table.lookup("MAYBANK", 6), Some(2.0));
        assert_eq!(table.lookup("Maybank", 36), None);
        assert_eq!(table.lookup("Unknown Bank", 12), None);
    }

    #[test]
    fn zero_payments_derive_to_zero_percent_unpaid() {
        let (percent, status) = derive_invoice_payment_state(500.0, 0.0);
        assert_eq!(percent, 0.0);
        assert_eq!(status, PaymentStatus::Unpaid);
    }

    #[test]
    fn partial_and_full_payment_states() {
        let (percent, status) = derive_invoice_payment_state(200.0, 50.0);
        assert_eq!(percent, 25.0);
        assert_eq!(status, PaymentStatus::Partial);

        let (percent, status) = derive_invoice_payment_state(200.0, 200.0);
        assert_eq!(percent, 100.0);
        assert_eq!(status, PaymentStatus::Paid);

        let (percent, status) = derive_invoice_payment_state(200.0, 250.0);
        assert_eq!(percent, 125.0);
        assert_eq!(status, PaymentStatus::Paid);
    }

    #[test]
    fn zero_total_invoice_with_payments_is_paid() {
        let (percent, status) = derive_invoice_payment_state(0.0, 10.0);
        assert_eq!(percent, 100.0);
        assert_eq!(status, PaymentStatus::Paid);
    }

    #[test]
    fn needs_epp_cost_excludes_already_costed_rows() {
        let mut payment = PaymentRecord {
            bubble_id: ExternalId::from("pay-1"),
            amount: 1000.0,
            issuer_bank: Some("Maybank".to_string()),
            epp_type: Some("EPP".to_string()),
            epp_month: Some(12),
            epp_cost: None,
            invoice_bubble_id: None,
            agent_bubble_id: None,
            paid_at: None,
        };
        assert!(payment.needs_epp_cost());

        payment.epp_cost = Some(0.0);
        assert!(payment.needs_epp_cost());

        payment.epp_cost = Some(40.0);
        assert!(!payment.needs_epp_cost());

        payment.epp_cost = None;
        payment.epp_type = Some("full".to_string());
        assert!(!payment.needs_epp_cost());
    }
}
