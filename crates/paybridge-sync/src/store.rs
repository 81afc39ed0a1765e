//! Relational store access. All cross-system joins go through the
//! `bubble_id` text column; the store exposes exactly the operations the
//! sync workflows need behind the [`BridgeStore`] seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use paybridge_core::{ExternalId, PaymentRecord, PaymentStatus, ProblemEntry};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        StoreError::Database(error.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// One invoice with the current sum of its linked payments. Invoices with
/// zero linked payments are included with `paid_sum` 0.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoicePaymentTotals {
    pub bubble_id: ExternalId,
    pub total_amount: f64,
    pub paid_sum: f64,
}

/// Storage seam for the sync workflows. The Postgres implementation is
/// [`PgStore`]; tests substitute an in-memory double.
#[async_trait]
pub trait BridgeStore: Send + Sync {
    async fn save_id_list(&self, ids: &[ExternalId]) -> Result<(), StoreError>;
    async fn load_id_list(&self) -> Result<Vec<ExternalId>, StoreError>;
    async fn clear_id_list(&self) -> Result<(), StoreError>;

    async fn append_problem(&self, entry: &ProblemEntry) -> Result<(), StoreError>;
    async fn list_problems(&self) -> Result<Vec<ProblemEntry>, StoreError>;
    async fn clear_problems(&self) -> Result<(), StoreError>;
    async fn clear_problem(&self, id: &ExternalId) -> Result<(), StoreError>;

    async fn upsert_payment(&self, record: &PaymentRecord) -> Result<UpsertOutcome, StoreError>;
    async fn get_payment(&self, id: &ExternalId) -> Result<Option<PaymentRecord>, StoreError>;
    async fn payments_missing_epp_cost(&self) -> Result<Vec<PaymentRecord>, StoreError>;
    async fn set_epp_cost(&self, id: &ExternalId, cost: f64) -> Result<(), StoreError>;
    async fn reset_payments(&self) -> Result<u64, StoreError>;

    async fn invoice_payment_totals(&self) -> Result<Vec<InvoicePaymentTotals>, StoreError>;
    async fn update_invoice_payment_state(
        &self,
        id: &ExternalId,
        percent_paid: f64,
        status: PaymentStatus,
    ) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Database(error.to_string()))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    bubble_id: String,
    amount: f64,
    issuer_bank: Option<String>,
    epp_type: Option<String>,
    epp_month: Option<i32>,
    epp_cost: Option<f64>,
    invoice_bubble_id: Option<String>,
    agent_bubble_id: Option<String>,
    paid_at: Option<DateTime<Utc>>,
}

impl From<PaymentRow> for PaymentRecord {
    fn from(row: PaymentRow) -> Self {
        Self {
            bubble_id: ExternalId::new(row.bubble_id),
            amount: row.amount,
            issuer_bank: row.issuer_bank,
            epp_type: row.epp_type,
            epp_month: row.epp_month,
            epp_cost: row.epp_cost,
            invoice_bubble_id: row.invoice_bubble_id.map(ExternalId::new),
            agent_bubble_id: row.agent_bubble_id.map(ExternalId::new),
            paid_at: row.paid_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProblemRow {
    bubble_id: String,
    reason: String,
    recorded_at: DateTime<Utc>,
}

impl From<ProblemRow> for ProblemEntry {
    fn from(row: ProblemRow) -> Self {
        Self {
            id: ExternalId::new(row.bubble_id),
            reason: row.reason,
            recorded_at: row.recorded_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct InvoiceTotalsRow {
    bubble_id: String,
    total_amount: f64,
    paid_sum: f64,
}

const PAYMENT_COLUMNS: &str = "bubble_id, amount, issuer_bank, epp_type, epp_month, epp_cost, \
     invoice_bubble_id, agent_bubble_id, paid_at";

#[async_trait]
impl BridgeStore for PgStore {
    async fn save_id_list(&self, ids: &[ExternalId]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM sync_id_list")
            .execute(&mut *tx)
            .await?;
        for (position, id) in ids.iter().enumerate() {
            sqlx::query("INSERT INTO sync_id_list (position, bubble_id) VALUES ($1, $2)")
                .bind(position as i32)
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_id_list(&self) -> Result<Vec<ExternalId>, StoreError> {
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT bubble_id FROM sync_id_list ORDER BY position")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(ExternalId::new).collect())
    }

    async fn clear_id_list(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_id_list")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_problem(&self, entry: &ProblemEntry) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO sync_problem (bubble_id, reason, recorded_at) VALUES ($1, $2, $3)")
            .bind(entry.id.as_str())
            .bind(&entry.reason)
            .bind(entry.recorded_at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_problems(&self) -> Result<Vec<ProblemEntry>, StoreError> {
        let rows = sqlx::query_as::<_, ProblemRow>(
            "SELECT bubble_id, reason, recorded_at FROM sync_problem ORDER BY recorded_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn clear_problems(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_problem")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn clear_problem(&self, id: &ExternalId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_problem WHERE bubble_id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_payment(&self, record: &PaymentRecord) -> Result<UpsertOutcome, StoreError> {
        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payment WHERE bubble_id = $1")
            .bind(record.bubble_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        let outcome = if existing > 0 {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };

        sqlx::query(
            r#"
            INSERT INTO payment (bubble_id, amount, issuer_bank, epp_type, epp_month, epp_cost,
                                 invoice_bubble_id, agent_bubble_id, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (bubble_id) DO UPDATE SET
                amount = EXCLUDED.amount,
                issuer_bank = EXCLUDED.issuer_bank,
                epp_type = EXCLUDED.epp_type,
                epp_month = EXCLUDED.epp_month,
                epp_cost = EXCLUDED.epp_cost,
                invoice_bubble_id = EXCLUDED.invoice_bubble_id,
                agent_bubble_id = EXCLUDED.agent_bubble_id,
                paid_at = EXCLUDED.paid_at,
                updated_at = NOW()
            "#,
        )
        .bind(record.bubble_id.as_str())
        .bind(record.amount)
        .bind(&record.issuer_bank)
        .bind(&record.epp_type)
        .bind(record.epp_month)
        .bind(record.epp_cost)
        .bind(record.invoice_bubble_id.as_ref().map(ExternalId::as_str))
        .bind(record.agent_bubble_id.as_ref().map(ExternalId::as_str))
        .bind(record.paid_at)
        .execute(&self.pool)
        .await?;

        Ok(outcome)
    }

    async fn get_payment(&self, id: &ExternalId) -> Result<Option<PaymentRecord>, StoreError> {
        let row = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment WHERE bubble_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn payments_missing_epp_cost(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PaymentRow>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payment \
             WHERE LOWER(epp_type) = 'epp' AND (epp_cost IS NULL OR epp_cost = 0) \
             ORDER BY bubble_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn set_epp_cost(&self, id: &ExternalId, cost: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE payment SET epp_cost = $2, updated_at = NOW() WHERE bubble_id = $1")
            .bind(id.as_str())
            .bind(cost)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reset_payments(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM payment").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn invoice_payment_totals(&self) -> Result<Vec<InvoicePaymentTotals>, StoreError> {
        let rows = sqlx::query_as::<_, InvoiceTotalsRow>(
            r#"
            SELECT i.bubble_id,
                   i.total_amount,
                   COALESCE(SUM(p.amount), 0) AS paid_sum
              FROM invoice i
              LEFT JOIN payment p ON p.invoice_bubble_id = i.bubble_id
             GROUP BY i.bubble_id, i.total_amount
             ORDER BY i.bubble_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| InvoicePaymentTotals {
                bubble_id: ExternalId::new(row.bubble_id),
                total_amount: row.total_amount,
                paid_sum: row.paid_sum,
            })
            .collect())
    }

    async fn update_invoice_payment_state(
        &self,
        id: &ExternalId,
        percent_paid: f64,
        status: PaymentStatus,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE invoice SET percent_paid = $2, payment_status = $3, updated_at = NOW() \
             WHERE bubble_id = $1",
        )
        .bind(id.as_str())
        .bind(percent_paid)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
