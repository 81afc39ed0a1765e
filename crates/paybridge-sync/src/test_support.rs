//! In-memory doubles for the store and source seams, shared by the unit
//! tests in this crate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use paybridge_core::{ExternalId, InvoiceRecord, PaymentRecord, PaymentStatus, ProblemEntry};
use paybridge_source::{RecordSource, SourceError};
use serde_json::Value as JsonValue;

use crate::store::{BridgeStore, InvoicePaymentTotals, StoreError, UpsertOutcome};

#[derive(Debug, Default)]
struct MemoryInner {
    id_list: Vec<ExternalId>,
    problems: Vec<ProblemEntry>,
    payments: BTreeMap<String, PaymentRecord>,
    invoices: BTreeMap<String, InvoiceRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_payment(&self, record: PaymentRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .payments
            .insert(record.bubble_id.as_str().to_string(), record);
    }

    pub fn insert_invoice(&self, record: InvoiceRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .invoices
            .insert(record.bubble_id.as_str().to_string(), record);
    }

    pub fn payments(&self) -> BTreeMap<String, PaymentRecord> {
        self.inner.lock().unwrap().payments.clone()
    }

    pub fn invoices(&self) -> BTreeMap<String, InvoiceRecord> {
        self.inner.lock().unwrap().invoices.clone()
    }

    pub fn problems(&self) -> Vec<ProblemEntry> {
        self.inner.lock().unwrap().problems.clone()
    }
}

#[async_trait]
impl BridgeStore for MemoryStore {
    async fn save_id_list(&self, ids: &[ExternalId]) -> Result<(), StoreError> {
        self.inner.lock().unwrap().id_list = ids.to_vec();
        Ok(())
    }

    async fn load_id_list(&self) -> Result<Vec<ExternalId>, StoreError> {
        Ok(self.inner.lock().unwrap().id_list.clone())
    }

    async fn clear_id_list(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap().id_list.clear();
        Ok(())
    }

    async fn append_problem(&self, entry: &ProblemEntry) -> Result<(), StoreError> {
        self.inner.lock().unwrap().problems.push(entry.clone());
        Ok(())
    }

    async fn list_problems(&self) -> Result<Vec<ProblemEntry>, StoreError> {
        Ok(self.inner.lock().unwrap().problems.clone())
    }

    async fn clear_problems(&self) -> Result<(), StoreError> {
        self.inner.lock().unwrap().problems.clear();
        Ok(())
    }

    async fn clear_problem(&self, id: &ExternalId) -> Result<(), StoreError> {
        self.inner.lock().unwrap().problems.retain(|p| &p.id != id);
        Ok(())
    }

    async fn upsert_payment(&self, record: &PaymentRecord) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = record.bubble_id.as_str().to_string();
        let outcome = if inner.payments.contains_key(&key) {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        inner.payments.insert(key, record.clone());
        Ok(outcome)
    }

    async fn get_payment(&self, id: &ExternalId) -> Result<Option<PaymentRecord>, StoreError> {
        Ok(self.inner.lock().unwrap().payments.get(id.as_str()).cloned())
    }

    async fn payments_missing_epp_cost(&self) -> Result<Vec<PaymentRecord>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .payments
            .values()
            .filter(|p| p.needs_epp_cost())
            .cloned()
            .collect())
    }

    async fn set_epp_cost(&self, id: &ExternalId, cost: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(payment) = inner.payments.get_mut(id.as_str()) {
            payment.epp_cost = Some(cost);
        }
        Ok(())
    }

    async fn reset_payments(&self) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.payments.len() as u64;
        inner.payments.clear();
        Ok(count)
    }

    async fn invoice_payment_totals(&self) -> Result<Vec<InvoicePaymentTotals>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .invoices
            .values()
            .map(|invoice| {
                let paid_sum = inner
                    .payments
                    .values()
                    .filter(|p| p.invoice_bubble_id.as_ref() == Some(&invoice.bubble_id))
                    .map(|p| p.amount)
                    .sum();
                InvoicePaymentTotals {
                    bubble_id: invoice.bubble_id.clone(),
                    total_amount: invoice.total_amount,
                    paid_sum,
                }
            })
            .collect())
    }

    async fn update_invoice_payment_state(
        &self,
        id: &ExternalId,
        percent_paid: f64,
        status: PaymentStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(invoice) = inner.invoices.get_mut(id.as_str()) {
            invoice.percent_paid = percent_paid;
            invoice.payment_status = status;
        }
        Ok(())
    }
}

/// Scripted record source: serves canned payloads and fails on demand.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    payloads: HashMap<String, JsonValue>,
    failing: HashSet<String>,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_payload(mut self, id: &str, payload: JsonValue) -> Self {
        self.payloads.insert(id.to_string(), payload);
        self
    }

    pub fn with_failure(mut self, id: &str) -> Self {
        self.failing.insert(id.to_string());
        self
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn fetch_object(
        &self,
        object_type: &str,
        id: &ExternalId,
    ) -> Result<JsonValue, SourceError> {
        if self.failing.contains(id.as_str()) {
            return Err(SourceError::HttpStatus {
                status: 500,
                url: format!("scripted://{object_type}/{id}"),
            });
        }
        self.payloads
            .get(id.as_str())
            .cloned()
            .ok_or_else(|| SourceError::HttpStatus {
                status: 404,
                url: format!("scripted://{object_type}/{id}"),
            })
    }
}
