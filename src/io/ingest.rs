use std::io::BufRead;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::application::LedgerService;
use crate::domain::{AccountRef, Minor, PaymentRef};

/// Event types that credit a customer's balance.
const SUCCEEDED_TYPES: [&str; 2] = ["payment_succeeded", "invoice.payment_succeeded"];

/// A payment processor event, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEvent {
    /// Processor event id, unique per delivery of the same event
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub customer_id: Uuid,
    pub merchant_id: Uuid,
    /// Minor units
    pub amount: Minor,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub subscription_id: Option<String>,
}

impl PaymentEvent {
    pub fn is_payment_succeeded(&self) -> bool {
        SUCCEEDED_TYPES.contains(&self.event_type.as_str())
    }

    pub fn account(&self) -> AccountRef {
        AccountRef::new(self.customer_id, self.merchant_id)
    }

    pub fn payment_ref(&self) -> PaymentRef {
        let payment = PaymentRef::new(&self.id);
        match &self.subscription_id {
            Some(sub) => payment.with_subscription(sub),
            None => payment,
        }
    }
}

/// Result of an ingest run
#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    pub applied: usize,
    pub replayed: usize,
    /// Events of other types, ignored
    pub skipped: usize,
    pub errors: Vec<IngestError>,
}

/// Error that occurred while ingesting one line
#[derive(Debug, Clone)]
pub struct IngestError {
    pub line: usize,
    pub event_id: Option<String>,
    pub error: String,
    /// Whether re-running the same file may succeed for this line
    pub retryable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Parse and classify events without touching the ledger: `applied`
    /// then counts new payments and `replayed` those already credited
    pub dry_run: bool,
}

/// Turns processor events into idempotent deposits.
pub struct PaymentIngester<'a> {
    service: &'a LedgerService,
}

impl<'a> PaymentIngester<'a> {
    pub fn new(service: &'a LedgerService) -> Self {
        Self { service }
    }

    /// Ingest newline-delimited JSON events. Re-ingesting the same feed is
    /// safe: each event id maps to one deposit key.
    pub async fn ingest_ndjson<R: BufRead>(
        &self,
        reader: R,
        options: &IngestOptions,
    ) -> Result<IngestResult> {
        let mut result = IngestResult::default();

        for (index, raw) in reader.split(b'\n').enumerate() {
            let line_no = index + 1;
            let line = match String::from_utf8(raw?) {
                Ok(line) => line,
                Err(e) => {
                    result.errors.push(IngestError {
                        line: line_no,
                        event_id: None,
                        error: format!("Line is not valid UTF-8: {}", e.utf8_error()),
                        retryable: false,
                    });
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let event: PaymentEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    result.errors.push(IngestError {
                        line: line_no,
                        event_id: None,
                        error: format!("Invalid event JSON: {}", e),
                        retryable: false,
                    });
                    continue;
                }
            };

            if !event.is_payment_succeeded() {
                tracing::debug!(event_id = %event.id, event_type = %event.event_type, "Skipping event");
                result.skipped += 1;
                continue;
            }
            let payment = event.payment_ref();
            if options.dry_run {
                match self.service.find_deposit(event.account(), &payment).await {
                    Ok(Some(_)) => result.replayed += 1,
                    Ok(None) => result.applied += 1,
                    Err(e) => result.errors.push(IngestError {
                        line: line_no,
                        event_id: Some(event.id.clone()),
                        retryable: e.is_retryable(),
                        error: e.to_string(),
                    }),
                }
                continue;
            }

            match self
                .service
                .deposit(event.account(), event.amount, &payment, &payment.idempotency_key())
                .await
            {
                Ok(receipt) if receipt.replayed => result.replayed += 1,
                Ok(_) => result.applied += 1,
                Err(e) => result.errors.push(IngestError {
                    line: line_no,
                    event_id: Some(event.id.clone()),
                    retryable: e.is_retryable(),
                    error: e.to_string(),
                }),
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let json = r#"{"id":"evt_1","type":"payment_succeeded","customer_id":"6f9619ff-8b86-d011-b42d-00cf4fc964ff","merchant_id":"7f9619ff-8b86-d011-b42d-00cf4fc964ff","amount":8000,"subscription_id":"sub_1"}"#;
        let event: PaymentEvent = serde_json::from_str(json).unwrap();

        assert!(event.is_payment_succeeded());
        assert_eq!(event.amount, 8000);
        assert_eq!(event.currency, None);
        assert_eq!(event.payment_ref().idempotency_key(), "payment:evt_1");
        assert_eq!(event.payment_ref().subscription_id.as_deref(), Some("sub_1"));
    }

    #[test]
    fn test_other_event_types_are_not_deposits() {
        let json = r#"{"id":"evt_2","type":"payment_failed","customer_id":"6f9619ff-8b86-d011-b42d-00cf4fc964ff","merchant_id":"7f9619ff-8b86-d011-b42d-00cf4fc964ff","amount":8000}"#;
        let event: PaymentEvent = serde_json::from_str(json).unwrap();
        assert!(!event.is_payment_succeeded());
    }
}
