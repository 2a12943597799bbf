//! Payment collaborator.
//!
//! The engine only opens deposit intents and requests refunds. Settlement
//! arrives later through [`crate::app::BookingService::on_payment_result`].

use crate::types::{Money, PaymentIntentId};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Payment gateway result
pub type GatewayResult<T> = Result<T, PaymentGatewayError>;

/// Payment gateway error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentGatewayError {
    /// The processor refused the request
    Declined {
        /// Decline reason
        reason: String,
    },
    /// Gateway timeout
    Timeout,
    /// Other error
    Other {
        /// Error message
        message: String,
    },
}

impl std::fmt::Display for PaymentGatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Declined { reason } => write!(f, "Payment declined: {reason}"),
            Self::Timeout => write!(f, "Gateway timeout"),
            Self::Other { message } => write!(f, "Payment error: {message}"),
        }
    }
}

impl std::error::Error for PaymentGatewayError {}

/// Payment gateway trait
///
/// Abstraction over payment processors. Futures are `'static` so reducers can
/// move them into effects.
pub trait PaymentGateway: Send + Sync {
    /// Open a payment intent for a booking deposit
    ///
    /// # Errors
    ///
    /// Returns error if the processor refuses or cannot be reached
    fn open_deposit_intent(
        &self,
        amount: Money,
        currency: &str,
        booking_reference: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<PaymentIntentId>> + Send>>;

    /// Refund part or all of the money captured on an intent.
    ///
    /// Returns the processor's refund id.
    ///
    /// # Errors
    ///
    /// Returns error if the refund fails
    fn initiate_refund(
        &self,
        intent_id: &PaymentIntentId,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<String>> + Send>>;
}

/// A request seen by [`MockPaymentGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `open_deposit_intent`
    DepositIntent {
        /// Amount requested
        amount: Money,
        /// Currency code
        currency: String,
        /// Booking reference
        booking_reference: String,
    },
    /// `initiate_refund`
    Refund {
        /// Intent refunded
        intent_id: PaymentIntentId,
        /// Amount refunded
        amount: Money,
    },
}

/// Mock payment gateway for development and tests.
///
/// Succeeds unless told to fail, and records every call.
#[derive(Clone, Debug, Default)]
pub struct MockPaymentGateway {
    calls: Arc<Mutex<Vec<GatewayCall>>>,
    fail_intents: Arc<AtomicBool>,
    fail_refunds: Arc<AtomicBool>,
}

impl MockPaymentGateway {
    /// Creates a new mock payment gateway
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared() -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new())
    }

    /// Make subsequent `open_deposit_intent` calls fail
    pub fn fail_intents(&self, fail: bool) {
        self.fail_intents.store(fail, Ordering::SeqCst);
    }

    /// Make subsequent `initiate_refund` calls fail
    pub fn fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    /// Every call received so far
    #[must_use]
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Refund calls received so far
    #[must_use]
    pub fn refunds(&self) -> Vec<(PaymentIntentId, Money)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                GatewayCall::Refund { intent_id, amount } => Some((intent_id, amount)),
                GatewayCall::DepositIntent { .. } => None,
            })
            .collect()
    }

    fn record(&self, call: GatewayCall) {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(call),
            Err(poisoned) => poisoned.into_inner().push(call),
        }
    }
}

impl PaymentGateway for MockPaymentGateway {
    fn open_deposit_intent(
        &self,
        amount: Money,
        currency: &str,
        booking_reference: &str,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<PaymentIntentId>> + Send>> {
        self.record(GatewayCall::DepositIntent {
            amount,
            currency: currency.to_string(),
            booking_reference: booking_reference.to_string(),
        });
        let fail = self.fail_intents.load(Ordering::SeqCst);
        let booking_reference = booking_reference.to_string();

        Box::pin(async move {
            if fail {
                return Err(PaymentGatewayError::Other {
                    message: "mock gateway configured to fail".to_string(),
                });
            }

            let intent_id = PaymentIntentId::new(format!("mock_pi_{}", uuid::Uuid::new_v4()));
            tracing::info!(
                intent_id = %intent_id,
                amount = amount.cents(),
                booking_reference = %booking_reference,
                "Mock deposit intent opened"
            );
            Ok(intent_id)
        })
    }

    fn initiate_refund(
        &self,
        intent_id: &PaymentIntentId,
        amount: Money,
    ) -> Pin<Box<dyn Future<Output = GatewayResult<String>> + Send>> {
        self.record(GatewayCall::Refund {
            intent_id: intent_id.clone(),
            amount,
        });
        let fail = self.fail_refunds.load(Ordering::SeqCst);
        let intent_id = intent_id.clone();

        Box::pin(async move {
            if fail {
                return Err(PaymentGatewayError::Timeout);
            }

            let refund_id = format!("mock_refund_{}", uuid::Uuid::new_v4());
            tracing::info!(
                intent_id = %intent_id,
                amount = amount.cents(),
                refund_id = %refund_id,
                "Mock refund processed"
            );
            Ok(refund_id)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_intent_and_refund() {
        let gateway = MockPaymentGateway::new();

        let intent = gateway
            .open_deposit_intent(Money::from_cents(2_500), "USD", "CS-ABCDEFGH")
            .await
            .unwrap();
        assert!(intent.as_str().starts_with("mock_pi_"));

        let refund = gateway.initiate_refund(&intent, Money::from_cents(500)).await.unwrap();
        assert!(refund.starts_with("mock_refund_"));
        assert_eq!(gateway.refunds(), vec![(intent, Money::from_cents(500))]);
        assert_eq!(gateway.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_mock_failures_are_recorded() {
        let gateway = MockPaymentGateway::new();
        gateway.fail_intents(true);
        gateway.fail_refunds(true);

        let intent = gateway
            .open_deposit_intent(Money::from_cents(2_500), "USD", "CS-ABCDEFGH")
            .await;
        assert!(matches!(intent, Err(PaymentGatewayError::Other { .. })));

        let refund = gateway
            .initiate_refund(&PaymentIntentId::from("pi_1"), Money::from_cents(10))
            .await;
        assert_eq!(refund, Err(PaymentGatewayError::Timeout));
        assert_eq!(refund.unwrap_err().to_string(), "Gateway timeout");
        assert_eq!(gateway.calls().len(), 2);
    }
}
