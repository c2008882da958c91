//! Gateway correlation model
//!
//! Each gateway reports different identifiers in its webhooks. A transaction
//! is created with exactly one gateway's correlation fields populated; the
//! reconciliation engine later looks the transaction up by whichever field
//! the inbound event carries.

use serde::{Deserialize, Serialize};

/// External payment provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gateway {
    Stripe,
    Razorpay,
    Paypal,
}

impl Gateway {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gateway::Stripe => "stripe",
            Gateway::Razorpay => "razorpay",
            Gateway::Paypal => "paypal",
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What was purchased
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemType {
    #[serde(rename = "song")]
    Song,
    #[serde(rename = "album")]
    Album,
    #[serde(rename = "artist-subscription")]
    ArtistSubscription,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Song => "song",
            ItemType::Album => "album",
            ItemType::ArtistSubscription => "artist-subscription",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "song" => Some(ItemType::Song),
            "album" => Some(ItemType::Album),
            "artist-subscription" => Some(ItemType::ArtistSubscription),
            _ => None,
        }
    }

    /// Ledger source label for a credit originating from this item type
    pub fn ledger_source(&self) -> &'static str {
        match self {
            ItemType::Song => "song",
            ItemType::Album => "album",
            ItemType::ArtistSubscription => "subscription",
        }
    }
}

/// Subscription billing period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingCycle {
    #[serde(rename = "1m")]
    Monthly,
    #[serde(rename = "3m")]
    Quarterly,
    #[serde(rename = "6m")]
    HalfYearly,
    #[serde(rename = "12m")]
    Yearly,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "1m",
            BillingCycle::Quarterly => "3m",
            BillingCycle::HalfYearly => "6m",
            BillingCycle::Yearly => "12m",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(BillingCycle::Monthly),
            "3m" => Some(BillingCycle::Quarterly),
            "6m" => Some(BillingCycle::HalfYearly),
            "12m" => Some(BillingCycle::Yearly),
            _ => None,
        }
    }

    /// Days of access granted per successful billing
    pub fn days(&self) -> i64 {
        match self {
            BillingCycle::Monthly => 30,
            BillingCycle::Quarterly => 90,
            BillingCycle::HalfYearly => 180,
            BillingCycle::Yearly => 365,
        }
    }
}

/// Gateway-specific correlation for locating the local transaction that an
/// inbound event refers to.
///
/// Modeled as a tagged union so filter construction is an exhaustive match.
/// Within a gateway, subscription correlation takes precedence over
/// order/payment correlation: a subscription payment's order-level ID is
/// gateway-internal and less reliable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCorrelation {
    Stripe {
        payment_intent_id: Option<String>,
        subscription_id: Option<String>,
    },
    Razorpay {
        subscription_id: Option<String>,
        order_id: Option<String>,
        payment_id: Option<String>,
    },
    Paypal {
        subscription_id: Option<String>,
        payment_id: Option<String>,
    },
}

/// A single resolved lookup predicate: which column to match, and the value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationField {
    SubscriptionId,
    OrderId,
    PaymentId,
    PaymentIntentId,
}

impl CorrelationField {
    pub fn column(&self) -> &'static str {
        match self {
            CorrelationField::SubscriptionId => "subscription_id",
            CorrelationField::OrderId => "order_id",
            CorrelationField::PaymentId => "payment_id",
            CorrelationField::PaymentIntentId => "payment_intent_id",
        }
    }
}

impl GatewayCorrelation {
    pub fn gateway(&self) -> Gateway {
        match self {
            GatewayCorrelation::Stripe { .. } => Gateway::Stripe,
            GatewayCorrelation::Razorpay { .. } => Gateway::Razorpay,
            GatewayCorrelation::Paypal { .. } => Gateway::Paypal,
        }
    }

    /// Resolve the lookup filter: the highest-priority populated field.
    ///
    /// Returns `None` when the correlation bag carries no identifier at all,
    /// which callers treat the same as an unknown transaction.
    pub fn lookup_filter(&self) -> Option<(CorrelationField, &str)> {
        match self {
            GatewayCorrelation::Stripe {
                payment_intent_id,
                subscription_id,
            } => subscription_id
                .as_deref()
                .map(|v| (CorrelationField::SubscriptionId, v))
                .or_else(|| {
                    payment_intent_id
                        .as_deref()
                        .map(|v| (CorrelationField::PaymentIntentId, v))
                }),
            GatewayCorrelation::Razorpay {
                subscription_id,
                order_id,
                payment_id,
            } => subscription_id
                .as_deref()
                .map(|v| (CorrelationField::SubscriptionId, v))
                .or_else(|| order_id.as_deref().map(|v| (CorrelationField::OrderId, v)))
                .or_else(|| {
                    payment_id
                        .as_deref()
                        .map(|v| (CorrelationField::PaymentId, v))
                }),
            GatewayCorrelation::Paypal {
                subscription_id,
                payment_id,
            } => subscription_id
                .as_deref()
                .map(|v| (CorrelationField::SubscriptionId, v))
                .or_else(|| {
                    payment_id
                        .as_deref()
                        .map(|v| (CorrelationField::PaymentId, v))
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_days() {
        assert_eq!(BillingCycle::Monthly.days(), 30);
        assert_eq!(BillingCycle::Quarterly.days(), 90);
        assert_eq!(BillingCycle::HalfYearly.days(), 180);
        assert_eq!(BillingCycle::Yearly.days(), 365);
    }

    #[test]
    fn test_cycle_round_trip() {
        for cycle in [
            BillingCycle::Monthly,
            BillingCycle::Quarterly,
            BillingCycle::HalfYearly,
            BillingCycle::Yearly,
        ] {
            assert_eq!(BillingCycle::from_str(cycle.as_str()), Some(cycle));
        }
        assert_eq!(BillingCycle::from_str("2w"), None);
    }

    #[test]
    fn test_subscription_takes_precedence_over_order() {
        let corr = GatewayCorrelation::Razorpay {
            subscription_id: Some("sub_123".to_string()),
            order_id: Some("order_456".to_string()),
            payment_id: Some("pay_789".to_string()),
        };
        let (field, value) = corr.lookup_filter().unwrap();
        assert_eq!(field, CorrelationField::SubscriptionId);
        assert_eq!(value, "sub_123");
    }

    #[test]
    fn test_order_takes_precedence_over_payment() {
        let corr = GatewayCorrelation::Razorpay {
            subscription_id: None,
            order_id: Some("order_456".to_string()),
            payment_id: Some("pay_789".to_string()),
        };
        let (field, value) = corr.lookup_filter().unwrap();
        assert_eq!(field, CorrelationField::OrderId);
        assert_eq!(value, "order_456");
    }

    #[test]
    fn test_stripe_payment_intent_fallback() {
        let corr = GatewayCorrelation::Stripe {
            payment_intent_id: Some("pi_abc".to_string()),
            subscription_id: None,
        };
        let (field, value) = corr.lookup_filter().unwrap();
        assert_eq!(field, CorrelationField::PaymentIntentId);
        assert_eq!(value, "pi_abc");
    }

    #[test]
    fn test_empty_correlation_yields_no_filter() {
        let corr = GatewayCorrelation::Paypal {
            subscription_id: None,
            payment_id: None,
        };
        assert!(corr.lookup_filter().is_none());
    }

    #[test]
    fn test_item_type_ledger_source() {
        assert_eq!(ItemType::Song.ledger_source(), "song");
        assert_eq!(ItemType::ArtistSubscription.ledger_source(), "subscription");
    }
}
