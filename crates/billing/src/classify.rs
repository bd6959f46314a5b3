//! Purchase intent classification
//!
//! The origin system can deliver the same purchase information on up to four
//! different objects. `resolve_purchase_intent` collapses that into one
//! immutable [`ClassificationResult`] via a strict precedence chain:
//!
//! 1. explicit per-session use-case tag
//! 2. checkout-session metadata
//! 3. subscription metadata
//! 4. payment-intent / charge metadata
//!
//! First non-empty source wins; the default is a site purchase. Unrecognized
//! tags are processed as site purchases with a warning, never dropped.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use keymint_shared::PurchaseType;

/// Metadata keys the origin system uses for intent tagging
const USE_CASE_KEY: &str = "use_case";
const QUANTITY_KEY: &str = "quantity";
const LICENSE_KEYS_KEY: &str = "license_keys";

/// What the checkout was for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseIntent {
    SitePurchase,
    QuantityPurchase,
    /// Tag present but not understood; handled as a site purchase downstream
    Unrecognized,
}

impl PurchaseIntent {
    /// The purchase type actually applied downstream. Unrecognized intents
    /// fall through to site handling rather than being dropped.
    pub fn effective_purchase_type(&self) -> PurchaseType {
        match self {
            PurchaseIntent::QuantityPurchase => PurchaseType::Quantity,
            PurchaseIntent::SitePurchase | PurchaseIntent::Unrecognized => PurchaseType::Site,
        }
    }
}

/// Immutable classification of one checkout, resolved once and passed
/// downward. Carries the raw fields the orchestrator needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent: PurchaseIntent,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub payment_intent_id: Option<String>,
    /// Declared unit count for quantity purchases (defaults to 1)
    pub quantity: i64,
    /// Pre-generated license keys delivered in metadata, if any
    pub license_keys: Vec<String>,
}

impl ClassificationResult {
    pub fn purchase_type(&self) -> PurchaseType {
        self.intent.effective_purchase_type()
    }
}

/// The four metadata sources, in precedence order
#[derive(Debug, Default)]
pub struct IntentSources<'a> {
    /// Explicit per-session use-case tag (highest precedence)
    pub session_use_case: Option<&'a str>,
    pub session_metadata: Option<&'a HashMap<String, String>>,
    pub subscription_metadata: Option<&'a HashMap<String, String>>,
    pub payment_intent_metadata: Option<&'a HashMap<String, String>>,
}

impl<'a> IntentSources<'a> {
    /// First non-empty use-case tag across all sources, in precedence order
    fn first_use_case(&self) -> Option<&'a str> {
        if let Some(tag) = self.session_use_case.filter(|s| !s.is_empty()) {
            return Some(tag);
        }
        for metadata in [
            self.session_metadata,
            self.subscription_metadata,
            self.payment_intent_metadata,
        ]
        .into_iter()
        .flatten()
        {
            if let Some(tag) = metadata.get(USE_CASE_KEY).filter(|s| !s.is_empty()) {
                return Some(tag);
            }
        }
        None
    }

    /// First occurrence of a metadata key across the sources
    fn first_value(&self, key: &str) -> Option<&'a str> {
        for metadata in [
            self.session_metadata,
            self.subscription_metadata,
            self.payment_intent_metadata,
        ]
        .into_iter()
        .flatten()
        {
            if let Some(v) = metadata.get(key).filter(|s| !s.is_empty()) {
                return Some(v);
            }
        }
        None
    }
}

/// Resolve purchase intent from the redundant metadata sources.
///
/// Never fails: an absent or unknown tag yields `SitePurchase` /
/// `Unrecognized` respectively, so a confirmed payment is always processed.
pub fn resolve_purchase_intent(
    sources: &IntentSources<'_>,
    customer_id: Option<String>,
    subscription_id: Option<String>,
    payment_intent_id: Option<String>,
) -> ClassificationResult {
    let intent = match sources.first_use_case() {
        None => PurchaseIntent::SitePurchase,
        Some(tag) => match tag {
            "site" | "site_purchase" => PurchaseIntent::SitePurchase,
            "quantity" | "quantity_purchase" | "bulk" => PurchaseIntent::QuantityPurchase,
            other => {
                tracing::warn!(
                    use_case = %other,
                    "Unrecognized purchase use case - processing as site purchase"
                );
                PurchaseIntent::Unrecognized
            }
        },
    };

    let quantity = sources
        .first_value(QUANTITY_KEY)
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(1);

    let license_keys = sources
        .first_value(LICENSE_KEYS_KEY)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    ClassificationResult {
        intent,
        customer_id,
        subscription_id,
        payment_intent_id,
        quantity,
        license_keys,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_default_is_site_purchase() {
        let result = resolve_purchase_intent(&IntentSources::default(), None, None, None);
        assert_eq!(result.intent, PurchaseIntent::SitePurchase);
        assert_eq!(result.quantity, 1);
        assert!(result.license_keys.is_empty());
    }

    #[test]
    fn test_session_tag_beats_all_metadata() {
        let session = meta(&[(USE_CASE_KEY, "site")]);
        let subscription = meta(&[(USE_CASE_KEY, "quantity")]);
        let sources = IntentSources {
            session_use_case: Some("quantity"),
            session_metadata: Some(&session),
            subscription_metadata: Some(&subscription),
            payment_intent_metadata: None,
        };
        let result = resolve_purchase_intent(&sources, None, None, None);
        assert_eq!(result.intent, PurchaseIntent::QuantityPurchase);
    }

    #[test]
    fn test_session_metadata_beats_subscription_metadata() {
        let session = meta(&[(USE_CASE_KEY, "site")]);
        let subscription = meta(&[(USE_CASE_KEY, "quantity")]);
        let sources = IntentSources {
            session_use_case: None,
            session_metadata: Some(&session),
            subscription_metadata: Some(&subscription),
            payment_intent_metadata: None,
        };
        let result = resolve_purchase_intent(&sources, None, None, None);
        assert_eq!(result.intent, PurchaseIntent::SitePurchase);
    }

    #[test]
    fn test_subscription_metadata_beats_payment_intent() {
        let subscription = meta(&[(USE_CASE_KEY, "quantity")]);
        let payment_intent = meta(&[(USE_CASE_KEY, "site")]);
        let sources = IntentSources {
            session_use_case: None,
            session_metadata: None,
            subscription_metadata: Some(&subscription),
            payment_intent_metadata: Some(&payment_intent),
        };
        let result = resolve_purchase_intent(&sources, None, None, None);
        assert_eq!(result.intent, PurchaseIntent::QuantityPurchase);
    }

    #[test]
    fn test_payment_intent_metadata_used_last() {
        let payment_intent = meta(&[(USE_CASE_KEY, "quantity")]);
        let sources = IntentSources {
            session_use_case: None,
            session_metadata: None,
            subscription_metadata: None,
            payment_intent_metadata: Some(&payment_intent),
        };
        let result = resolve_purchase_intent(&sources, None, None, None);
        assert_eq!(result.intent, PurchaseIntent::QuantityPurchase);
    }

    #[test]
    fn test_empty_tag_falls_through() {
        let session = meta(&[(USE_CASE_KEY, "")]);
        let subscription = meta(&[(USE_CASE_KEY, "quantity")]);
        let sources = IntentSources {
            session_use_case: None,
            session_metadata: Some(&session),
            subscription_metadata: Some(&subscription),
            payment_intent_metadata: None,
        };
        let result = resolve_purchase_intent(&sources, None, None, None);
        assert_eq!(result.intent, PurchaseIntent::QuantityPurchase);
    }

    #[test]
    fn test_unrecognized_maps_to_site_handling() {
        let session = meta(&[(USE_CASE_KEY, "mystery_flow")]);
        let sources = IntentSources {
            session_metadata: Some(&session),
            ..Default::default()
        };
        let result = resolve_purchase_intent(&sources, None, None, None);
        assert_eq!(result.intent, PurchaseIntent::Unrecognized);
        assert_eq!(result.purchase_type(), PurchaseType::Site);
    }

    #[test]
    fn test_quantity_and_license_keys_extraction() {
        let session = meta(&[
            (USE_CASE_KEY, "quantity"),
            (QUANTITY_KEY, "3"),
            (LICENSE_KEYS_KEY, "KM-AAA, KM-BBB,KM-CCC"),
        ]);
        let sources = IntentSources {
            session_metadata: Some(&session),
            ..Default::default()
        };
        let result = resolve_purchase_intent(
            &sources,
            Some("cus_1".into()),
            None,
            Some("pi_1".into()),
        );
        assert_eq!(result.quantity, 3);
        assert_eq!(result.license_keys, vec!["KM-AAA", "KM-BBB", "KM-CCC"]);
        assert_eq!(result.customer_id.as_deref(), Some("cus_1"));
    }
}
