pub mod apple;
pub mod google;
pub mod recurly;
pub mod stripe;

use axum::http::HeaderMap;
use revback_core::error::AppError;
use revback_core::models::{NormalizedEvent, Source};

/// A per-provider webhook normalizer. Implementations are stateless; the
/// connection's decrypted secret is passed in per call rather than stored,
/// since a given process handles many orgs' connections for the same
/// provider.
pub trait Normalizer: Send + Sync {
    fn source(&self) -> Source;

    /// Verify the inbound payload against the connection's secret using the
    /// provider's signature scheme. Fails closed: any parse error or scheme
    /// mismatch is a verification failure, never a panic.
    fn verify_signature(&self, headers: &HeaderMap, body: &[u8], secret: &str) -> bool;

    /// Parse the raw payload into zero or more canonical events, each
    /// carrying its own identity hints. Unrecognized event types produce an
    /// empty vector; this is not an error.
    fn normalize(&self, body: &[u8]) -> Result<Vec<NormalizedEvent>, AppError>;
}

/// Process-wide mapping from provider tag to normalizer implementation.
/// Built once at startup and handed down explicitly — not an ambient
/// singleton — per the "global mutable state" design note.
pub struct NormalizerRegistry {
    stripe: stripe::StripeNormalizer,
    apple: apple::AppleNormalizer,
    google: google::GoogleNormalizer,
    recurly: recurly::RecurlyNormalizer,
}

impl Default for NormalizerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NormalizerRegistry {
    pub fn new() -> Self {
        Self {
            stripe: stripe::StripeNormalizer,
            apple: apple::AppleNormalizer,
            google: google::GoogleNormalizer,
            recurly: recurly::RecurlyNormalizer,
        }
    }

    pub fn get(&self, source: Source) -> &dyn Normalizer {
        match source {
            Source::Stripe => &self.stripe,
            Source::Apple => &self.apple,
            Source::Google => &self.google,
            Source::Recurly => &self.recurly,
        }
    }
}
