//! Stripe client wrapper and outbound-call retry policy

use std::time::Duration;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// Stripe configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Signing secret for inbound webhooks (`whsec_…`).
    pub webhook_secret: String,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Shared Stripe client.
///
/// Cheap to clone; every billing service holds one.
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    /// Run an outbound Stripe call with bounded exponential backoff.
    ///
    /// Only transient failures (timeouts, 429, 5xx) are retried; 4xx
    /// validation errors surface immediately.
    pub async fn retry<T, F, Fut>(&self, operation: &str, mut call: F) -> BillingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, stripe::StripeError>>,
    {
        let strategy = ExponentialBackoff::from_millis(200)
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(3);

        let result = RetryIf::spawn(
            strategy,
            || call(),
            |e: &stripe::StripeError| {
                let transient = is_transient(e);
                if transient {
                    tracing::warn!(
                        operation = operation,
                        error = %e,
                        "Transient Stripe error, retrying with backoff"
                    );
                }
                transient
            },
        )
        .await;

        result.map_err(|e| {
            tracing::error!(operation = operation, error = %e, "Stripe API call failed");
            BillingError::Stripe(e)
        })
    }
}

impl std::fmt::Debug for StripeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret key.
        f.debug_struct("StripeClient").finish_non_exhaustive()
    }
}

/// Rate limits (429), server errors (5xx) and timeouts are worth retrying;
/// everything else is a caller mistake and surfaces immediately.
fn is_transient(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}
