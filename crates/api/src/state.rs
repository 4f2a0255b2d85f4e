//! Application state

use std::sync::Arc;

use crate::config::Config;
use nestling_billing::BillingService;

/// Shared application state. Database access goes through the billing
/// services, which hold their own pool handles.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(config: Config, billing: BillingService) -> Self {
        Self {
            config,
            billing: Arc::new(billing),
        }
    }
}
