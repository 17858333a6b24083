//! Application state

use meterline_billing::BillingService;
use time::OffsetDateTime;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub billing: BillingService,
    pub started_at: OffsetDateTime,
}

impl AppState {
    pub fn new(billing: BillingService) -> Self {
        Self {
            billing,
            started_at: OffsetDateTime::now_utc(),
        }
    }
}
