use async_trait::async_trait;

/// Outcome of a quota reservation.
///
/// `success == false` is the business "limit exceeded" answer, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BillingReservation {
    pub success: bool,
    pub current: u64,
    pub limit: u64,
    /// The order already consumed a slot this period; nothing new was reserved.
    pub already_counted: bool,
}

/// Per-shop order quota.
///
/// Reservation is idempotent per order within a billing period and must be
/// safe under concurrent jobs for the same shop. `Err` means the gate itself
/// failed (infrastructure), which the pipeline retries.
#[async_trait]
pub trait BillingGate: Send + Sync {
    async fn check_and_reserve_billing_slot(
        &self,
        shop_id: &str,
        plan: &str,
        order_id: &str,
    ) -> anyhow::Result<BillingReservation>;

    async fn release_billing_slot(&self, shop_id: &str) -> anyhow::Result<()>;
}
