use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cdc_error;
use crate::error::{CdcError, CdcResult, ErrorKind};

/// Time-bounded exclusive claim on draining one table.
///
/// Every acquisition gets a fencing token larger than all previous tokens of the table, so a
/// replicator that lost its lease can be told apart from the current holder even if it reuses the
/// same holder id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyLease {
    pub table_name: String,
    pub holder: Uuid,
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
}

impl ApplyLease {
    /// Returns whether the lease is still valid at `now`.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Storage of the per-table apply-leases.
pub trait LeaseStore {
    /// Acquires the lease on `table_name` for `ttl`.
    ///
    /// Succeeds only when the lease is free or expired. A live lease is refused to every caller,
    /// its own holder included, so two passes of one replicator never drain a table together.
    fn acquire_lease(
        &self,
        table_name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> impl Future<Output = CdcResult<Option<ApplyLease>>> + Send;

    /// Releases the lease by expiring it, provided its fencing token is still current.
    ///
    /// Returns whether the lease was released.
    fn release_lease(&self, lease: &ApplyLease) -> impl Future<Output = CdcResult<bool>> + Send;
}

/// Returns when a lease acquired at `now` for `ttl` expires, saturating on overflow.
pub(crate) fn lease_expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Returns whether a persisted lease row still belongs to `lease` at `now`.
pub(crate) fn is_current_lease(
    lease: &ApplyLease,
    holder: &str,
    fencing_token: i64,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    holder == lease.holder.to_string() && fencing_token == lease.fencing_token && now < expires_at
}

/// Error returned by status updates issued under a lease that is no longer current.
pub(crate) fn lease_lost(lease: &ApplyLease) -> CdcError {
    cdc_error!(
        ErrorKind::LeaseLost,
        "Apply-lease is no longer held",
        format!(
            "Lease on table '{}' with token {} expired or was taken over",
            lease.table_name, lease.fencing_token
        )
    )
}
