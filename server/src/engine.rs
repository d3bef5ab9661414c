//! The engine: storage, processor and clock wired together.
//!
//! Every operation lives in its own module as an `impl Engine` block:
//! [`crate::orchestrator`], [`crate::recovery`], [`crate::vouchers`],
//! [`crate::callbacks`] and [`crate::admin`].

use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;
use ticket_engine_core::allocation::AllocationPolicy;
use ticket_engine_core::environment::Clock;
use ticket_engine_core::gateway::PaymentGateway;
use ticket_engine_core::retry::RetryPolicy;
use ticket_engine_core::store::TicketStore;

/// Reconciliation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationSettings {
    /// Pause between sweeps.
    pub interval: Duration,
    /// Minimum time a record sits unsettled before a sweep picks it up.
    pub stale_after: chrono::Duration,
    /// Age after which a payment still missing upstream is marked failed.
    pub abandon_after: chrono::Duration,
    /// Records examined per sweep.
    pub batch_size: u32,
    /// Backoff for provider calls made while recovering.
    pub retry: RetryPolicy,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            stale_after: chrono::Duration::minutes(2),
            abandon_after: chrono::Duration::days(1),
            batch_size: 50,
            retry: RetryPolicy::default(),
        }
    }
}

/// Tunables that are configuration rather than code.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EngineSettings {
    /// Allocation rules.
    pub allocation: AllocationPolicy,
    /// Reconciliation worker settings.
    pub reconciliation: ReconciliationSettings,
    /// Backoff while a freshly created payment becomes visible upstream.
    pub approval_retry: RetryPolicy,
}

impl EngineSettings {
    /// Settings described by the service configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let reconciliation = &config.reconciliation;
        let retry = reconciliation.retry_policy();
        Self {
            allocation: config.allocation.policy(),
            reconciliation: ReconciliationSettings {
                interval: Duration::from_secs(reconciliation.interval),
                stale_after: seconds(reconciliation.stale_after),
                abandon_after: seconds(reconciliation.abandon_after),
                batch_size: reconciliation.batch_size,
                retry: retry.clone(),
            },
            approval_retry: retry,
        }
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX))
}

/// Ticket issuance and payment reconciliation.
///
/// Stateless apart from its collaborators, so any number of instances may run
/// against the same store. Clones share collaborators.
#[derive(Clone)]
pub struct Engine {
    pub(crate) store: Arc<dyn TicketStore>,
    pub(crate) gateway: Arc<dyn PaymentGateway>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: EngineSettings,
}

impl Engine {
    /// Create an engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn TicketStore>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            settings,
        }
    }

    /// The storage backend.
    #[must_use]
    pub fn store(&self) -> &dyn TicketStore {
        self.store.as_ref()
    }

    /// Current settings.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(crate) const fn policy(&self) -> &AllocationPolicy {
        &self.settings.allocation
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
