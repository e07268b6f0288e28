//! # Stage: Provider Health
//!
//! ## Responsibility
//! Hold point-in-time provider availability and refresh it on a schedule.
//!
//! ## Guarantees
//! - Atomic reads: [`HealthRegistry::snapshot`] returns one immutable
//!   [`HealthSnapshot`]; concurrent updates never show up mid-read.
//! - Copy-on-write: updates build a new snapshot and swap the pointer.
//! - Conservative: a provider with no recorded health is unavailable.
//!
//! ## NOT Responsible For
//! - Choosing a provider (that belongs to `routing::router`)
//! - Deciding how a provider is probed (each adapter's `probe()` does)

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::ProviderRegistry;
use crate::routing::ProviderId;

/// Read-only availability view consumed by the router.
pub trait ProviderHealthView {
    /// `true` when `provider` may be called.
    fn is_available(&self, provider: ProviderId) -> bool;

    /// Why `provider` is unavailable, if known.
    fn reason(&self, provider: ProviderId) -> Option<String>;
}

/// Availability of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderHealth {
    /// Whether the provider may be called.
    pub available: bool,
    /// Diagnostic reason, usually set when unavailable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProviderHealth {
    /// Healthy, no reason.
    pub fn available() -> Self {
        Self {
            available: true,
            reason: None,
        }
    }

    /// Unhealthy with a reason.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            reason: Some(reason.into()),
        }
    }
}

/// Immutable availability map for a single routing decision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    entries: HashMap<ProviderId, ProviderHealth>,
}

impl HealthSnapshot {
    /// Health of `provider`, if recorded.
    pub fn get(&self, provider: ProviderId) -> Option<&ProviderHealth> {
        self.entries.get(&provider)
    }

    /// A copy with `provider` set to `health`.
    pub fn with(&self, provider: ProviderId, health: ProviderHealth) -> Self {
        let mut entries = self.entries.clone();
        entries.insert(provider, health);
        Self { entries }
    }

    /// Providers currently available.
    pub fn available_providers(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self
            .entries
            .iter()
            .filter(|(_, h)| h.available)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Number of recorded providers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// `true` when nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(ProviderId, ProviderHealth)> for HealthSnapshot {
    fn from_iter<I: IntoIterator<Item = (ProviderId, ProviderHealth)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl ProviderHealthView for HealthSnapshot {
    fn is_available(&self, provider: ProviderId) -> bool {
        self.entries.get(&provider).is_some_and(|h| h.available)
    }

    fn reason(&self, provider: ProviderId) -> Option<String> {
        match self.entries.get(&provider) {
            None => Some("no health data".to_string()),
            Some(h) if h.available => None,
            Some(h) => Some(
                h.reason
                    .clone()
                    .unwrap_or_else(|| "marked unavailable".to_string()),
            ),
        }
    }
}

/// Source of health snapshots for the dispatch facade.
pub trait HealthSource: Send + Sync {
    /// A consistent point-in-time view.
    fn snapshot(&self) -> Arc<HealthSnapshot>;
}

/// A fixed snapshot; useful for tests and one-shot runs.
impl HealthSource for HealthSnapshot {
    fn snapshot(&self) -> Arc<HealthSnapshot> {
        Arc::new(self.clone())
    }
}

/// Shared, externally refreshed health state.
///
/// # Panics
///
/// This type and its methods never panic; lock poisoning is recovered.
#[derive(Debug, Default)]
pub struct HealthRegistry {
    current: RwLock<Arc<HealthSnapshot>>,
}

impl HealthRegistry {
    /// Empty registry: every provider starts unavailable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry seeded with `snapshot`.
    pub fn with_snapshot(snapshot: HealthSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Record the health of a single provider.
    pub fn update(&self, provider: ProviderId, health: ProviderHealth) {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = guard.with(provider, health);
        *guard = Arc::new(next);
    }

    /// Replace the whole snapshot.
    pub fn replace(&self, snapshot: HealthSnapshot) {
        let mut guard = match self.current.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Arc::new(snapshot);
    }
}

impl HealthSource for HealthRegistry {
    fn snapshot(&self) -> Arc<HealthSnapshot> {
        match self.current.read() {
            Ok(g) => Arc::clone(&g),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }
}

/// Probe every registered provider once and publish the results as one
/// snapshot.
pub async fn probe_all(registry: &HealthRegistry, providers: &ProviderRegistry) {
    let mut next = HealthSnapshot::default();
    for (id, provider) in providers.iter() {
        let health = provider.probe().await;
        if health.available {
            debug!(provider = %id, "provider healthy");
        } else {
            warn!(
                provider = %id,
                reason = health.reason.as_deref().unwrap_or("unknown"),
                "provider unavailable"
            );
        }
        next = next.with(id, health);
    }
    registry.replace(next);
}

/// Spawn a task that calls [`probe_all`] every `interval` until `shutdown`
/// is cancelled. The first probe runs immediately.
pub fn spawn_prober(
    registry: Arc<HealthRegistry>,
    providers: Arc<ProviderRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    probe_all(&registry, &providers).await;
                }
                _ = shutdown.cancelled() => {
                    info!("health prober shutting down");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_provider_is_unavailable_with_reason() {
        let snap = HealthSnapshot::default();
        assert!(!snap.is_available(ProviderId::Groq));
        assert_eq!(snap.reason(ProviderId::Groq).as_deref(), Some("no health data"));
    }

    #[test]
    fn test_available_provider_has_no_reason() {
        let snap = HealthSnapshot::default().with(ProviderId::Groq, ProviderHealth::available());
        assert!(snap.is_available(ProviderId::Groq));
        assert!(snap.reason(ProviderId::Groq).is_none());
    }

    #[test]
    fn test_registry_update_does_not_touch_old_snapshots() {
        let registry = HealthRegistry::new();
        let before = registry.snapshot();
        registry.update(ProviderId::Gemini, ProviderHealth::available());
        let after = registry.snapshot();
        assert!(!before.is_available(ProviderId::Gemini));
        assert!(after.is_available(ProviderId::Gemini));
    }

    #[test]
    fn test_available_providers_sorted() {
        let snap: HealthSnapshot = [
            (ProviderId::Pollinations, ProviderHealth::available()),
            (ProviderId::Gemini, ProviderHealth::available()),
            (ProviderId::Groq, ProviderHealth::unavailable("down")),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            snap.available_providers(),
            vec![ProviderId::Gemini, ProviderId::Pollinations]
        );
        assert_eq!(snap.len(), 3);
    }

    #[tokio::test]
    async fn test_probe_all_records_every_provider() {
        let providers = ProviderRegistry::new()
            .with(Arc::new(crate::provider::echo::EchoProvider::new()));
        let registry = HealthRegistry::new();
        probe_all(&registry, &providers).await;
        assert!(registry.snapshot().is_available(ProviderId::Echo));
    }

    #[tokio::test]
    async fn test_prober_stops_on_cancel() {
        let providers = Arc::new(
            ProviderRegistry::new().with(Arc::new(crate::provider::echo::EchoProvider::new())),
        );
        let registry = Arc::new(HealthRegistry::new());
        let shutdown = CancellationToken::new();
        let handle = spawn_prober(
            Arc::clone(&registry),
            providers,
            Duration::from_millis(10),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        handle.await.expect("test: prober joins");
        assert!(registry.snapshot().is_available(ProviderId::Echo));
    }
}
