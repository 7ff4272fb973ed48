//! Subscription Store: durable mapping of tenant → set of subscriptions,
//! with an index on `(tenant_id, event_kind, enabled)` for dispatch-time
//! lookup and lock-free counter increments for concurrent fan-out (§4.1, §5).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::RwLock;

use crate::error::{DispatchError, Result};
use crate::types::{
    validate_name, validate_secret, validate_target_url, CreateSubscriptionInput, Filter,
    GlobalStats, ListQuery, Platform, SortField, Subscription, SubscriptionStats,
    UpdateSubscriptionPatch,
};

/// Storage and indexed lookup of subscriptions, independent of whatever
/// durable backend a deployment chooses (persistence engine choice is an
/// external collaborator per the scope notes — this trait is the seam).
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn create(
        &self,
        tenant_id: &str,
        input: CreateSubscriptionInput,
    ) -> Result<Subscription>;

    async fn get(&self, id: &str, tenant_id: &str) -> Result<Subscription>;

    async fn update(
        &self,
        id: &str,
        tenant_id: &str,
        patch: UpdateSubscriptionPatch,
    ) -> Result<Subscription>;

    async fn delete(&self, id: &str, tenant_id: &str) -> Result<()>;

    async fn list(&self, tenant_id: &str, query: ListQuery) -> Result<Vec<Subscription>>;

    /// Returns all enabled subscriptions for `tenant_id` registered against
    /// `event_kind`. Backed by the index; does not scan the full store.
    async fn find_matches(&self, tenant_id: &str, event_kind: &str) -> Result<Vec<Subscription>>;

    async fn regenerate_secret(&self, id: &str, tenant_id: &str) -> Result<String>;

    /// Flips `enabled`. `toggle ∘ toggle` is the identity (§8).
    async fn toggle(&self, id: &str, tenant_id: &str) -> Result<Subscription>;

    /// Sets `enabled` to an explicit value, idempotently.
    async fn set_enabled(&self, id: &str, tenant_id: &str, enabled: bool) -> Result<Subscription>;

    /// Atomic increment; must not require a prior read (§4.1, §5).
    async fn record_success(&self, id: &str) -> Result<()>;

    /// Atomic increment; must not require a prior read (§4.1, §5).
    async fn record_failure(&self, id: &str, error_message: &str) -> Result<()>;

    async fn stats(&self, tenant_id: &str) -> Result<SubscriptionStats>;

    async fn global_stats(&self) -> Result<GlobalStats>;
}

/// Mutable fields that change shape on `update` — kept behind one lock per
/// record so a write never blocks the counters (which live outside it).
struct RecordFields {
    owner_id: Option<String>,
    platform: Platform,
    name: String,
    target_url: String,
    enabled: bool,
    secret: String,
    filters: Option<Filter>,
    extra_headers: std::collections::HashMap<String, String>,
    last_error: Option<String>,
    updated_at: chrono::DateTime<Utc>,
}

struct Entry {
    id: String,
    tenant_id: String,
    event_kind: crate::types::EventKind,
    created_at: chrono::DateTime<Utc>,
    fields: RwLock<RecordFields>,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    last_triggered_at: RwLock<Option<chrono::DateTime<Utc>>>,
}

impl Entry {
    async fn to_subscription(&self) -> Subscription {
        let fields = self.fields.read().await;
        Subscription {
            id: self.id.clone(),
            tenant_id: self.tenant_id.clone(),
            owner_id: fields.owner_id.clone(),
            platform: fields.platform,
            name: fields.name.clone(),
            target_url: fields.target_url.clone(),
            event_kind: self.event_kind,
            enabled: fields.enabled,
            secret: fields.secret.clone(),
            filters: fields.filters.clone(),
            extra_headers: fields.extra_headers.clone(),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            last_triggered_at: *self.last_triggered_at.read().await,
            last_error: fields.last_error.clone(),
            created_at: self.created_at,
            updated_at: fields.updated_at,
        }
    }
}

/// Index key: `(tenant_id, event_kind)`. Enabled-ness is checked against
/// the live record at read time rather than tracked in the index, since
/// toggling enabled is far more frequent than changing event_kind.
type IndexKey = (String, &'static str);

/// Reference in-memory implementation of `SubscriptionStore`. Suitable as
/// the default backend and as the store under test; a durable backend can
/// implement the same trait without touching the router or delivery engine.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    records: DashMap<String, Arc<Entry>>,
    index: DashMap<IndexKey, DashSet<String>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_key(tenant_id: &str, event_kind: crate::types::EventKind) -> IndexKey {
        (tenant_id.to_string(), event_kind.as_str())
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn create(&self, tenant_id: &str, input: CreateSubscriptionInput) -> Result<Subscription> {
        validate_name(&input.name)?;
        validate_target_url(&input.target_url)?;
        if let Some(filters) = &input.filters {
            filters.validate_operators()?;
        }
        let secret = match input.secret {
            Some(s) => {
                validate_secret(&s)?;
                s
            }
            None => crate::config::generate_secret(),
        };

        let now = Utc::now();
        let id = crate::types::new_id();
        let entry = Arc::new(Entry {
            id: id.clone(),
            tenant_id: tenant_id.to_string(),
            event_kind: input.event_kind,
            created_at: now,
            fields: RwLock::new(RecordFields {
                owner_id: input.owner_id,
                platform: input.platform,
                name: input.name,
                target_url: input.target_url,
                enabled: input.enabled.unwrap_or(true),
                secret,
                filters: input.filters,
                extra_headers: input.extra_headers,
                last_error: None,
                updated_at: now,
            }),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            last_triggered_at: RwLock::new(None),
        });

        self.records.insert(id.clone(), entry.clone());
        self.index
            .entry(Self::index_key(tenant_id, input.event_kind))
            .or_default()
            .insert(id);

        Ok(entry.to_subscription().await)
    }

    async fn get(&self, id: &str, tenant_id: &str) -> Result<Subscription> {
        let entry = self
            .records
            .get(id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| DispatchError::not_found(id))?
            .clone();
        Ok(entry.to_subscription().await)
    }

    async fn update(
        &self,
        id: &str,
        tenant_id: &str,
        patch: UpdateSubscriptionPatch,
    ) -> Result<Subscription> {
        let entry = self
            .records
            .get(id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| DispatchError::not_found(id))?
            .clone();

        if let Some(name) = &patch.name {
            validate_name(name)?;
        }
        if let Some(url) = &patch.target_url {
            validate_target_url(url)?;
        }
        if let Some(filters) = &patch.filters {
            filters.validate_operators()?;
        }
        // event_kind changes the index bucket; re-index under the same lock
        // that is about to protect the field mutation to avoid a window
        // where find_matches sees neither the old nor the new bucket.
        let old_kind = entry.event_kind;

        {
            let mut fields = entry.fields.write().await;
            if let Some(v) = patch.platform {
                fields.platform = v;
            }
            if let Some(v) = patch.name {
                fields.name = v;
            }
            if let Some(v) = patch.target_url {
                fields.target_url = v;
            }
            if let Some(v) = patch.enabled {
                fields.enabled = v;
            }
            if let Some(v) = patch.filters {
                fields.filters = Some(v);
            }
            if let Some(v) = patch.extra_headers {
                fields.extra_headers = v;
            }
            fields.updated_at = Utc::now();
        }

        if let Some(new_kind) = patch.event_kind {
            if new_kind.as_str() != old_kind.as_str() {
                if let Some(set) = self.index.get(&Self::index_key(tenant_id, old_kind)) {
                    set.remove(id);
                }
                self.index
                    .entry(Self::index_key(tenant_id, new_kind))
                    .or_default()
                    .insert(id.to_string());

                // event_kind lives outside the per-record lock (it never
                // changes in the hot path), so changing it means building a
                // fresh Entry with a snapshot of the just-updated fields and
                // the current counter values, then swapping it in.
                let snapshot = {
                    let fields = entry.fields.read().await;
                    RecordFields {
                        owner_id: fields.owner_id.clone(),
                        platform: fields.platform,
                        name: fields.name.clone(),
                        target_url: fields.target_url.clone(),
                        enabled: fields.enabled,
                        secret: fields.secret.clone(),
                        filters: fields.filters.clone(),
                        extra_headers: fields.extra_headers.clone(),
                        last_error: fields.last_error.clone(),
                        updated_at: fields.updated_at,
                    }
                };
                let rebuilt = Arc::new(Entry {
                    id: entry.id.clone(),
                    tenant_id: entry.tenant_id.clone(),
                    event_kind: new_kind,
                    created_at: entry.created_at,
                    fields: RwLock::new(snapshot),
                    success_count: AtomicU64::new(entry.success_count.load(Ordering::Relaxed)),
                    failure_count: AtomicU64::new(entry.failure_count.load(Ordering::Relaxed)),
                    last_triggered_at: RwLock::new(*entry.last_triggered_at.read().await),
                });
                self.records.insert(id.to_string(), rebuilt.clone());
                return Ok(rebuilt.to_subscription().await);
            }
        }

        Ok(entry.to_subscription().await)
    }

    async fn delete(&self, id: &str, tenant_id: &str) -> Result<()> {
        let entry = self
            .records
            .get(id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| DispatchError::not_found(id))?
            .clone();
        self.records.remove(id);
        if let Some(set) = self.index.get(&Self::index_key(tenant_id, entry.event_kind)) {
            set.remove(id);
        }
        Ok(())
    }

    async fn list(&self, tenant_id: &str, query: ListQuery) -> Result<Vec<Subscription>> {
        let mut matching = Vec::new();
        for entry in self.records.iter() {
            if entry.tenant_id != tenant_id {
                continue;
            }
            matching.push(entry.value().clone());
        }

        let mut subs = Vec::with_capacity(matching.len());
        for entry in &matching {
            subs.push(entry.to_subscription().await);
        }

        subs.retain(|s| {
            if let Some(platform) = query.platform {
                if s.platform != platform {
                    return false;
                }
            }
            if let Some(enabled) = query.enabled {
                if s.enabled != enabled {
                    return false;
                }
            }
            if let Some(search) = &query.search {
                let needle = search.to_lowercase();
                if !s.name.to_lowercase().contains(&needle) {
                    return false;
                }
            }
            true
        });

        sort_subscriptions(&mut subs, query.sort);

        let start = (query.page as usize) * (query.limit as usize);
        Ok(subs.into_iter().skip(start).take(query.limit as usize).collect())
    }

    async fn find_matches(&self, tenant_id: &str, event_kind: &str) -> Result<Vec<Subscription>> {
        let Some(kind) = crate::types::EventKind::parse(event_kind) else {
            return Ok(Vec::new());
        };
        let Some(ids) = self.index.get(&Self::index_key(tenant_id, kind)) else {
            return Ok(Vec::new());
        };

        let mut candidates = Vec::new();
        for id in ids.iter() {
            if let Some(entry) = self.records.get(id.as_str()) {
                candidates.push(entry.value().clone());
            }
        }
        drop(ids);

        let mut out = Vec::new();
        for entry in &candidates {
            let sub = entry.to_subscription().await;
            if sub.enabled {
                out.push(sub);
            }
        }
        Ok(out)
    }

    async fn regenerate_secret(&self, id: &str, tenant_id: &str) -> Result<String> {
        let entry = self
            .records
            .get(id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| DispatchError::not_found(id))?
            .clone();
        let new_secret = crate::config::generate_secret();
        let mut fields = entry.fields.write().await;
        fields.secret = new_secret.clone();
        fields.updated_at = Utc::now();
        Ok(new_secret)
    }

    async fn toggle(&self, id: &str, tenant_id: &str) -> Result<Subscription> {
        let entry = self
            .records
            .get(id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| DispatchError::not_found(id))?
            .clone();
        {
            let mut fields = entry.fields.write().await;
            fields.enabled = !fields.enabled;
            fields.updated_at = Utc::now();
        }
        Ok(entry.to_subscription().await)
    }

    async fn set_enabled(&self, id: &str, tenant_id: &str, enabled: bool) -> Result<Subscription> {
        let entry = self
            .records
            .get(id)
            .filter(|e| e.tenant_id == tenant_id)
            .ok_or_else(|| DispatchError::not_found(id))?
            .clone();
        {
            let mut fields = entry.fields.write().await;
            fields.enabled = enabled;
            fields.updated_at = Utc::now();
        }
        Ok(entry.to_subscription().await)
    }

    async fn record_success(&self, id: &str) -> Result<()> {
        let entry = self.records.get(id).ok_or_else(|| DispatchError::not_found(id))?.clone();
        entry.success_count.fetch_add(1, Ordering::SeqCst);
        *entry.last_triggered_at.write().await = Some(Utc::now());
        entry.fields.write().await.last_error = None;
        Ok(())
    }

    async fn record_failure(&self, id: &str, error_message: &str) -> Result<()> {
        let entry = self.records.get(id).ok_or_else(|| DispatchError::not_found(id))?.clone();
        entry.failure_count.fetch_add(1, Ordering::SeqCst);
        *entry.last_triggered_at.write().await = Some(Utc::now());
        let truncated: String = error_message.chars().take(500).collect();
        entry.fields.write().await.last_error = Some(truncated);
        Ok(())
    }

    async fn stats(&self, tenant_id: &str) -> Result<SubscriptionStats> {
        let mut stats = SubscriptionStats {
            total: 0,
            enabled: 0,
            by_platform: Default::default(),
            by_event_kind: Default::default(),
            success_count: 0,
            failure_count: 0,
        };
        let matching: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.tenant_id == tenant_id)
            .map(|entry| entry.value().clone())
            .collect();

        for entry in &matching {
            let sub = entry.to_subscription().await;
            stats.total += 1;
            if sub.enabled {
                stats.enabled += 1;
            }
            *stats.by_platform.entry(sub.platform.to_string()).or_insert(0) += 1;
            *stats.by_event_kind.entry(sub.event_kind.to_string()).or_insert(0) += 1;
            stats.success_count += sub.success_count;
            stats.failure_count += sub.failure_count;
        }
        Ok(stats)
    }

    async fn global_stats(&self) -> Result<GlobalStats> {
        let mut total = 0u64;
        let mut enabled = 0u64;
        let mut with_failures = 0u64;
        let mut successes = 0u64;
        let mut failures = 0u64;
        let mut by_platform = std::collections::HashMap::new();

        let all: Vec<_> = self.records.iter().map(|entry| entry.value().clone()).collect();
        for entry in &all {
            let sub = entry.to_subscription().await;
            total += 1;
            if sub.enabled {
                enabled += 1;
            }
            if sub.failure_count > 0 {
                with_failures += 1;
            }
            successes += sub.success_count;
            failures += sub.failure_count;
            *by_platform.entry(sub.platform.to_string()).or_insert(0) += 1;
        }

        let total_deliveries = successes + failures;
        let success_rate = if total_deliveries == 0 {
            0.0
        } else {
            (successes as f64 / total_deliveries as f64 * 100.0 * 100.0).round() / 100.0
        };

        Ok(GlobalStats {
            total,
            enabled,
            with_failures,
            total_deliveries,
            success_rate,
            by_platform,
        })
    }
}

fn sort_subscriptions(subs: &mut [Subscription], sort: SortField) {
    subs.sort_by(|a, b| match sort {
        SortField::CreatedAt => b.created_at.cmp(&a.created_at),
        SortField::UpdatedAt => b.updated_at.cmp(&a.updated_at),
        SortField::Name => a.name.cmp(&b.name),
        SortField::SuccessCount => b.success_count.cmp(&a.success_count),
        SortField::FailureCount => b.failure_count.cmp(&a.failure_count),
        SortField::LastTriggeredAt => b.last_triggered_at.cmp(&a.last_triggered_at),
        SortField::Platform => a.platform.to_string().cmp(&b.platform.to_string()),
        SortField::Enabled => b.enabled.cmp(&a.enabled),
    });
}
