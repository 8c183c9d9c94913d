//! TTL cache in front of the [`RoleStore`].
//!
//! Per-user assignments and the role catalogue are cached separately; both
//! expire after the configured TTL. Any role mutation must call
//! [`RoleCache::invalidate`] for the affected user.
//!
//! Every invalidation bumps a per-user generation. A lookup that started
//! before the bump does not publish its result, so an in-flight read cannot
//! bring back a role that was just changed.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rbac_core::{Rank, RankRequirements, Role};
use tracing::{debug, warn};

use super::RbacError;
use super::store::RoleStore;
use crate::clock::{SharedClock, elapsed};

/// A user's tenant and role as seen by the policy engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    /// Tenant of the user record.
    pub tenant_id: String,
    /// Assigned role.
    pub role: Option<Role>,
}

/// Role catalogue and rank overrides.
#[derive(Debug, Clone)]
pub struct Catalogue {
    /// Roles, as stored.
    pub roles: Vec<Role>,
    /// Rank overrides.
    pub requirements: RankRequirements,
    /// Highest rank in `roles`.
    pub top_rank: Rank,
}

impl Catalogue {
    /// Build a catalogue. An empty role list has a top rank of zero.
    #[must_use]
    pub fn new(roles: Vec<Role>, requirements: RankRequirements) -> Self {
        let top_rank = rbac_core::top_rank(&roles).unwrap_or(0);
        Self {
            roles,
            requirements,
            top_rank,
        }
    }

    /// Role by id, or by name ignoring case.
    #[must_use]
    pub fn find(&self, id_or_name: &str) -> Option<&Role> {
        self.roles
            .iter()
            .find(|r| r.id == id_or_name)
            .or_else(|| {
                self.roles
                    .iter()
                    .find(|r| r.name.eq_ignore_ascii_case(id_or_name))
            })
    }

    /// Rank of the role with id `role_id`.
    #[must_use]
    pub fn rank_of(&self, role_id: &str) -> Option<Rank> {
        self.roles.iter().find(|r| r.id == role_id).map(|r| r.rank)
    }
}

struct Cached<T> {
    value: T,
    cached_at: DateTime<Utc>,
}

/// Cached view of a [`RoleStore`] with bounded lookup latency.
pub struct RoleCache {
    store: Arc<dyn RoleStore>,
    assignments: DashMap<String, Cached<Option<Assignment>>>,
    generations: DashMap<String, u64>,
    epoch: AtomicU64,
    catalogue: RwLock<Option<Cached<Arc<Catalogue>>>>,
    clock: SharedClock,
    ttl: Duration,
    lookup_timeout: Duration,
}

/// Position of one user's cache slot in the invalidation history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Generation {
    epoch: u64,
    user: u64,
}

impl RoleCache {
    /// Create a cache over `store`.
    pub fn new(
        store: Arc<dyn RoleStore>,
        clock: SharedClock,
        ttl: Duration,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            store,
            assignments: DashMap::new(),
            generations: DashMap::new(),
            epoch: AtomicU64::new(0),
            catalogue: RwLock::new(None),
            clock,
            ttl,
            lookup_timeout,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RoleStore> {
        &self.store
    }

    /// Tenant and role of `user_id`; `None` when the store has no record.
    pub async fn assignment(&self, user_id: &str) -> Result<Option<Assignment>, RbacError> {
        let now = self.clock.now();
        if let Some(hit) = self.assignments.get(user_id) {
            if elapsed(hit.cached_at, now) < self.ttl {
                return Ok(hit.value.clone());
            }
        }

        let started = self.generation(user_id);
        let record = self.bounded(self.store.get_user(user_id)).await?;
        let assignment = match record {
            Some(record) => Some(Assignment {
                role: self.bounded(self.store.get_role(user_id)).await?,
                tenant_id: record.tenant_id,
            }),
            None => None,
        };
        debug!(user = %user_id, role = ?assignment.as_ref().and_then(|a| a.role.as_ref()).map(|r| &r.name), "Role cache miss");

        // The shard lock held by `entry` orders this check against the
        // removal in `invalidate`.
        let slot = self.assignments.entry(user_id.to_string());
        if self.generation(user_id) == started {
            slot.insert(Cached {
                value: assignment.clone(),
                cached_at: now,
            });
        } else {
            debug!(user = %user_id, "Assignment changed during lookup, not caching");
        }
        Ok(assignment)
    }

    /// Roles and rank overrides.
    pub async fn catalogue(&self) -> Result<Arc<Catalogue>, RbacError> {
        let now = self.clock.now();
        if let Some(ref cached) = *self.catalogue.read() {
            if elapsed(cached.cached_at, now) < self.ttl {
                return Ok(Arc::clone(&cached.value));
            }
        }

        let started = self.epoch.load(Ordering::SeqCst);
        let roles = self.bounded(self.store.roles()).await?;
        let requirements = self.bounded(self.store.rank_requirements()).await?;
        let catalogue = Arc::new(Catalogue::new(roles, requirements));
        let mut slot = self.catalogue.write();
        if self.epoch.load(Ordering::SeqCst) == started {
            *slot = Some(Cached {
                value: Arc::clone(&catalogue),
                cached_at: now,
            });
        }
        Ok(catalogue)
    }

    /// Forget the cached assignment of `user_id`. Lookups already running
    /// for the user will not cache their result.
    pub fn invalidate(&self, user_id: &str) {
        *self.generations.entry(user_id.to_string()).or_insert(0) += 1;
        self.assignments.remove(user_id);
    }

    /// Forget everything, catalogue included.
    pub fn invalidate_all(&self) {
        let mut catalogue = self.catalogue.write();
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *catalogue = None;
        drop(catalogue);
        self.assignments.clear();
    }

    fn generation(&self, user_id: &str) -> Generation {
        Generation {
            epoch: self.epoch.load(Ordering::SeqCst),
            user: self.generations.get(user_id).map_or(0, |g| *g),
        }
    }

    /// Run a store call under the lookup timeout.
    pub async fn bounded<T, F>(&self, call: F) -> Result<T, RbacError>
    where
        F: Future<Output = Result<T, RbacError>>,
    {
        match tokio::time::timeout(self.lookup_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.lookup_timeout.as_millis(), "Role store lookup timed out");
                Err(RbacError::Unavailable(format!(
                    "lookup timed out after {:?}",
                    self.lookup_timeout
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rbac_core::RankRequirement;
    use tokio::sync::Notify;

    use super::*;
    use crate::clock::ManualClock;
    use crate::rbac::store::{InMemoryRoleStore, UserRecord};

    /// Holds `get_role` open until released.
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    /// Counts `get_user` calls; optionally stalls every call.
    struct CountingStore {
        inner: InMemoryRoleStore,
        lookups: AtomicUsize,
        stall: bool,
        gate: Option<Gate>,
    }

    #[async_trait]
    impl RoleStore for CountingStore {
        async fn get_role(&self, user_id: &str) -> Result<Option<Role>, RbacError> {
            let role = self.inner.get_role(user_id).await;
            if let Some(ref gate) = self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            role
        }
        async fn rank_requirements(&self) -> Result<RankRequirements, RbacError> {
            self.inner.rank_requirements().await
        }
        async fn roles(&self) -> Result<Vec<Role>, RbacError> {
            self.inner.roles().await
        }
        async fn get_user(&self, user_id: &str) -> Result<Option<UserRecord>, RbacError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if self.stall {
                std::future::pending::<()>().await;
            }
            self.inner.get_user(user_id).await
        }
        async fn tenant_users(&self, tenant_id: &str) -> Result<Vec<UserRecord>, RbacError> {
            self.inner.tenant_users(tenant_id).await
        }
        async fn set_role(&self, user_id: &str, tenant_id: &str, role_id: &str) -> Result<(), RbacError> {
            self.inner.set_role(user_id, tenant_id, role_id).await
        }
        async fn remove_user(&self, user_id: &str) -> Result<bool, RbacError> {
            self.inner.remove_user(user_id).await
        }
        async fn create_user(&self, user_id: &str, tenant_id: &str) -> Result<(), RbacError> {
            self.inner.create_user(user_id, tenant_id).await
        }
        async fn create_role(&self, role: Role) -> Result<(), RbacError> {
            self.inner.create_role(role).await
        }
    }

    fn store(stall: bool) -> Arc<CountingStore> {
        let inner = InMemoryRoleStore::new(rbac_core::default_roles(), &[]);
        inner.upsert(UserRecord {
            user_id: "bob".into(),
            tenant_id: "contoso".into(),
            role_id: Some("user".into()),
        });
        Arc::new(CountingStore {
            inner,
            lookups: AtomicUsize::new(0),
            stall,
            gate: None,
        })
    }

    fn cache(store: &Arc<CountingStore>, clock: &Arc<ManualClock>) -> RoleCache {
        RoleCache::new(
            Arc::clone(store) as Arc<dyn RoleStore>,
            Arc::clone(clock) as SharedClock,
            Duration::from_secs(300),
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn assignments_are_cached_until_ttl() {
        // GIVEN: a warm cache
        let store = store(false);
        let clock = Arc::new(ManualClock::starting_now());
        let roles = cache(&store, &clock);
        let first = roles.assignment("bob").await.unwrap().unwrap();

        // WHEN: looked up again inside the TTL
        clock.advance(Duration::from_secs(299));
        roles.assignment("bob").await.unwrap();

        // THEN: one store lookup
        assert_eq!(first.role.unwrap().name, "USER");
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        // WHEN: the TTL passes
        clock.advance(Duration::from_secs(2));
        roles.assignment("bob").await.unwrap();

        // THEN: refetched
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_forces_a_fresh_lookup() {
        let store = store(false);
        let clock = Arc::new(ManualClock::starting_now());
        let roles = cache(&store, &clock);
        roles.assignment("bob").await.unwrap();

        store.inner.set_role("bob", "contoso", "admin").await.unwrap();
        assert_eq!(
            roles.assignment("bob").await.unwrap().unwrap().role.unwrap().name,
            "USER"
        );

        roles.invalidate("bob");
        assert_eq!(
            roles.assignment("bob").await.unwrap().unwrap().role.unwrap().name,
            "ADMIN"
        );
    }

    #[tokio::test]
    async fn lookup_racing_an_invalidation_does_not_restore_the_old_role() {
        // GIVEN: bob is an admin and a lookup is parked after reading his role
        let inner = InMemoryRoleStore::new(rbac_core::default_roles(), &[]);
        inner.upsert(UserRecord {
            user_id: "bob".into(),
            tenant_id: "contoso".into(),
            role_id: Some("admin".into()),
        });
        let store = Arc::new(CountingStore {
            inner,
            lookups: AtomicUsize::new(0),
            stall: false,
            gate: Some(Gate::default()),
        });
        let clock = Arc::new(ManualClock::starting_now());
        let roles = Arc::new(RoleCache::new(
            Arc::clone(&store) as Arc<dyn RoleStore>,
            Arc::clone(&clock) as SharedClock,
            Duration::from_secs(300),
            Duration::from_secs(5),
        ));
        let reader = tokio::spawn({
            let roles = Arc::clone(&roles);
            async move { roles.assignment("bob").await }
        });
        let gate = store.gate.as_ref().unwrap();
        gate.entered.notified().await;

        // WHEN: bob is demoted and invalidated before the lookup finishes
        store.inner.set_role("bob", "contoso", "user").await.unwrap();
        roles.invalidate("bob");
        gate.release.notify_one();
        let stale = reader.await.unwrap().unwrap().unwrap();

        // THEN: the parked lookup saw the old role but did not cache it
        assert_eq!(stale.role.unwrap().name, "ADMIN");
        gate.release.notify_one();
        let fresh = roles.assignment("bob").await.unwrap().unwrap();
        assert_eq!(fresh.role.unwrap().name, "USER");
    }

    #[tokio::test]
    async fn unknown_users_are_cached_as_absent() {
        let store = store(false);
        let clock = Arc::new(ManualClock::starting_now());
        let roles = cache(&store, &clock);

        assert_eq!(roles.assignment("mallory").await.unwrap(), None);
        assert_eq!(roles.assignment("mallory").await.unwrap(), None);
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stalled_store_surfaces_unavailable() {
        let store = store(true);
        let clock = Arc::new(ManualClock::starting_now());
        let roles = cache(&store, &clock);

        assert!(matches!(
            roles.assignment("bob").await,
            Err(RbacError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn catalogue_exposes_top_rank_and_overrides() {
        let inner = InMemoryRoleStore::new(
            rbac_core::default_roles(),
            &[RankRequirement {
                action: rbac_core::Action::Write,
                resource: rbac_core::ResourceKind::Model,
                rank: 2,
            }],
        );
        let clock = Arc::new(ManualClock::starting_now());
        let roles = RoleCache::new(
            Arc::new(inner),
            clock as SharedClock,
            Duration::from_secs(60),
            Duration::from_secs(1),
        );

        let catalogue = roles.catalogue().await.unwrap();

        assert_eq!(catalogue.top_rank, 3);
        assert_eq!(catalogue.find("maintainer").unwrap().rank, 2);
        assert_eq!(catalogue.find("Maintainer").unwrap().id, "maintainer");
        assert_eq!(catalogue.rank_of("admin"), Some(3));
        assert_eq!(
            catalogue
                .requirements
                .required_rank(rbac_core::Action::Write, rbac_core::ResourceKind::Model),
            2
        );
    }
}
