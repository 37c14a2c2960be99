use crate::domain::{reconcile_flat, reconcile_versioned, Reconciliation};
use common::domain::{
    ArchivedMetaUserRepository, ArchivedUserRepository, DomainError, DomainResult,
    MetaUserRepository, User, UserClient, UserEvent, UserRepository,
};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Which pair of collections the worker maintains
#[derive(Clone)]
pub enum SyncStore {
    /// Per-attribute history in `metausers`, archived to `old_metausers`
    Versioned {
        live: Arc<dyn MetaUserRepository>,
        archive: Arc<dyn ArchivedMetaUserRepository>,
    },
    /// Plain users in `users`, archived to `old_users`
    Flat {
        live: Arc<dyn UserRepository>,
        archive: Arc<dyn ArchivedUserRepository>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Applies user lifecycle events to the document store.
///
/// Both operations are safe to repeat: a redelivered event converges to the
/// same stored state.
pub struct UserSyncService {
    user_client: Arc<dyn UserClient>,
    store: SyncStore,
}

impl UserSyncService {
    pub fn new(user_client: Arc<dyn UserClient>, store: SyncStore) -> Self {
        Self { user_client, store }
    }

    /// Reconcile the user named by `event` into the live collection.
    ///
    /// A stored record that does not exist yet leads to an insert; any other
    /// lookup failure aborts before anything is written.
    #[instrument(skip(self, event), fields(user_id = %event.user_id()))]
    pub async fn sync_user(&self, event: UserEvent) -> DomainResult<SyncOutcome> {
        let client_id = event.client_id().map(str::to_string);
        let user = self.observe(event).await?;
        let client_id = client_id
            .or_else(|| (!user.client_id.is_empty()).then(|| user.client_id.clone()));

        let outcome = match &self.store {
            SyncStore::Versioned { live, .. } => {
                let stored = found(live.get_meta_user(&user.id).await)?;
                match reconcile_versioned(user, client_id.as_deref(), stored) {
                    Reconciliation::Insert(meta_user) => {
                        live.insert_meta_user(meta_user).await?;
                        SyncOutcome::Inserted
                    }
                    Reconciliation::Update(meta_user) => {
                        live.update_meta_user(meta_user).await?;
                        SyncOutcome::Updated
                    }
                    Reconciliation::Unchanged => SyncOutcome::Unchanged,
                }
            }
            SyncStore::Flat { live, .. } => {
                let stored = found(live.get_user(&user.id).await)?;
                match reconcile_flat(user, stored) {
                    Reconciliation::Insert(user) => {
                        live.insert_user(user).await?;
                        SyncOutcome::Inserted
                    }
                    Reconciliation::Update(user) => {
                        live.update_user(user).await?;
                        SyncOutcome::Updated
                    }
                    Reconciliation::Unchanged => SyncOutcome::Unchanged,
                }
            }
        };

        info!(outcome = ?outcome, "user synchronized");
        Ok(outcome)
    }

    /// Archive the live record, then delete it. The removal never runs if the
    /// archive write failed. A missing live record is an error.
    #[instrument(skip(self))]
    pub async fn remove_user(&self, user_id: &str) -> DomainResult<()> {
        match &self.store {
            SyncStore::Versioned { live, archive } => {
                let current = live.get_meta_user(user_id).await?;
                archive.archive_meta_user(current).await?;
                debug!(user_id, "meta user archived");
                live.remove_meta_user(user_id).await?;
            }
            SyncStore::Flat { live, archive } => {
                let current = live.get_user(user_id).await?;
                archive.archive_user(current).await?;
                debug!(user_id, "user archived");
                live.remove_user(user_id).await?;
            }
        }

        info!(user_id, "user archived and removed");
        Ok(())
    }

    async fn observe(&self, event: UserEvent) -> DomainResult<User> {
        match event {
            UserEvent::Snapshot(user) => Ok(user),
            UserEvent::Reference(reference) => {
                let user = self.user_client.get_user(&reference.id).await?;
                if user.id != reference.id {
                    return Err(DomainError::InvalidUser(format!(
                        "requested user {} but user API returned {}",
                        reference.id, user.id
                    )));
                }
                Ok(user)
            }
        }
    }
}

/// Not-found means "nothing stored yet"; every other error is propagated
fn found<T>(result: DomainResult<T>) -> DomainResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
