use crate::domain::{
    ArchivedMetaUserRepository, DomainResult, MetaUser, MetaUserRepository,
};
use crate::postgres::{PostgresDocumentStore, METAUSERS, OLD_METAUSERS};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

/// Versioned users stored as JSON documents in `metausers`, archived to `old_metausers`
#[derive(Clone)]
pub struct PostgresMetaUserRepository {
    store: PostgresDocumentStore,
}

impl PostgresMetaUserRepository {
    pub fn new(store: PostgresDocumentStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MetaUserRepository for PostgresMetaUserRepository {
    #[instrument(skip(self))]
    async fn get_meta_user(&self, user_id: &str) -> DomainResult<MetaUser> {
        debug!(user_id, "fetching meta user");
        Ok(self.store.find_one(METAUSERS, user_id).await?)
    }

    #[instrument(skip(self, meta_user), fields(user_id = %meta_user.id))]
    async fn insert_meta_user(&self, meta_user: MetaUser) -> DomainResult<String> {
        Ok(self.store.insert(METAUSERS, &meta_user.id, &meta_user).await?)
    }

    #[instrument(skip(self, meta_user), fields(user_id = %meta_user.id))]
    async fn update_meta_user(&self, meta_user: MetaUser) -> DomainResult<()> {
        Ok(self.store.update(METAUSERS, &meta_user.id, &meta_user).await?)
    }

    #[instrument(skip(self))]
    async fn remove_meta_user(&self, user_id: &str) -> DomainResult<()> {
        Ok(self.store.remove(METAUSERS, user_id).await?)
    }
}

#[async_trait]
impl ArchivedMetaUserRepository for PostgresMetaUserRepository {
    /// Upserts, so archiving the same user again after a redelivered delete converges
    #[instrument(skip(self, meta_user), fields(user_id = %meta_user.id))]
    async fn archive_meta_user(&self, mut meta_user: MetaUser) -> DomainResult<String> {
        meta_user.updated_at = Some(Utc::now());
        Ok(self
            .store
            .upsert(OLD_METAUSERS, &meta_user.id, &meta_user)
            .await?)
    }
}
