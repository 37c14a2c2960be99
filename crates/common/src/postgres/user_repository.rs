use crate::domain::{ArchivedUserRepository, DomainResult, User, UserRepository};
use crate::postgres::{PostgresDocumentStore, OLD_USERS, USERS};
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

/// Flat users stored as JSON documents in `users`, archived to `old_users`
#[derive(Clone)]
pub struct PostgresUserRepository {
    store: PostgresDocumentStore,
}

impl PostgresUserRepository {
    pub fn new(store: PostgresDocumentStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl UserRepository for PostgresUserRepository {
    #[instrument(skip(self))]
    async fn get_user(&self, user_id: &str) -> DomainResult<User> {
        debug!(user_id, "fetching user");
        Ok(self.store.find_one(USERS, user_id).await?)
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn insert_user(&self, user: User) -> DomainResult<String> {
        Ok(self.store.insert(USERS, &user.id, &user).await?)
    }

    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn update_user(&self, user: User) -> DomainResult<()> {
        Ok(self.store.update(USERS, &user.id, &user).await?)
    }

    #[instrument(skip(self))]
    async fn remove_user(&self, user_id: &str) -> DomainResult<()> {
        Ok(self.store.remove(USERS, user_id).await?)
    }
}

#[async_trait]
impl ArchivedUserRepository for PostgresUserRepository {
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    async fn archive_user(&self, mut user: User) -> DomainResult<String> {
        user.updated_at = Some(Utc::now());
        Ok(self.store.upsert(OLD_USERS, &user.id, &user).await?)
    }
}
