use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    NewUser, ProfileUpdate, RefreshTokenRecord, RefreshTokenStore, StoreError, StoreResult,
    UserRecord, UserStore,
};
use crate::claims::TokenClaims;

/// In-process store backed by `DashMap`.
///
/// Emails are matched case-insensitively. Uniqueness checks on create are
/// serialized through `create_lock`; everything else is per-entry.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, UserRecord>,
    emails: DashMap<String, Uuid>,
    usernames: DashMap<String, Uuid>,
    create_lock: Mutex<()>,
    refresh_tokens: DashMap<Uuid, RefreshTokenRecord>,
    refresh_by_hash: DashMap<String, Uuid>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn refresh_token_count(&self) -> usize {
        self.refresh_tokens.len()
    }

    fn rename(&self, id: Uuid, old: &str, new: &str) {
        if old == new {
            return;
        }
        self.usernames.remove_if(old, |_, owner| *owner == id);
        self.usernames.insert(new.to_string(), id);
    }
}

fn email_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn user_by_id(&self, id: Uuid) -> StoreResult<Option<UserRecord>> {
        Ok(self.users.get(&id).map(|user| user.clone()))
    }

    async fn user_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        let Some(id) = self.emails.get(&email_key(email)).map(|id| *id) else {
            return Ok(None);
        };
        self.user_by_id(id).await
    }

    async fn create_user(&self, user: NewUser) -> StoreResult<UserRecord> {
        let email = email_key(&user.email);
        let _guard = self.create_lock.lock();
        if self.emails.contains_key(&email) {
            return Err(StoreError::Conflict(format!("email {email}")));
        }
        if self.usernames.contains_key(&user.username) {
            return Err(StoreError::Conflict(format!("username {}", user.username)));
        }

        let record = UserRecord {
            id: Uuid::new_v4(),
            email: Some(email.clone()),
            username: user.username,
            display_name: user.display_name,
            avatar_url: None,
            password_hash: Some(user.password_hash),
            created_at: Utc::now(),
            last_seen_at: None,
        };
        self.emails.insert(email, record.id);
        self.usernames.insert(record.username.clone(), record.id);
        self.users.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_profile(&self, id: Uuid, update: ProfileUpdate) -> StoreResult<UserRecord> {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;
        if let Some(display_name) = update.display_name {
            user.display_name = display_name;
        }
        if let Some(avatar_url) = update.avatar_url {
            user.avatar_url = Some(avatar_url);
        }
        Ok(user.clone())
    }

    async fn upsert_from_claims(&self, claims: &TokenClaims) -> StoreResult<UserRecord> {
        let previous_username = {
            let mut entry = self.users.entry(claims.user_id).or_insert_with(|| UserRecord {
                id: claims.user_id,
                email: None,
                username: claims.username.clone(),
                display_name: claims.display_name.clone(),
                avatar_url: None,
                password_hash: None,
                created_at: Utc::now(),
                last_seen_at: None,
            });
            let previous = std::mem::replace(&mut entry.username, claims.username.clone());
            entry.display_name = claims.display_name.clone();
            entry.avatar_url = claims.avatar_url.clone();
            previous
        };
        self.rename(claims.user_id, &previous_username, &claims.username);
        self.users
            .get(&claims.user_id)
            .map(|user| user.clone())
            .ok_or_else(|| StoreError::NotFound(format!("user {}", claims.user_id)))
    }

    async fn touch_last_seen(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut user = self
            .users
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("user {id}")))?;
        user.last_seen_at = Some(at);
        Ok(())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn create_refresh_token(&self, token: RefreshTokenRecord) -> StoreResult<()> {
        if self.refresh_by_hash.contains_key(&token.token_hash) {
            return Err(StoreError::Conflict("refresh token hash".to_string()));
        }
        self.refresh_by_hash.insert(token.token_hash.clone(), token.id);
        self.refresh_tokens.insert(token.id, token);
        Ok(())
    }

    async fn refresh_token_by_hash(
        &self,
        token_hash: &str,
    ) -> StoreResult<Option<RefreshTokenRecord>> {
        let Some(id) = self.refresh_by_hash.get(token_hash).map(|id| *id) else {
            return Ok(None);
        };
        Ok(self.refresh_tokens.get(&id).map(|token| token.clone()))
    }

    async fn delete_refresh_token(&self, id: Uuid) -> StoreResult<bool> {
        match self.refresh_tokens.remove(&id) {
            Some((_, token)) => {
                self.refresh_by_hash.remove(&token.token_hash);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
