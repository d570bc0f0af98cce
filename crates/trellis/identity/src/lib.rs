//! Trellis Identity - anonymous participant identities.
//!
//! The engine resolves a caller to a `ParticipantId` through this capability
//! before any core call; it never mutates identity state beyond the explicit
//! `set_attributes` operation. Alias and secret generation happen upstream;
//! this crate only stores and matches what it is given.
//!
//! Lookups by attribute are served by an index with explicit pagination,
//! never by scanning every identity.

#![deny(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use trellis_storage::QueryWindow;
use trellis_types::ParticipantId;

/// An anonymous participant identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub identity_id: ParticipantId,
    pub attributes: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Alias plus pre-generated secret. Generation is an upstream concern.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub alias: String,
    pub secret: String,
}

/// Identity provider capability consumed by the engine boundary.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn create_identity(&self) -> Result<Identity, IdentityError>;

    /// Resolve credentials to an identity; `None` means no match.
    async fn authenticate(&self, credentials: &Credentials)
        -> Result<Option<Identity>, IdentityError>;

    /// Merge attributes into an identity and reindex.
    async fn set_attributes(
        &self,
        id: &ParticipantId,
        attributes: HashMap<String, String>,
    ) -> Result<Identity, IdentityError>;

    async fn list_identities(&self, window: QueryWindow) -> Result<Vec<Identity>, IdentityError>;

    /// Indexed attribute lookup with explicit pagination.
    async fn find_by_attribute(
        &self,
        key: &str,
        value: &str,
        window: QueryWindow,
    ) -> Result<Vec<Identity>, IdentityError>;
}

struct StoredIdentity {
    identity: Identity,
    secret: Option<String>,
}

/// Reference identity registry for tests and single-process deployments.
pub struct IdentityRegistry {
    identities: RwLock<HashMap<ParticipantId, StoredIdentity>>,
    by_attribute: RwLock<HashMap<(String, String), Vec<ParticipantId>>>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            by_attribute: RwLock::new(HashMap::new()),
        }
    }

    /// Attach login credentials to an existing identity. The alias is also
    /// indexed as an attribute so `find_by_attribute("alias", …)` resolves it.
    pub fn set_credentials(
        &self,
        id: &ParticipantId,
        credentials: Credentials,
    ) -> Result<(), IdentityError> {
        let mut identities = self
            .identities
            .write()
            .map_err(|_| IdentityError::LockError)?;
        let stored = identities
            .get_mut(id)
            .ok_or_else(|| IdentityError::NotFound(id.0.clone()))?;

        stored.secret = Some(credentials.secret);
        stored
            .identity
            .attributes
            .insert("alias".to_string(), credentials.alias.clone());

        let mut index = self
            .by_attribute
            .write()
            .map_err(|_| IdentityError::LockError)?;
        index
            .entry(("alias".to_string(), credentials.alias))
            .or_default()
            .push(id.clone());
        Ok(())
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for IdentityRegistry {
    async fn create_identity(&self) -> Result<Identity, IdentityError> {
        let identity = Identity {
            identity_id: ParticipantId::generate(),
            attributes: HashMap::new(),
            created_at: Utc::now(),
        };

        let mut identities = self
            .identities
            .write()
            .map_err(|_| IdentityError::LockError)?;
        identities.insert(
            identity.identity_id.clone(),
            StoredIdentity {
                identity: identity.clone(),
                secret: None,
            },
        );
        Ok(identity)
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Option<Identity>, IdentityError> {
        let index = self
            .by_attribute
            .read()
            .map_err(|_| IdentityError::LockError)?;
        let candidates = index
            .get(&("alias".to_string(), credentials.alias.clone()))
            .cloned()
            .unwrap_or_default();
        drop(index);

        let identities = self
            .identities
            .read()
            .map_err(|_| IdentityError::LockError)?;
        for id in candidates {
            if let Some(stored) = identities.get(&id) {
                if stored.secret.as_deref() == Some(credentials.secret.as_str()) {
                    return Ok(Some(stored.identity.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn set_attributes(
        &self,
        id: &ParticipantId,
        attributes: HashMap<String, String>,
    ) -> Result<Identity, IdentityError> {
        let mut identities = self
            .identities
            .write()
            .map_err(|_| IdentityError::LockError)?;
        let stored = identities
            .get_mut(id)
            .ok_or_else(|| IdentityError::NotFound(id.0.clone()))?;

        let mut index = self
            .by_attribute
            .write()
            .map_err(|_| IdentityError::LockError)?;
        for (key, value) in attributes {
            if let Some(previous) = stored.identity.attributes.get(&key) {
                if let Some(ids) = index.get_mut(&(key.clone(), previous.clone())) {
                    ids.retain(|existing| existing != id);
                }
            }
            index
                .entry((key.clone(), value.clone()))
                .or_default()
                .push(id.clone());
            stored.identity.attributes.insert(key, value);
        }
        Ok(stored.identity.clone())
    }

    async fn list_identities(&self, window: QueryWindow) -> Result<Vec<Identity>, IdentityError> {
        let identities = self
            .identities
            .read()
            .map_err(|_| IdentityError::LockError)?;
        let mut values = identities
            .values()
            .map(|stored| stored.identity.clone())
            .collect::<Vec<_>>();
        values.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apply_window(values, window))
    }

    async fn find_by_attribute(
        &self,
        key: &str,
        value: &str,
        window: QueryWindow,
    ) -> Result<Vec<Identity>, IdentityError> {
        let index = self
            .by_attribute
            .read()
            .map_err(|_| IdentityError::LockError)?;
        let ids = index
            .get(&(key.to_string(), value.to_string()))
            .cloned()
            .unwrap_or_default();
        drop(index);

        let identities = self
            .identities
            .read()
            .map_err(|_| IdentityError::LockError)?;
        let matches = ids
            .into_iter()
            .filter_map(|id| identities.get(&id).map(|stored| stored.identity.clone()))
            .collect::<Vec<_>>();
        Ok(apply_window(matches, window))
    }
}

fn apply_window<T>(items: Vec<T>, window: QueryWindow) -> Vec<T> {
    let iter = items.into_iter().skip(window.offset);
    if window.limit == 0 {
        iter.collect()
    } else {
        iter.take(window.limit).collect()
    }
}

/// Identity-related errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity not found: {0}")]
    NotFound(String),

    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    #[error("lock error")]
    LockError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_authenticate() {
        let registry = IdentityRegistry::new();
        let identity = registry.create_identity().await.unwrap();
        registry
            .set_credentials(
                &identity.identity_id,
                Credentials {
                    alias: "calm-otter".to_string(),
                    secret: "s3cret".to_string(),
                },
            )
            .unwrap();

        let found = registry
            .authenticate(&Credentials {
                alias: "calm-otter".to_string(),
                secret: "s3cret".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(found.unwrap().identity_id, identity.identity_id);

        let miss = registry
            .authenticate(&Credentials {
                alias: "calm-otter".to_string(),
                secret: "wrong".to_string(),
            })
            .await
            .unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn find_by_attribute_uses_index_and_pagination() {
        let registry = IdentityRegistry::new();
        for _ in 0..3 {
            let identity = registry.create_identity().await.unwrap();
            let mut attrs = HashMap::new();
            attrs.insert("cohort".to_string(), "2026a".to_string());
            registry
                .set_attributes(&identity.identity_id, attrs)
                .await
                .unwrap();
        }

        let page = registry
            .find_by_attribute(
                "cohort",
                "2026a",
                QueryWindow {
                    limit: 2,
                    offset: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 2);

        let rest = registry
            .find_by_attribute(
                "cohort",
                "2026a",
                QueryWindow {
                    limit: 2,
                    offset: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
    }

    #[tokio::test]
    async fn reindex_on_attribute_change() {
        let registry = IdentityRegistry::new();
        let identity = registry.create_identity().await.unwrap();
        let mut attrs = HashMap::new();
        attrs.insert("cohort".to_string(), "2026a".to_string());
        registry
            .set_attributes(&identity.identity_id, attrs)
            .await
            .unwrap();

        let mut attrs = HashMap::new();
        attrs.insert("cohort".to_string(), "2026b".to_string());
        registry
            .set_attributes(&identity.identity_id, attrs)
            .await
            .unwrap();

        let old = registry
            .find_by_attribute("cohort", "2026a", QueryWindow::default())
            .await
            .unwrap();
        assert!(old.is_empty());
        let new = registry
            .find_by_attribute("cohort", "2026b", QueryWindow::default())
            .await
            .unwrap();
        assert_eq!(new.len(), 1);
    }
}
