//! Core identifiers, principals, and client records.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

use crate::store::StoreError;

/// Stable opaque client identifier.
pub type ClientId = String;

/// Node identifier within a flowchart.
pub type NodeId = String;

/// Stable scope identifier, unchanged across renames.
pub type ScopeUid = String;

/// Assessment levels a client has subscribed to. The set gates which
/// downstream components are active for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentLevel {
    Organisation,
    Process,
    Reduction,
    Decarbonisation,
}

/// A tenant of the data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    /// Stable opaque ID
    pub client_id: ClientId,
    /// Display name
    pub name: String,
    /// Subscribed assessment levels
    pub assessment_levels: HashSet<AssessmentLevel>,
    /// Inactive clients are skipped by scheduled jobs
    pub active: bool,
}

impl Client {
    pub fn new(client_id: impl Into<ClientId>, name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            name: name.into(),
            assessment_levels: HashSet::from([AssessmentLevel::Organisation]),
            active: true,
        }
    }

    pub fn with_levels(mut self, levels: impl IntoIterator<Item = AssessmentLevel>) -> Self {
        self.assessment_levels = levels.into_iter().collect();
        self
    }

    pub fn has_level(&self, level: AssessmentLevel) -> bool {
        self.assessment_levels.contains(&level)
    }
}

/// Caller role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Unrestricted across clients
    SuperAdmin,
    /// Full access within one client
    ClientAdmin,
    /// Read/write within assigned departments and locations
    User,
}

/// Pre-authorised caller identity.
///
/// The core trusts the principal; the only enforcement here is scope-level
/// isolation: a principal bound to a client sees only that client's
/// streams and summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    /// Caller ID
    pub id: String,
    /// Caller role
    pub role: Role,
    /// Bound client for non-super-admin principals
    pub client_id: Option<ClientId>,
    /// Department restriction, if any
    pub departments: Option<Vec<String>>,
    /// Location restriction, if any
    pub locations: Option<Vec<String>>,
}

impl Principal {
    /// An unrestricted super-admin principal.
    pub fn super_admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::SuperAdmin,
            client_id: None,
            departments: None,
            locations: None,
        }
    }

    /// A principal bound to one client.
    pub fn for_client(id: impl Into<String>, client_id: impl Into<ClientId>) -> Self {
        Self {
            id: id.into(),
            role: Role::ClientAdmin,
            client_id: Some(client_id.into()),
            departments: None,
            locations: None,
        }
    }

    /// Whether this principal may touch the given client's data.
    pub fn can_access(&self, client_id: &str) -> bool {
        match self.role {
            Role::SuperAdmin => true,
            _ => self.client_id.as_deref() == Some(client_id),
        }
    }
}

/// Client directory contract.
#[async_trait]
pub trait ClientStore: Send + Sync {
    async fn get(&self, client_id: &str) -> Result<Option<Client>, StoreError>;
    async fn upsert(&self, client: Client) -> Result<(), StoreError>;
    /// All active clients, for scheduled jobs.
    async fn active_clients(&self) -> Result<Vec<Client>, StoreError>;
}

/// In-memory client directory.
#[derive(Default)]
pub struct InMemoryClientStore {
    clients: RwLock<HashMap<ClientId, Client>>,
}

impl InMemoryClientStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientStore for InMemoryClientStore {
    async fn get(&self, client_id: &str) -> Result<Option<Client>, StoreError> {
        Ok(self.clients.read().await.get(client_id).cloned())
    }

    async fn upsert(&self, client: Client) -> Result<(), StoreError> {
        self.clients
            .write()
            .await
            .insert(client.client_id.clone(), client);
        Ok(())
    }

    async fn active_clients(&self) -> Result<Vec<Client>, StoreError> {
        let mut clients: Vec<Client> = self
            .clients
            .read()
            .await
            .values()
            .filter(|c| c.active)
            .cloned()
            .collect();
        clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        Ok(clients)
    }
}
