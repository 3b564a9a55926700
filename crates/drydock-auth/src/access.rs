//! Access records and the controller interface

use async_trait::async_trait;
use http::HeaderMap;
use std::fmt;

use crate::error::AuthError;

/// What kind of access a request needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Pull,
    Push,
    Delete,
    All,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Pull => "pull",
            Action::Push => "push",
            Action::Delete => "delete",
            Action::All => "*",
        }
    }
}

/// The thing being accessed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Repository(String),
    Registry(String),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Resource::Repository(_) => "repository",
            Resource::Registry(_) => "registry",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Resource::Repository(name) => name,
            Resource::Registry(name) => name,
        }
    }
}

/// One `(resource, action)` requirement assembled by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Access {
    pub resource: Resource,
    pub action: Action,
}

impl Access {
    pub fn pull(repository: impl Into<String>) -> Self {
        Self {
            resource: Resource::Repository(repository.into()),
            action: Action::Pull,
        }
    }

    pub fn push(repository: impl Into<String>) -> Self {
        Self {
            resource: Resource::Repository(repository.into()),
            action: Action::Push,
        }
    }

    pub fn delete(repository: impl Into<String>) -> Self {
        Self {
            resource: Resource::Repository(repository.into()),
            action: Action::Delete,
        }
    }

    pub fn catalog() -> Self {
        Self {
            resource: Resource::Registry("catalog".to_string()),
            action: Action::All,
        }
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.resource.kind(),
            self.resource.name(),
            self.action.as_str()
        )
    }
}

/// Build the `scope` value of a token challenge from the requested records.
///
/// Records for the same resource are folded into one scope element with a
/// comma-separated action list.
pub fn scope_for(access: &[Access]) -> String {
    let mut scopes: Vec<(String, String, Vec<&'static str>)> = Vec::new();
    for record in access {
        let kind = record.resource.kind().to_string();
        let name = record.resource.name().to_string();
        match scopes.iter_mut().find(|(k, n, _)| *k == kind && *n == name) {
            Some((_, _, actions)) => {
                if !actions.contains(&record.action.as_str()) {
                    actions.push(record.action.as_str());
                }
            }
            None => scopes.push((kind, name, vec![record.action.as_str()])),
        }
    }
    scopes
        .into_iter()
        .map(|(kind, name, actions)| format!("{kind}:{name}:{}", actions.join(",")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The identity a controller grants to a request
#[derive(Debug, Clone)]
pub struct Grant {
    pub user: String,
}

/// Decides whether a request may perform the assembled accesses.
///
/// Returns a [`Grant`] on success; an [`AuthError::Challenge`] carries the
/// `WWW-Authenticate` header the dispatcher must emit.
#[async_trait]
pub trait AccessController: Send + Sync {
    async fn authorized(&self, headers: &HeaderMap, access: &[Access]) -> Result<Grant, AuthError>;
}
