//! Service container
//!
//! Name-keyed registry with three scopes:
//! - `Global`: created at most once per process
//! - `Session`: created at most once per session, torn down with it
//! - `Transient`: the factory runs on every resolution
//!
//! Services are stored type-erased (`Arc<dyn Any>`); `resolve` returns the
//! erased handle and `resolve_typed` downcasts. A session-scoped lookup
//! first consults the session table and falls back to the global registry
//! only for singletons explicitly marked sharable.

use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::session::SessionId;

pub type Service = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&Container, Option<&str>) -> Service + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Session,
    Transient,
}

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error("service '{0}' is not registered")]
    Unregistered(String),

    #[error("service '{0}' is session-scoped but no session id was given")]
    MissingSession(String),

    #[error("service '{0}' has a different type than requested")]
    TypeMismatch(String),
}

struct Registration {
    scope: Scope,
    factory: Option<Factory>,
    instance: RwLock<Option<Service>>,
    /// Global singletons resolvable through a session-scoped lookup.
    sharable: bool,
}

#[derive(Default)]
pub struct Container {
    services: RwLock<HashMap<String, Arc<Registration>>>,
    session_services: RwLock<HashMap<SessionId, HashMap<String, Service>>>,
}

impl Container {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a ready-made global singleton, sharable into sessions.
    pub fn register_singleton<T: Any + Send + Sync>(&self, name: &str, instance: Arc<T>) {
        let registration = Registration {
            scope: Scope::Global,
            factory: None,
            instance: RwLock::new(Some(instance as Service)),
            sharable: true,
        };
        self.services
            .write()
            .insert(name.to_string(), Arc::new(registration));
        tracing::debug!(service = name, "registered singleton");
    }

    /// Register a factory with an explicit scope.
    pub fn register_factory<F>(&self, name: &str, scope: Scope, factory: F)
    where
        F: Fn(&Container, Option<&str>) -> Service + Send + Sync + 'static,
    {
        let registration = Registration {
            scope,
            factory: Some(Arc::new(factory)),
            instance: RwLock::new(None),
            sharable: false,
        };
        self.services
            .write()
            .insert(name.to_string(), Arc::new(registration));
        tracing::debug!(service = name, ?scope, "registered factory");
    }

    /// Attach an existing value to one session's table (e.g. the session
    /// context itself, minted by the session manager).
    pub fn register_session_value<T: Any + Send + Sync>(
        &self,
        session_id: &str,
        name: &str,
        value: Arc<T>,
    ) {
        self.session_services
            .write()
            .entry(session_id.to_string())
            .or_default()
            .insert(name.to_string(), value as Service);
    }

    /// Resolve by name, with an optional session scope.
    pub fn resolve(
        &self,
        name: &str,
        session_id: Option<&str>,
    ) -> Result<Service, ContainerError> {
        if let Some(sid) = session_id {
            if let Some(found) = self
                .session_services
                .read()
                .get(sid)
                .and_then(|table| table.get(name))
            {
                return Ok(found.clone());
            }
        }

        let registration = self
            .services
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::Unregistered(name.to_string()))?;

        match registration.scope {
            Scope::Global => {
                if session_id.is_some() && !registration.sharable {
                    return Err(ContainerError::Unregistered(name.to_string()));
                }
                if let Some(existing) = registration.instance.read().clone() {
                    return Ok(existing);
                }
                let factory = registration
                    .factory
                    .as_ref()
                    .ok_or_else(|| ContainerError::Unregistered(name.to_string()))?;
                let created = factory(self, None);
                let mut slot = registration.instance.write();
                // A racing resolver may have won; keep the first instance.
                if let Some(existing) = slot.clone() {
                    return Ok(existing);
                }
                *slot = Some(created.clone());
                Ok(created)
            }
            Scope::Session => {
                let sid =
                    session_id.ok_or_else(|| ContainerError::MissingSession(name.to_string()))?;
                let factory = registration
                    .factory
                    .as_ref()
                    .ok_or_else(|| ContainerError::Unregistered(name.to_string()))?;
                let created = factory(self, Some(sid));
                let mut sessions = self.session_services.write();
                let table = sessions.entry(sid.to_string()).or_default();
                if let Some(existing) = table.get(name) {
                    return Ok(existing.clone());
                }
                table.insert(name.to_string(), created.clone());
                Ok(created)
            }
            Scope::Transient => {
                let factory = registration
                    .factory
                    .as_ref()
                    .ok_or_else(|| ContainerError::Unregistered(name.to_string()))?;
                Ok(factory(self, session_id))
            }
        }
    }

    /// Resolve and downcast.
    pub fn resolve_typed<T: Any + Send + Sync>(
        &self,
        name: &str,
        session_id: Option<&str>,
    ) -> Result<Arc<T>, ContainerError> {
        self.resolve(name, session_id)?
            .downcast::<T>()
            .map_err(|_| ContainerError::TypeMismatch(name.to_string()))
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.read().contains_key(name)
    }

    /// Drop everything one session registered or cached.
    pub fn cleanup_session(&self, session_id: &str) {
        if let Some(table) = self.session_services.write().remove(session_id) {
            tracing::debug!(
                session_id,
                services = table.len(),
                "cleaned up session services"
            );
        }
    }
}
