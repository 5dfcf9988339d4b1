//! Service registry
//!
//! The single source of truth for service descriptors. Each descriptor sits
//! behind its own lock; the outer map is only locked to look up, insert or
//! remove a name. Every successful mutation queues an archive snapshot.

use crate::archive::ArchiveHandle;
use crate::config::{Criticality, ServiceDescriptor, ServiceStatus, ServiceType};
use crate::error::{OrchestratorError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Predicates for [`Registry::list`]; `None` matches anything
#[derive(Debug, Clone, Default)]
pub struct ServiceFilter {
    pub service_type: Option<ServiceType>,
    pub criticality: Option<Criticality>,
    pub status: Option<ServiceStatus>,
}

impl ServiceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, service_type: ServiceType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = Some(criticality);
        self
    }

    pub fn with_status(mut self, status: ServiceStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, descriptor: &ServiceDescriptor) -> bool {
        self.service_type.map_or(true, |t| t == descriptor.service_type)
            && self.criticality.map_or(true, |c| c == descriptor.criticality)
            && self.status.map_or(true, |s| s == descriptor.status)
    }
}

/// Registry of service descriptors
pub struct Registry {
    services: RwLock<BTreeMap<String, Arc<Mutex<ServiceDescriptor>>>>,
    archive: Option<ArchiveHandle>,
    /// Held from a mutation until its snapshot is queued, so each snapshot
    /// holds exactly the set its mutation produced
    snapshot_lock: Mutex<()>,
}

impl Registry {
    /// Create a registry; with an archive handle every mutation is snapshotted
    pub fn new(archive: Option<ArchiveHandle>) -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            archive,
            snapshot_lock: Mutex::new(()),
        }
    }

    /// Register a new service
    pub async fn register(&self, descriptor: ServiceDescriptor) -> Result<()> {
        descriptor.validate()?;
        let _ordered = self.snapshot_lock.lock().await;
        {
            let mut services = self.services.write().await;
            if services.contains_key(&descriptor.name) {
                return Err(OrchestratorError::DuplicateService(descriptor.name));
            }
            log::info!("[{}] Registered ({:?})", descriptor.name, descriptor.service_type);
            services.insert(descriptor.name.clone(), Arc::new(Mutex::new(descriptor)));
        }
        self.request_snapshot().await;
        Ok(())
    }

    /// Look up a service; the returned copy is valid for one operation
    pub async fn lookup(&self, name: &str) -> Result<ServiceDescriptor> {
        let entry = self.entry(name).await?;
        let descriptor = entry.lock().await.clone();
        Ok(descriptor)
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.services.read().await.contains_key(name)
    }

    /// Services matching `filter`, ordered by name
    pub async fn list(&self, filter: &ServiceFilter) -> Vec<ServiceDescriptor> {
        let services = self.services.read().await;
        let mut matching = Vec::new();
        for entry in services.values() {
            let descriptor = entry.lock().await;
            if filter.matches(&descriptor) {
                matching.push(descriptor.clone());
            }
        }
        matching
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Change the registry status of a service; the only in-place mutation
    pub async fn update_status(&self, name: &str, status: ServiceStatus) -> Result<()> {
        let _ordered = self.snapshot_lock.lock().await;
        let entry = self.entry(name).await?;
        {
            let mut descriptor = entry.lock().await;
            if descriptor.status == status {
                return Ok(());
            }
            log::info!(
                "[{}] Status {:?} -> {:?}",
                name,
                descriptor.status,
                status
            );
            descriptor.status = status;
        }
        self.request_snapshot().await;
        Ok(())
    }

    /// Remove a service
    pub async fn deregister(&self, name: &str) -> Result<ServiceDescriptor> {
        let _ordered = self.snapshot_lock.lock().await;
        let entry = self
            .services
            .write()
            .await
            .remove(name)
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
        let descriptor = entry.lock().await.clone();
        log::info!("[{}] Deregistered", name);
        self.request_snapshot().await;
        Ok(descriptor)
    }

    /// Swap in a complete descriptor set, e.g. from a restored snapshot
    pub async fn replace_all(&self, descriptors: Vec<ServiceDescriptor>) -> Result<()> {
        let mut staged = BTreeMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            if staged.contains_key(&descriptor.name) {
                return Err(OrchestratorError::DuplicateService(descriptor.name));
            }
            staged.insert(descriptor.name.clone(), Arc::new(Mutex::new(descriptor)));
        }
        let _ordered = self.snapshot_lock.lock().await;
        {
            let mut services = self.services.write().await;
            log::info!(
                "Replacing {} registered services with {}",
                services.len(),
                staged.len()
            );
            *services = staged;
        }
        self.request_snapshot().await;
        Ok(())
    }

    async fn entry(&self, name: &str) -> Result<Arc<Mutex<ServiceDescriptor>>> {
        self.services
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))
    }

    /// Capture the full descriptor set and queue it for archiving.
    ///
    /// Callers hold `snapshot_lock` across their mutation and this call.
    async fn request_snapshot(&self) {
        let Some(archive) = &self.archive else {
            return;
        };
        let descriptors = self.list(&ServiceFilter::all()).await;
        archive.request(descriptors);
    }
}
