//! Applying and deleting raw manifests against the control plane
//!
//! A manifest path is a single file or a directory whose files are processed
//! in name order. Each file may hold several YAML documents; they are decoded
//! one at a time and each is created when absent or force-applied when
//! present. Deletion mirrors this and treats a missing object as done.
//!
//! Processing is sequential and not transactional: the first failure stops
//! the remaining documents and files, and earlier changes stay applied.

pub mod document;
pub mod store;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

pub use document::{documents, ResourceDocument};
pub use store::{KubeResourceStore, ResolvedKind, ResourceStore};

use crate::{Result, DEFAULT_NAMESPACE};

/// Applies and deletes manifest paths
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Create or update everything under `path`
    async fn apply(&self, path: &Path) -> Result<()>;

    /// Delete everything under `path`; missing objects are fine
    async fn delete(&self, path: &Path) -> Result<()>;
}

/// [`ManifestApplier`] over a [`ResourceStore`]
#[derive(Clone)]
pub struct ResourceReconciler {
    store: Arc<dyn ResourceStore>,
}

impl ResourceReconciler {
    /// Reconcile through `store`
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }

    /// Create or force-apply one document
    pub async fn apply_document(&self, doc: &ResourceDocument) -> Result<()> {
        let kind = self.store.resolve(&doc.gvk).await?;
        let namespace = target_namespace(&kind, doc);
        if let Some(ns) = namespace.as_deref() {
            self.ensure_namespace(ns).await?;
        }
        let namespace = namespace.as_deref();

        let mut object = doc.object.clone();
        if let Some(ns) = namespace {
            object.metadata.namespace = Some(ns.to_string());
        }

        match self.store.get(&kind, namespace, &doc.name).await {
            Err(e) if e.is_not_found() => {
                info!(kind = %doc.gvk.kind, name = %doc.name, namespace = ?namespace, "creating");
                self.store.create(&kind, namespace, &object).await
            }
            Err(e) => Err(e),
            Ok(_) => {
                info!(kind = %doc.gvk.kind, name = %doc.name, namespace = ?namespace, "applying");
                self.store.apply(&kind, namespace, &doc.name, &object).await
            }
        }
    }

    /// Delete one document's object if it exists
    pub async fn delete_document(&self, doc: &ResourceDocument) -> Result<()> {
        let kind = self.store.resolve(&doc.gvk).await?;
        let namespace = target_namespace(&kind, doc);
        let namespace = namespace.as_deref();

        match self.store.get(&kind, namespace, &doc.name).await {
            Err(e) if e.is_not_found() => {
                debug!(kind = %doc.gvk.kind, name = %doc.name, "already absent");
                Ok(())
            }
            Err(e) => Err(e),
            Ok(_) => {
                info!(kind = %doc.gvk.kind, name = %doc.name, namespace = ?namespace, "deleting");
                match self.store.delete(&kind, namespace, &doc.name).await {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            }
        }
    }

    async fn ensure_namespace(&self, name: &str) -> Result<()> {
        let kind = ResolvedKind::namespace();
        match self.store.get(&kind, None, name).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                info!(namespace = %name, "creating namespace");
                let ns = DynamicObject::new(name, &kind.resource);
                match self.store.create(&kind, None, &ns).await {
                    Err(e) if e.is_already_exists() => {
                        debug!(namespace = %name, "namespace created concurrently");
                        Ok(())
                    }
                    other => other,
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn for_each_document<'a, F, Fut>(&'a self, path: &Path, mut f: F) -> Result<()>
    where
        F: FnMut(ResourceDocument) -> Fut,
        Fut: std::future::Future<Output = Result<()>> + 'a,
    {
        for file in manifest_files(path).await? {
            let source = file.display().to_string();
            let content = tokio::fs::read_to_string(&file).await?;
            debug!(file = %source, "processing manifest");
            for doc in documents(&source, &content) {
                f(doc?).await?;
            }
        }
        Ok(())
    }
}

/// Namespace an object of `kind` goes in; `None` for cluster-scoped kinds
fn target_namespace(kind: &ResolvedKind, doc: &ResourceDocument) -> Option<String> {
    kind.namespaced.then(|| {
        doc.namespace
            .clone()
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string())
    })
}

/// Files under `path` in processing order
async fn manifest_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !tokio::fs::metadata(path).await?.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl ManifestApplier for ResourceReconciler {
    async fn apply(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "applying manifests");
        self.for_each_document(path, move |doc| async move { self.apply_document(&doc).await })
            .await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "deleting manifests");
        self.for_each_document(path, move |doc| async move { self.delete_document(&doc).await })
            .await
    }
}
