//! Control-plane access used by the reconciler

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;
use tracing::{debug, trace};

use crate::{Error, Result, FIELD_MANAGER};

/// A kind resolved against the control plane's discovery data
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedKind {
    /// Resource type
    pub resource: ApiResource,
    /// Lives inside a namespace
    pub namespaced: bool,
}

impl ResolvedKind {
    /// The core `Namespace` kind
    pub fn namespace() -> Self {
        Self {
            resource: ApiResource::erase::<Namespace>(&()),
            namespaced: false,
        }
    }
}

/// Generic resource operations against the control plane.
///
/// `namespace` is `None` for cluster-scoped kinds. Lookups that find nothing
/// return [`Error::ResourceNotFound`].
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Map a group/version/kind to a resource type
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind>;

    /// Fetch one object by name
    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject>;

    /// Create an object
    async fn create(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<()>;

    /// Forced server-side apply of an existing object
    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        object: &DynamicObject,
    ) -> Result<()>;

    /// Delete an object by name
    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()>;
}

/// [`ResourceStore`] backed by a kube client
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Wrap a connected client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: &ResolvedKind, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if kind.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &kind.resource)
            }
            _ => Api::all_with(self.client.clone(), &kind.resource),
        }
    }
}

fn not_found(kind: &ResolvedKind, namespace: Option<&str>, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::ResourceNotFound {
            kind: kind.resource.kind.clone(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        },
        other => Error::from(other),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<ResolvedKind> {
        // Run per call so kinds registered by earlier documents (CRDs) resolve
        let discovery = Discovery::new(self.client.clone())
            .filter(&[gvk.group.as_str()])
            .run()
            .await?;
        let (resource, caps) = discovery.resolve_gvk(gvk).ok_or_else(|| {
            Error::internal_with_context(
                "discovery",
                format!(
                    "no resource type for {}/{} {}",
                    gvk.group, gvk.version, gvk.kind
                ),
            )
        })?;
        trace!(kind = %gvk.kind, plural = %resource.plural, "resolved kind");
        Ok(ResolvedKind {
            resource,
            namespaced: caps.scope == Scope::Namespaced,
        })
    }

    async fn get(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<DynamicObject> {
        self.api(kind, namespace)
            .get(name)
            .await
            .map_err(|e| not_found(kind, namespace, name, e))
    }

    async fn create(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        object: &DynamicObject,
    ) -> Result<()> {
        self.api(kind, namespace)
            .create(&PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn apply(
        &self,
        kind: &ResolvedKind,
        namespace: Option<&str>,
        name: &str,
        object: &DynamicObject,
    ) -> Result<()> {
        let params = PatchParams::apply(FIELD_MANAGER).force();
        self.api(kind, namespace)
            .patch(name, &params, &Patch::Apply(object))
            .await?;
        Ok(())
    }

    async fn delete(&self, kind: &ResolvedKind, namespace: Option<&str>, name: &str) -> Result<()> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| not_found(kind, namespace, name, e))?;
        debug!(kind = %kind.resource.kind, name = %name, "delete requested");
        Ok(())
    }
}
