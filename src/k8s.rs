//! Access to the Kubernetes API.
//!
//! The migration talks to the cluster only through [`ManageResources`], which keeps the pipeline
//! testable without a cluster. [`K8sRepository`] is the implementation backed by a [`kube::Client`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::DeleteParams;
use kube::api::ListParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::Client;
use serde_json::json;

use crate::error::Result;
use crate::resources::KubeObject;
use crate::TryResource;

/// Create, read, update and delete any [`KubeObject`].
///
/// `namespace` is ignored for cluster scoped kinds.
#[async_trait]
pub trait ManageResources: Send + Sync {
    /// Lists all objects of a kind across all namespaces.
    async fn list<R: KubeObject>(&self) -> Result<Vec<R>>;

    async fn get<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Result<R>;

    /// Creates the object, honoring `metadata.generateName`, and returns what the server stored.
    async fn create<R: KubeObject>(&self, object: &R) -> Result<R>;

    /// Replaces the object identified by its metadata.
    async fn replace<R: KubeObject>(&self, object: &R) -> Result<R>;

    async fn delete<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Merges `annotations` into the annotations of an object.
    async fn annotate<R: KubeObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<R>;

    /// Like [`ManageResources::get`], but maps a missing object to `None`.
    async fn get_opt<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Result<Option<R>> {
        match self.get(namespace, name).await {
            Ok(object) => Ok(Some(object)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// The [`ManageResources`] implementation used against a real cluster.
#[derive(Clone)]
pub struct K8sRepository {
    client: Client,
}

impl K8sRepository {
    /// Creates a new [`K8sRepository`] with the given client.
    pub fn new(client: Client) -> Self {
        K8sRepository { client }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl ManageResources for K8sRepository {
    async fn list<R: KubeObject>(&self) -> Result<Vec<R>> {
        let list = R::api(self.client(), None).list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn get<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Result<R> {
        Ok(R::api(self.client(), namespace).get(name).await?)
    }

    async fn create<R: KubeObject>(&self, object: &R) -> Result<R> {
        let api = R::api(self.client(), object.metadata().namespace.as_deref());
        let object = object.clone().with_type_meta();
        Ok(api.create(&PostParams::default(), &object).await?)
    }

    async fn replace<R: KubeObject>(&self, object: &R) -> Result<R> {
        let api = R::api(self.client(), object.metadata().namespace.as_deref());
        let name = object.try_name()?;
        let object = object.clone().with_type_meta();
        Ok(api.replace(name, &PostParams::default(), &object).await?)
    }

    async fn delete<R: KubeObject>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        R::api(self.client(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn annotate<R: KubeObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        annotations: &BTreeMap<String, String>,
    ) -> Result<R> {
        let patch = json!({ "metadata": { "annotations": annotations } });
        Ok(R::api(self.client(), namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
