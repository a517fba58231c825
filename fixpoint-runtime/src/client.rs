//! Transport seam between the engine and the external API.

use async_trait::async_trait;
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt::Debug;

/// Client operations the engine needs for one managed resource kind.
///
/// The engine is agnostic to transport: any implementation works as long as
/// `patch` merges by field (JSON merge patch semantics) and `create`/`patch`
/// return the server's canonical representation. The namespace is bound at
/// construction time (see [`Api::namespaced`]), so operations address objects
/// by name only.
///
/// Test suites implement this trait with in-memory state.
#[async_trait]
pub trait KindClient<K>: Send + Sync {
    /// Fetch the object named `name`.
    async fn get(&self, name: &str) -> kube::Result<K>;

    /// Create `value` and return the server's representation, including the
    /// server-assigned name.
    async fn create(&self, value: &K) -> kube::Result<K>;

    /// Submit a JSON merge patch against the object named `name` and return
    /// the server's representation.
    async fn patch(&self, name: &str, patch: &Value) -> kube::Result<K>;

    /// Delete the object named `name`.
    async fn delete(&self, name: &str) -> kube::Result<()>;

    /// List objects matching a label selector such as `app=example`.
    async fn list(&self, label_selector: &str) -> kube::Result<Vec<K>>;
}

#[async_trait]
impl<K> KindClient<K> for Api<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Serialize + Send + Sync,
{
    async fn get(&self, name: &str) -> kube::Result<K> {
        Api::get(self, name).await
    }

    async fn create(&self, value: &K) -> kube::Result<K> {
        Api::create(self, &PostParams::default(), value).await
    }

    async fn patch(&self, name: &str, patch: &Value) -> kube::Result<K> {
        Api::patch(self, name, &PatchParams::default(), &Patch::Merge(patch)).await
    }

    async fn delete(&self, name: &str) -> kube::Result<()> {
        Api::delete(self, name, &DeleteParams::default())
            .await
            .map(|_| ())
    }

    async fn list(&self, label_selector: &str) -> kube::Result<Vec<K>> {
        let lp = ListParams::default().labels(label_selector);
        Ok(Api::list(self, &lp).await?.items)
    }
}

/// Whether an API error is the server saying the object does not exist.
#[must_use]
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}
