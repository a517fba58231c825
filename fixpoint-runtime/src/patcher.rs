//! Turns dirty resource cache entries into create and merge-patch calls.
//!
//! The engine is generic over resource kinds: each managed kind registers a
//! [`KindBinding`] pairing a cache key with a [`KindClient`]. The bindings
//! run in registration order, once to [`reload`](PatchEngine::reload) tracked
//! entries from the live API before the control loop, and once to
//! [`execute`](PatchEngine::execute) pending changes after it stabilizes.
//! Failures are isolated per kind: an entry that cannot be synced is evicted
//! so the next reconciliation starts from a fresh read instead of retrying
//! blindly.

use crate::client::{is_not_found, KindClient};
use crate::context::LoopContext;
use async_trait::async_trait;
use fixpoint_core::ResourceCacheEntry;
use kube::Resource;
use serde::Serialize;
use serde_json::Value;
use std::marker::PhantomData;
use tracing::{info, warn};

/// Compute a two-way JSON merge patch (RFC 7386) taking `original` to
/// `desired`: objects are diffed recursively, removed fields map to `null`,
/// and everything else (arrays included) is replaced wholesale.
fn merge_diff(original: &Value, desired: &Value) -> Value {
    match (original, desired) {
        (Value::Object(original), Value::Object(desired)) => {
            let mut patch = serde_json::Map::new();
            for (key, desired_value) in desired {
                match original.get(key) {
                    Some(original_value) if original_value == desired_value => {}
                    Some(original_value) => {
                        patch.insert(key.clone(), merge_diff(original_value, desired_value));
                    }
                    None => {
                        patch.insert(key.clone(), desired_value.clone());
                    }
                }
            }
            for key in original.keys() {
                if !desired.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => desired.clone(),
    }
}

fn create_patch<K: Serialize>(original: &K, desired: &K) -> Result<Value, serde_json::Error> {
    Ok(merge_diff(
        &serde_json::to_value(original)?,
        &serde_json::to_value(desired)?,
    ))
}

/// Binds one managed resource kind to its cache key and API client.
pub struct KindBinding<K, C> {
    key: String,
    client: C,
    _kind: PhantomData<fn() -> K>,
}

impl<K, C> KindBinding<K, C>
where
    C: KindClient<K>,
{
    /// Create a binding that syncs the cache entry under `key` through
    /// `client`. The key also serves as the kind label in log output.
    pub fn new(key: impl Into<String>, client: C) -> Self {
        Self {
            key: key.into(),
            client,
            _kind: PhantomData,
        }
    }
}

/// What `execute` found for one entry, snapshotted under the cache borrow
/// and carried across the client call.
enum Pending<K> {
    Create { desired: K },
    Diff { name: String, original: K, desired: K },
}

#[async_trait]
trait DynBinding: Send {
    async fn reload(&self, ctx: &mut LoopContext);
    async fn execute(&self, ctx: &mut LoopContext);
}

#[async_trait]
impl<K, C> DynBinding for KindBinding<K, C>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
    C: KindClient<K>,
{
    async fn reload(&self, ctx: &mut LoopContext) {
        let Some(name) = ctx
            .resources::<K>()
            .get(&self.key)
            .and_then(|entry| entry.name().map(str::to_owned))
        else {
            return;
        };
        match self.client.get(&name).await {
            Ok(fresh) => {
                let server_name = fresh.meta().name.clone();
                ctx.resources::<K>()
                    .set(&self.key, ResourceCacheEntry::new(server_name, fresh));
            }
            Err(err) => {
                if is_not_found(&err) {
                    warn!(resource = %self.key, name = %name, "tracked resource vanished out-of-band");
                } else {
                    warn!(resource = %self.key, name = %name, error = %err, "could not reload resource");
                }
                ctx.resources::<K>().remove(&self.key);
                ctx.set_requeue_now();
            }
        }
    }

    async fn execute(&self, ctx: &mut LoopContext) {
        let pending = {
            let Some(entry) = ctx.resources::<K>().get(&self.key) else {
                // Nothing tracked under this key, nothing to reconcile.
                return;
            };
            match entry.name() {
                None => Pending::Create {
                    desired: entry.value().clone(),
                },
                Some(name) => {
                    if !entry.is_patched() {
                        return;
                    }
                    Pending::Diff {
                        name: name.to_owned(),
                        original: entry.original().clone(),
                        desired: entry.value().clone(),
                    }
                }
            }
        };

        match pending {
            Pending::Create { desired } => {
                info!(resource = %self.key, "creating");
                match self.client.create(&desired).await {
                    Ok(created) => {
                        let server_name = created.meta().name.clone();
                        ctx.resources::<K>()
                            .set(&self.key, ResourceCacheEntry::new(server_name, created));
                    }
                    Err(err) => {
                        // Evict so creation is attempted again on the next
                        // natural redelivery; no requeue.
                        warn!(resource = %self.key, error = %err, "could not create new resource");
                        ctx.resources::<K>().remove(&self.key);
                    }
                }
            }
            Pending::Diff {
                name,
                original,
                desired,
            } => {
                let patch = match create_patch(&original, &desired) {
                    Ok(patch) => patch,
                    Err(err) => {
                        warn!(resource = %self.key, name = %name, error = %err, "could not create patch data");
                        ctx.resources::<K>().remove(&self.key);
                        ctx.set_requeue_now();
                        return;
                    }
                };
                if patch.as_object().is_some_and(serde_json::Map::is_empty) {
                    // The patches composed back to the observed state.
                    if let Some(entry) = ctx.resources::<K>().get_mut(&self.key) {
                        entry.reset_patched();
                    }
                    return;
                }
                info!(resource = %self.key, name = %name, "patching");
                match self.client.patch(&name, &patch).await {
                    Ok(patched) => {
                        let server_name = patched.meta().name.clone();
                        ctx.resources::<K>()
                            .set(&self.key, ResourceCacheEntry::new(server_name, patched));
                    }
                    Err(err) => {
                        // Modified or deleted externally; start over from a
                        // fresh read rather than retrying the stale patch.
                        warn!(resource = %self.key, name = %name, error = %err, "could not submit patch");
                        ctx.resources::<K>().remove(&self.key);
                        ctx.set_requeue_now();
                    }
                }
            }
        }
    }
}

/// Ordered collection of [`KindBinding`]s for all managed kinds, the custom
/// resource itself included; its entry follows the same patch protocol.
#[derive(Default)]
pub struct PatchEngine {
    bindings: Vec<Box<dyn DynBinding>>,
}

impl PatchEngine {
    /// Create an engine with no bindings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a binding. Bindings run in registration order.
    #[must_use]
    pub fn register<K, C>(mut self, binding: KindBinding<K, C>) -> Self
    where
        K: Resource + Clone + Serialize + Send + Sync + 'static,
        C: KindClient<K> + 'static,
    {
        self.bindings.push(Box::new(binding));
        self
    }

    /// Re-fetch every tracked (already created) entry from the live API so
    /// `original` values are accurate for the next diff and control
    /// functions observe externally-made changes. An entry whose object is
    /// gone is evicted and the reconciliation requeued.
    pub async fn reload(&self, ctx: &mut LoopContext) {
        for binding in &self.bindings {
            binding.reload(ctx).await;
        }
    }

    /// Apply all pending cache changes to the external API.
    pub async fn execute(&self, ctx: &mut LoopContext) {
        for binding in &self.bindings {
            binding.execute(ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{merge_diff, KindBinding, PatchEngine};
    use crate::client::KindClient;
    use crate::context::{Identity, LoopContext};
    use async_trait::async_trait;
    use fixpoint_core::ResourceCacheEntry;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::ErrorResponse;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn merge_diff_emits_only_changed_fields() {
        let original = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        let desired = json!({"a": 1, "b": {"c": 9, "d": 3}, "e": [1, 2, 3]});
        assert_eq!(
            merge_diff(&original, &desired),
            json!({"b": {"c": 9}, "e": [1, 2, 3]})
        );
    }

    #[test]
    fn merge_diff_marks_removed_fields_null() {
        let original = json!({"a": 1, "b": {"c": 2}});
        let desired = json!({"b": {}});
        assert_eq!(merge_diff(&original, &desired), json!({"a": null, "b": {"c": null}}));
    }

    #[test]
    fn merge_diff_of_identical_documents_is_empty() {
        let doc = json!({"a": {"b": [1, 2]}, "c": "x"});
        assert_eq!(merge_diff(&doc, &doc), json!({}));
    }

    #[test]
    fn merge_diff_agrees_with_rfc7386_apply() {
        let original = json!({
            "metadata": {"name": "cm", "labels": {"app": "x", "old": "y"}},
            "data": {"keep": "1", "drop": "2", "edit": "3"}
        });
        let desired = json!({
            "metadata": {"name": "cm", "labels": {"app": "x"}},
            "data": {"keep": "1", "edit": "4", "new": "5"}
        });
        let patch = merge_diff(&original, &desired);
        let mut applied = original.clone();
        json_patch::merge(&mut applied, &patch);
        assert_eq!(applied, desired);
    }

    /// In-memory client recording call counts; optionally failing writes.
    #[derive(Clone, Default)]
    struct FakeClient {
        state: Arc<Mutex<Option<ConfigMap>>>,
        fail_create: bool,
        creates: Arc<AtomicUsize>,
        patches: Arc<AtomicUsize>,
    }

    fn not_found() -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: "not found".into(),
            reason: "NotFound".into(),
            code: 404,
        })
    }

    #[async_trait]
    impl KindClient<ConfigMap> for FakeClient {
        async fn get(&self, _name: &str) -> kube::Result<ConfigMap> {
            self.state.lock().unwrap().clone().ok_or_else(not_found)
        }

        async fn create(&self, value: &ConfigMap) -> kube::Result<ConfigMap> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            if self.fail_create {
                return Err(not_found());
            }
            let mut created = value.clone();
            if created.metadata.name.is_none() {
                created.metadata.name = Some("server-assigned".into());
            }
            *self.state.lock().unwrap() = Some(created.clone());
            Ok(created)
        }

        async fn patch(&self, _name: &str, patch: &Value) -> kube::Result<ConfigMap> {
            self.patches.fetch_add(1, Ordering::SeqCst);
            let mut state = self.state.lock().unwrap();
            let current = state.clone().ok_or_else(not_found)?;
            let mut doc = serde_json::to_value(&current).unwrap();
            json_patch::merge(&mut doc, patch);
            let patched: ConfigMap = serde_json::from_value(doc).unwrap();
            *state = Some(patched.clone());
            Ok(patched)
        }

        async fn delete(&self, _name: &str) -> kube::Result<()> {
            self.state.lock().unwrap().take().map(|_| ()).ok_or_else(not_found)
        }

        async fn list(&self, _label_selector: &str) -> kube::Result<Vec<ConfigMap>> {
            Ok(self.state.lock().unwrap().clone().into_iter().collect())
        }
    }

    fn engine(client: FakeClient) -> PatchEngine {
        PatchEngine::new().register(KindBinding::<ConfigMap, _>::new("configmap", client))
    }

    fn ctx() -> LoopContext {
        LoopContext::new(Identity::new("app", "ns"))
    }

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn successful_create_assigns_the_server_name() {
        let client = FakeClient::default();
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::desired(ConfigMap::default()));

        engine.execute(&mut ctx).await;

        let entry = ctx.resources::<ConfigMap>().get("configmap").unwrap();
        assert_eq!(entry.name(), Some("server-assigned"));
        assert!(!entry.is_patched());
        assert_eq!(ctx.take_requeue(), None);
    }

    #[tokio::test]
    async fn failed_create_evicts_without_requeue() {
        let client = FakeClient {
            fail_create: true,
            ..FakeClient::default()
        };
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::desired(ConfigMap::default()));

        engine.execute(&mut ctx).await;

        assert!(ctx.resources::<ConfigMap>().get("configmap").is_none());
        assert_eq!(ctx.take_requeue(), None);
        assert_eq!(client.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unpatched_entry_never_triggers_a_patch_call() {
        let live = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let client = FakeClient {
            state: Arc::new(Mutex::new(Some(live.clone()))),
            ..FakeClient::default()
        };
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::new(Some("cm".into()), live));

        engine.execute(&mut ctx).await;

        assert_eq!(client.patches.load(Ordering::SeqCst), 0);
        assert!(ctx.resources::<ConfigMap>().get("configmap").is_some());
    }

    #[tokio::test]
    async fn patched_entry_is_submitted_and_replaced() {
        let live = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                ..ObjectMeta::default()
            },
            data: Some(data(&[("k", "old")])),
            ..ConfigMap::default()
        };
        let client = FakeClient {
            state: Arc::new(Mutex::new(Some(live.clone()))),
            ..FakeClient::default()
        };
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::new(Some("cm".into()), live));
        ctx.resources::<ConfigMap>()
            .get_mut("configmap")
            .unwrap()
            .apply_patch(|cm| {
                let mut cm = cm.clone();
                cm.data = Some(data(&[("k", "new")]));
                cm
            });

        engine.execute(&mut ctx).await;

        assert_eq!(client.patches.load(Ordering::SeqCst), 1);
        let entry = ctx.resources::<ConfigMap>().get("configmap").unwrap();
        assert!(!entry.is_patched());
        assert_eq!(
            entry.value().data.as_ref().and_then(|d| d.get("k")),
            Some(&"new".to_string())
        );
        assert_eq!(
            client.state.lock().unwrap().as_ref().unwrap().data,
            Some(data(&[("k", "new")]))
        );
    }

    #[tokio::test]
    async fn patch_composing_back_to_original_is_skipped() {
        let live = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                ..ObjectMeta::default()
            },
            data: Some(data(&[("k", "v")])),
            ..ConfigMap::default()
        };
        let client = FakeClient {
            state: Arc::new(Mutex::new(Some(live.clone()))),
            ..FakeClient::default()
        };
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::new(Some("cm".into()), live));
        // A patch that changes nothing still marks the entry dirty.
        ctx.resources::<ConfigMap>()
            .get_mut("configmap")
            .unwrap()
            .apply_patch(Clone::clone);

        engine.execute(&mut ctx).await;

        assert_eq!(client.patches.load(Ordering::SeqCst), 0);
        let entry = ctx.resources::<ConfigMap>().get("configmap").unwrap();
        assert!(!entry.is_patched());
    }

    #[tokio::test]
    async fn patch_of_externally_deleted_object_evicts_and_requeues() {
        let live = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        // The object is gone from the server, but still cached and dirty.
        let client = FakeClient::default();
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::new(Some("cm".into()), live));
        ctx.resources::<ConfigMap>()
            .get_mut("configmap")
            .unwrap()
            .apply_patch(|cm| {
                let mut cm = cm.clone();
                cm.data = Some(data(&[("k", "v")]));
                cm
            });

        engine.execute(&mut ctx).await;

        assert!(ctx.resources::<ConfigMap>().get("configmap").is_none());
        assert_eq!(ctx.take_requeue(), Some(std::time::Duration::ZERO));
    }

    #[tokio::test]
    async fn reload_refreshes_original_from_the_live_object() {
        let cached = ConfigMap {
            metadata: ObjectMeta {
                name: Some("cm".into()),
                ..ObjectMeta::default()
            },
            ..ConfigMap::default()
        };
        let live = ConfigMap {
            data: Some(data(&[("external", "edit")])),
            ..cached.clone()
        };
        let client = FakeClient {
            state: Arc::new(Mutex::new(Some(live.clone()))),
            ..FakeClient::default()
        };
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::new(Some("cm".into()), cached));

        engine.reload(&mut ctx).await;

        let entry = ctx.resources::<ConfigMap>().get("configmap").unwrap();
        assert_eq!(entry.original(), &live);
        assert!(!entry.is_patched());
        assert_eq!(ctx.take_requeue(), None);
    }

    #[tokio::test]
    async fn reload_of_vanished_object_evicts_and_requeues() {
        let client = FakeClient::default();
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>().set(
            "configmap",
            ResourceCacheEntry::new(
                Some("cm".into()),
                ConfigMap {
                    metadata: ObjectMeta {
                        name: Some("cm".into()),
                        ..ObjectMeta::default()
                    },
                    ..ConfigMap::default()
                },
            ),
        );

        engine.reload(&mut ctx).await;

        assert!(ctx.resources::<ConfigMap>().get("configmap").is_none());
        assert_eq!(ctx.take_requeue(), Some(std::time::Duration::ZERO));
    }

    #[tokio::test]
    async fn reload_skips_entries_not_yet_created() {
        let client = FakeClient::default();
        let engine = engine(client.clone());
        let mut ctx = ctx();
        ctx.resources::<ConfigMap>()
            .set("configmap", ResourceCacheEntry::desired(ConfigMap::default()));

        engine.reload(&mut ctx).await;

        // Still desired; creation is execute's job.
        let entry = ctx.resources::<ConfigMap>().get("configmap").unwrap();
        assert_eq!(entry.name(), None);
        assert_eq!(ctx.take_requeue(), None);
    }
}
