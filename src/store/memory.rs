use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};

use super::{ResourceStore, StoredKind, object_name};
use crate::controller::{Error, Result};
use crate::crd::Tenant;

/// Kind of write recorded by [`InMemoryStore`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Replace,
    Delete,
    Status,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: WriteOp,
    pub kind: &'static str,
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct ObjectKey {
    kind: &'static str,
    namespace: Option<String>,
    name: String,
}

impl ObjectKey {
    fn of<K: StoredKind>(namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: K::KIND,
            namespace: if K::NAMESPACED {
                namespace.map(str::to_string)
            } else {
                None
            },
            name: name.to_string(),
        }
    }
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    writes: Vec<WriteRecord>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn record(&mut self, op: WriteOp, key: &ObjectKey) {
        self.writes.push(WriteRecord {
            op,
            kind: key.kind,
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        });
    }

    /// Remove an object and everything that depends on it
    fn remove_cascading(&mut self, key: &ObjectKey) {
        let Some(removed) = self.objects.remove(key) else {
            return;
        };

        let uid = removed["metadata"]["uid"].as_str().map(str::to_string);
        let dependents: Vec<ObjectKey> = self
            .objects
            .iter()
            .filter(|(k, obj)| {
                let in_namespace = key.kind == "Namespace"
                    && k.namespace.as_deref() == Some(key.name.as_str());
                let owned = uid.as_deref().is_some_and(|uid| owned_by(obj, uid));
                in_namespace || owned
            })
            .map(|(k, _)| k.clone())
            .collect();

        for dependent in dependents {
            self.remove_cascading(&dependent);
        }
    }
}

fn owned_by(obj: &Value, uid: &str) -> bool {
    obj["metadata"]["ownerReferences"]
        .as_array()
        .is_some_and(|refs| refs.iter().any(|r| r["uid"].as_str() == Some(uid)))
}

/// Parse an equality-only label selector into its terms
fn parse_selector(selector: &str) -> Result<Vec<(&str, &str)>> {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .map(|term| {
            term.split_once('=')
                .map(|(k, v)| (k.trim(), v.trim()))
                .ok_or_else(|| Error::InvalidConfig(format!("unsupported label selector: {term}")))
        })
        .collect()
}

fn labels_match(obj: &Value, terms: &[(&str, &str)]) -> bool {
    let labels = &obj["metadata"]["labels"];
    terms
        .iter()
        .all(|(key, value)| labels[*key].as_str() == Some(*value))
}

fn has_finalizers(obj: &Value) -> bool {
    obj["metadata"]["finalizers"]
        .as_array()
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(obj: &Value) -> bool {
    !obj["metadata"]["deletionTimestamp"].is_null()
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// In-process [`ResourceStore`].
///
/// Emulates resourceVersion preconditions, status subresources, finalizers,
/// owner-reference garbage collection and namespace deletion. Every write is
/// recorded so callers can assert on the exact calls a reconciliation made.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All writes performed through the [`ResourceStore`] interface so far
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Seed an object without recording a write. Assigns uid and resourceVersion.
    pub fn insert<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let key = ObjectKey::of::<K>(obj.meta().namespace.as_deref(), name);
        let mut value = serde_json::to_value(obj)?;

        let mut inner = self.lock();
        let version = inner.next_version();
        let metadata = &mut value["metadata"];
        if metadata["uid"].is_null() {
            metadata["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        metadata["resourceVersion"] = json!(version);
        if metadata["generation"].is_null() {
            metadata["generation"] = json!(1);
        }
        inner.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Read an object without going through the async interface
    pub fn snapshot<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        let key = ObjectKey::of::<K>(namespace, name);
        let value = self.lock().objects.get(&key).cloned()?;
        serde_json::from_value(value).ok()
    }

    pub fn contains<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&ObjectKey::of::<K>(namespace, name))
    }

    /// Number of stored objects of a kind
    pub fn count<K: StoredKind>(&self) -> usize {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.kind == K::KIND)
            .count()
    }

    /// Edit an object out of band (an external actor), bumping its resourceVersion
    pub fn mutate<K, F>(&self, namespace: Option<&str>, name: &str, edit: F) -> Result<()>
    where
        K: StoredKind,
        F: FnOnce(&mut K),
    {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut inner = self.lock();
        let current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} {}", K::KIND, name)))?;

        let mut obj: K = serde_json::from_value(current)?;
        edit(&mut obj);
        let mut value = serde_json::to_value(&obj)?;
        value["metadata"]["resourceVersion"] = json!(inner.next_version());
        inner.objects.insert(key, value);
        Ok(())
    }

    /// Mark a tenant for deletion the way the API server does on DELETE
    pub fn request_deletion(&self, name: &str) {
        let key = ObjectKey::of::<Tenant>(None, name);
        let mut inner = self.lock();
        let Some(obj) = inner.objects.get(&key).cloned() else {
            return;
        };
        if has_finalizers(&obj) {
            let version = inner.next_version();
            if let Some(obj) = inner.objects.get_mut(&key) {
                obj["metadata"]["deletionTimestamp"] = json!(now());
                obj["metadata"]["resourceVersion"] = json!(version);
            }
        } else {
            inner.remove_cascading(&key);
        }
    }

    fn check_version(current: &Value, desired: &Value, key: &ObjectKey) -> Result<()> {
        let expected = &desired["metadata"]["resourceVersion"];
        if !expected.is_null() && expected != &current["metadata"]["resourceVersion"] {
            return Err(Error::Conflict {
                kind: key.kind,
                name: key.name.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>> {
        if K::NAMESPACED && namespace.is_none() {
            return Err(Error::MissingObjectKey("metadata.namespace"));
        }
        Ok(self.snapshot(namespace, name))
    }

    async fn create<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let namespace = obj.meta().namespace.as_deref();
        if K::NAMESPACED {
            let ns = namespace.ok_or(Error::MissingObjectKey("metadata.namespace"))?;
            // Creating into a missing or terminating namespace is rejected
            let ns_key = ObjectKey::of::<k8s_openapi::api::core::v1::Namespace>(None, ns);
            if !self.lock().objects.contains_key(&ns_key) {
                return Err(Error::NotFound(format!("namespace {ns}")));
            }
        }

        let key = ObjectKey::of::<K>(namespace, name);
        let mut value = serde_json::to_value(obj)?;

        let mut inner = self.lock();
        inner.record(WriteOp::Create, &key);
        if inner.objects.contains_key(&key) {
            return Err(Error::Conflict {
                kind: K::KIND,
                name: name.to_string(),
            });
        }

        let version = inner.next_version();
        if let Some(map) = value.as_object_mut() {
            map.remove("status");
        }
        let metadata = &mut value["metadata"];
        metadata["uid"] = json!(uuid::Uuid::new_v4().to_string());
        metadata["resourceVersion"] = json!(version);
        metadata["generation"] = json!(1);
        metadata["creationTimestamp"] = json!(now());

        inner.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    async fn replace<K: StoredKind>(&self, obj: &K) -> Result<K> {
        let name = object_name(obj)?;
        let key = ObjectKey::of::<K>(obj.meta().namespace.as_deref(), name);
        let mut value = serde_json::to_value(obj)?;

        let mut inner = self.lock();
        inner.record(WriteOp::Replace, &key);
        let current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("{} {}", K::KIND, name)))?;
        Self::check_version(&current, &value, &key)?;

        // Status belongs to the status subresource; identity fields are server-owned
        value["status"] = current["status"].clone();
        if value["status"].is_null() {
            if let Some(map) = value.as_object_mut() {
                map.remove("status");
            }
        }
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            value["metadata"][field] = current["metadata"][field].clone();
        }
        let generation = current["metadata"]["generation"].as_i64().unwrap_or(1);
        value["metadata"]["generation"] = if value["spec"] != current["spec"] {
            json!(generation + 1)
        } else {
            json!(generation)
        };
        value["metadata"]["resourceVersion"] = json!(inner.next_version());

        if is_deleting(&value) && !has_finalizers(&value) {
            inner.objects.insert(key.clone(), value.clone());
            inner.remove_cascading(&key);
        } else {
            inner.objects.insert(key, value.clone());
        }
        Ok(serde_json::from_value(value)?)
    }

    async fn list<K: StoredKind>(
        &self,
        namespace: Option<&str>,
        label_selector: &str,
    ) -> Result<Vec<K>> {
        if K::NAMESPACED && namespace.is_none() {
            return Err(Error::MissingObjectKey("metadata.namespace"));
        }
        let terms = parse_selector(label_selector)?;
        let namespace = if K::NAMESPACED { namespace } else { None };

        let matching: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|(key, obj)| {
                key.kind == K::KIND
                    && key.namespace.as_deref() == namespace
                    && labels_match(obj, &terms)
            })
            .map(|(_, obj)| obj.clone())
            .collect();
        matching
            .into_iter()
            .map(|obj| serde_json::from_value(obj).map_err(Error::from))
            .collect()
    }

    async fn delete<K: StoredKind>(&self, namespace: Option<&str>, name: &str) -> Result<bool> {
        let key = ObjectKey::of::<K>(namespace, name);
        let mut inner = self.lock();
        inner.record(WriteOp::Delete, &key);

        let Some(current) = inner.objects.get(&key).cloned() else {
            return Ok(false);
        };
        if has_finalizers(&current) {
            if !is_deleting(&current) {
                let version = inner.next_version();
                if let Some(obj) = inner.objects.get_mut(&key) {
                    obj["metadata"]["deletionTimestamp"] = json!(now());
                    obj["metadata"]["resourceVersion"] = json!(version);
                }
            }
        } else {
            inner.remove_cascading(&key);
        }
        Ok(true)
    }

    async fn replace_tenant_status(&self, tenant: &Tenant) -> Result<Tenant> {
        let name = object_name(tenant)?;
        let key = ObjectKey::of::<Tenant>(None, name);
        let desired = serde_json::to_value(tenant)?;

        let mut inner = self.lock();
        inner.record(WriteOp::Status, &key);
        let mut current = inner
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Tenant {name}")))?;
        Self::check_version(&current, &desired, &key)?;

        current["status"] = desired["status"].clone();
        current["metadata"]["resourceVersion"] = json!(inner.next_version());
        inner.objects.insert(key, current.clone());
        Ok(serde_json::from_value(current)?)
    }
}
