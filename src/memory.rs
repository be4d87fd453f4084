//! In-memory [`ConfigStore`] with the admin API's path semantics
//!
//! Used to drive the reconciler and teardown engine without a running proxy,
//! and as the backing tree of the mock admin server in integration tests.
//! Every mutating call is recorded so tests can assert on ordering.

use crate::admin::ConfigStore;
use crate::error::AdminError;
use parking_lot::Mutex;
use serde_json::Value;

/// A mutating call made against a [`MemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub method: &'static str,
    pub path: String,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    root: Mutex<Value>,
    mutations: Mutex<Vec<Mutation>>,
}

impl MemoryStore {
    /// Store with no configuration loaded
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Value) -> Self {
        Self {
            root: Mutex::new(config),
            mutations: Mutex::new(Vec::new()),
        }
    }

    /// Copy of the whole tree
    pub fn snapshot(&self) -> Value {
        self.root.lock().clone()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().clone()
    }

    /// Paths passed to `delete`, in call order
    pub fn deleted_paths(&self) -> Vec<String> {
        self.mutations
            .lock()
            .iter()
            .filter(|m| m.method == "DELETE")
            .map(|m| m.path.clone())
            .collect()
    }

    fn record(&self, method: &'static str, path: &str) {
        self.mutations.lock().push(Mutation {
            method,
            path: path.to_string(),
        });
    }

    pub fn read_sync(&self, path: &str) -> Option<Value> {
        let root = self.root.lock();
        let node = lookup(&root, &segments(path))?;
        (!node.is_null()).then(|| node.clone())
    }

    pub fn create_sync(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.record("PUT", path);
        let mut root = self.root.lock();
        let parts = segments(path);

        let Some((last, parent_parts)) = parts.split_last() else {
            if !root.is_null() {
                return Err(rejected("PUT", path, 409, "config already exists"));
            }
            *root = value.clone();
            return Ok(());
        };

        let parent = lookup_mut(&mut root, parent_parts)
            .ok_or_else(|| rejected("PUT", path, 404, "parent path does not exist"))?;

        match parent {
            Value::Object(map) => {
                if map.contains_key(*last) {
                    return Err(rejected("PUT", path, 409, "key already exists"));
                }
                map.insert(last.to_string(), value.clone());
                Ok(())
            }
            Value::Array(items) => {
                let index = parse_index(last)
                    .filter(|i| *i <= items.len())
                    .ok_or_else(|| rejected("PUT", path, 400, "index out of range"))?;
                items.insert(index, value.clone());
                Ok(())
            }
            _ => Err(rejected("PUT", path, 400, "parent is not a container")),
        }
    }

    pub fn replace_sync(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.record("PATCH", path);
        let mut root = self.root.lock();
        let target = lookup_mut(&mut root, &segments(path))
            .filter(|v| !v.is_null())
            .ok_or_else(|| rejected("PATCH", path, 404, "path does not exist"))?;
        *target = value.clone();
        Ok(())
    }

    pub fn append_sync(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.record("POST", path);
        let mut root = self.root.lock();
        match lookup_mut(&mut root, &segments(path)) {
            Some(Value::Array(items)) => {
                items.push(value.clone());
                Ok(())
            }
            Some(_) => Err(rejected("POST", path, 400, "target is not a list")),
            None => Err(rejected("POST", path, 404, "path does not exist")),
        }
    }

    pub fn delete_sync(&self, path: &str) -> Result<(), AdminError> {
        self.record("DELETE", path);
        let mut root = self.root.lock();
        let parts = segments(path);

        let Some((last, parent_parts)) = parts.split_last() else {
            *root = Value::Null;
            return Ok(());
        };

        let missing = || rejected("DELETE", path, 404, "path does not exist");
        match lookup_mut(&mut root, parent_parts).ok_or_else(missing)? {
            Value::Object(map) => map.remove(*last).map(|_| ()).ok_or_else(missing),
            Value::Array(items) => {
                let index = parse_index(last)
                    .filter(|i| *i < items.len())
                    .ok_or_else(missing)?;
                items.remove(index);
                Ok(())
            }
            _ => Err(missing()),
        }
    }

    pub fn load_sync(&self, config: &Value) {
        self.record("LOAD", "");
        *self.root.lock() = config.clone();
    }
}

impl ConfigStore for MemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>, AdminError> {
        Ok(self.read_sync(path))
    }

    async fn create(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.create_sync(path, value)
    }

    async fn replace(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.replace_sync(path, value)
    }

    async fn append(&self, path: &str, value: &Value) -> Result<(), AdminError> {
        self.append_sync(path, value)
    }

    async fn delete(&self, path: &str) -> Result<(), AdminError> {
        self.delete_sync(path)
    }

    async fn load(&self, config: &Value) -> Result<(), AdminError> {
        self.load_sync(config);
        Ok(())
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn parse_index(segment: &str) -> Option<usize> {
    segment.parse().ok()
}

fn lookup<'a>(root: &'a Value, parts: &[&str]) -> Option<&'a Value> {
    parts.iter().try_fold(root, |node, part| match node {
        Value::Object(map) => map.get(*part),
        Value::Array(items) => items.get(parse_index(part)?),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Value, parts: &[&str]) -> Option<&'a mut Value> {
    parts.iter().try_fold(root, |node, part| match node {
        Value::Object(map) => map.get_mut(*part),
        Value::Array(items) => items.get_mut(parse_index(part)?),
        _ => None,
    })
}

fn rejected(method: &'static str, path: &str, status: u16, body: &str) -> AdminError {
    AdminError::Status {
        method,
        path: path.to_string(),
        status,
        body: body.to_string(),
    }
}
