use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::validate::validate_name;

/// Namespaced identifier of a stored object, rendered as `namespace/name`.
///
/// This is also the reconciliation queue key format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Split a `namespace/name` key. A bare `name` resolves to `default_namespace`.
    pub fn parse(key: &str, default_namespace: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        let (namespace, name) = match parts.as_slice() {
            [name] => (default_namespace, *name),
            [namespace, name] => (*namespace, *name),
            _ => bail!("unexpected key format: '{}'", key),
        };
        validate_name(namespace)?;
        validate_name(name)?;
        Ok(Self::new(namespace, name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
