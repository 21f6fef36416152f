use crate::storage::TagStore;
use crate::url::join_key;
use crate::Result;
use serde_json::Value;
use std::sync::Arc;

/// Tag store access scoped under one pipeline's namespace
///
/// All keys are stored as `<pipeline>/<key>`. Keys that already carry the
/// namespace are not prefixed twice.
#[derive(Clone)]
pub struct Tags {
    namespace: String,
    store: Arc<dyn TagStore>,
}

impl Tags {
    pub fn new(namespace: impl Into<String>, store: Arc<dyn TagStore>) -> Self {
        Self {
            namespace: namespace.into(),
            store,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Builds a namespaced key
    ///
    /// # Arguments
    ///
    /// * `parts` - Key parts; empty parts are skipped
    /// * `prefix` - Optional category inserted after the namespace, such as
    ///   `emit` or `inc`
    ///
    /// # Returns
    ///
    /// `<namespace>/[<prefix>/]<parts>`, or `None` when every part is empty
    ///
    /// # Example
    ///
    /// ```ignore
    /// assert_eq!(tags.make_key(&["a", "b"], Some("inc")), Some("gazette/inc/a/b".into()));
    /// ```
    pub fn make_key<S: AsRef<str>>(&self, parts: &[S], prefix: Option<&str>) -> Option<String> {
        let key = join_key(parts.iter().map(|p| p.as_ref()))?;
        let key = key
            .strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix('/'))
            .map(str::to_string)
            .unwrap_or(key);
        let key = match prefix {
            Some(prefix) => join_key([prefix, key.as_str()])?,
            None => key,
        };
        join_key([self.namespace.as_str(), key.as_str()])
    }

    fn qualify(&self, key: &str) -> Option<String> {
        if key.trim().is_empty() {
            tracing::warn!("Ignoring empty tag key");
            return None;
        }
        self.make_key(&[key], None)
    }

    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        if let Some(key) = self.qualify(key) {
            self.store.put(&key, value)?;
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        match self.qualify(key) {
            Some(key) => Ok(self.store.get(&key)?),
            None => Ok(None),
        }
    }

    pub fn check(&self, key: &str) -> Result<bool> {
        match self.qualify(key) {
            Some(key) => Ok(self.store.exists(&key)?),
            None => Ok(false),
        }
    }

    /// Writes a tag unless it exists; returns whether it was written
    pub fn set_if_absent(&self, key: &str, value: &Value) -> Result<bool> {
        match self.qualify(key) {
            Some(key) => Ok(self.store.put_if_absent(&key, value)?),
            None => Ok(false),
        }
    }

    /// Deletes every tag of the namespace
    pub fn flush(&self) -> Result<usize> {
        Ok(self.store.delete(&format!("{}/", self.namespace))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn tags(ns: &str) -> Tags {
        Tags::new(ns, Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_make_key() {
        let tags = tags("gazette");
        assert_eq!(tags.make_key(&["a", "b"], None).as_deref(), Some("gazette/a/b"));
        assert_eq!(
            tags.make_key(&["a"], Some("inc")).as_deref(),
            Some("gazette/inc/a")
        );
        assert_eq!(
            tags.make_key(&["gazette/emit/x"], None).as_deref(),
            Some("gazette/emit/x")
        );
        assert_eq!(
            tags.make_key(&["gazettes/x"], None).as_deref(),
            Some("gazette/gazettes/x")
        );
        assert_eq!(tags.make_key(&["", ""], Some("inc")), None);
    }

    #[test]
    fn test_set_get_check() {
        let tags = tags("gazette");
        assert!(!tags.check("page/1").unwrap());
        tags.set("page/1", &json!({"seen": true})).unwrap();
        assert!(tags.check("page/1").unwrap());
        assert!(tags.check("gazette/page/1").unwrap());
        assert_eq!(tags.get("page/1").unwrap(), Some(json!({"seen": true})));
    }

    #[test]
    fn test_empty_keys_ignored() {
        let tags = tags("gazette");
        tags.set("  ", &json!(1)).unwrap();
        assert!(!tags.check("").unwrap());
        assert_eq!(tags.get(" ").unwrap(), None);
        assert!(!tags.set_if_absent("", &json!(1)).unwrap());
    }

    #[test]
    fn test_set_if_absent_and_flush() {
        let store = Arc::new(MemoryStore::new());
        let a = Tags::new("a", store.clone());
        let b = Tags::new("b", store.clone());

        assert!(a.set_if_absent("k", &json!(1)).unwrap());
        assert!(!a.set_if_absent("k", &json!(2)).unwrap());
        assert_eq!(a.get("k").unwrap(), Some(json!(1)));

        b.set("k", &json!(3)).unwrap();
        assert_eq!(a.flush().unwrap(), 1);
        assert!(!a.check("k").unwrap());
        assert!(b.check("k").unwrap());
    }
}
