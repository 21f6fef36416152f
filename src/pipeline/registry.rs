//! Operation trait and the registry stage methods resolve against

use crate::context::Context;
use crate::{Data, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A stage body
///
/// Operations receive the invocation's [`Context`] and the item being
/// processed. They hand work downstream through [`Context::emit`] and report
/// failures by returning an error.
///
/// # Example
///
/// ```
/// use async_trait::async_trait;
/// use sumi_pipeline::{Context, Data, Operation, Result};
///
/// struct Shout;
///
/// #[async_trait]
/// impl Operation for Shout {
///     async fn execute(&self, ctx: &Context, mut data: Data) -> Result<()> {
///         data.insert("loud".into(), true.into());
///         ctx.emit(data)
///     }
/// }
/// ```
#[async_trait]
pub trait Operation: Send + Sync {
    async fn execute(&self, ctx: &Context, data: Data) -> Result<()>;
}

/// Maps method strings to operations
///
/// Three forms are resolved, in this order:
/// 1. a plain name registered with [`register`](Self::register), e.g. `fetch`
/// 2. `namespace:function`, registered with
///    [`register_namespaced`](Self::register_namespaced)
/// 3. `path/to/file:function`, registered with
///    [`register_file`](Self::register_file); the path is resolved against the
///    directory of the pipeline file
///
/// The third form is the extension mechanism: a binary embedding this crate
/// registers its operations under the file they live in, and pipeline files
/// may then refer to them by path.
#[derive(Default)]
pub struct OperationRegistry {
    builtins: HashMap<String, Arc<dyn Operation>>,
    namespaces: HashMap<String, HashMap<String, Arc<dyn Operation>>>,
    files: HashMap<PathBuf, HashMap<String, Arc<dyn Operation>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding every built-in operation
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::operations::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: &str, operation: impl Operation + 'static) -> &mut Self {
        self.builtins.insert(name.to_string(), Arc::new(operation));
        self
    }

    pub fn register_namespaced(
        &mut self,
        namespace: &str,
        name: &str,
        operation: impl Operation + 'static,
    ) -> &mut Self {
        self.namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(name.to_string(), Arc::new(operation));
        self
    }

    pub fn register_file(
        &mut self,
        path: impl AsRef<Path>,
        name: &str,
        operation: impl Operation + 'static,
    ) -> &mut Self {
        self.files
            .entry(canonical(path.as_ref()))
            .or_default()
            .insert(name.to_string(), Arc::new(operation));
        self
    }

    /// Resolves a method string
    ///
    /// # Arguments
    ///
    /// * `method` - The stage's configured method
    /// * `base_dir` - Directory relative file paths are resolved against
    ///
    /// # Returns
    ///
    /// The operation, or `None` if nothing is registered under that method
    pub fn resolve(&self, method: &str, base_dir: &Path) -> Option<Arc<dyn Operation>> {
        let method = method.trim();
        if let Some(op) = self.builtins.get(method) {
            return Some(op.clone());
        }

        let (module, function) = method.rsplit_once(':')?;
        if is_file_reference(module) {
            let path = base_dir.join(module);
            return self.files.get(&canonical(&path))?.get(function).cloned();
        }
        self.namespaces.get(module)?.get(function).cloned()
    }

    /// Names of the plain-name operations, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.builtins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn is_file_reference(module: &str) -> bool {
    module.contains('/') || module.contains('\\') || Path::new(module).extension().is_some()
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    #[async_trait]
    impl Operation for Counting {
        async fn execute(&self, _ctx: &Context, _data: Data) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting() -> Counting {
        Counting(Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = OperationRegistry::with_builtins();
        for name in ["init", "seed", "sequence", "dates", "fetch", "parse", "directory", "inspect"] {
            assert!(
                registry.resolve(name, Path::new(".")).is_some(),
                "missing builtin {}",
                name
            );
        }
        assert!(registry.resolve("nonexistent", Path::new(".")).is_none());
    }

    #[test]
    fn test_namespaced_resolution() {
        let mut registry = OperationRegistry::new();
        registry.register_namespaced("gazette", "split", counting());

        assert!(registry.resolve("gazette:split", Path::new(".")).is_some());
        assert!(registry.resolve("gazette:join", Path::new(".")).is_none());
        assert!(registry.resolve("other:split", Path::new(".")).is_none());
    }

    #[test]
    fn test_file_resolution_is_relative_to_base_dir() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("ops")).unwrap();
        let file = dir.path().join("ops/custom.rs");
        std::fs::write(&file, "").unwrap();

        let mut registry = OperationRegistry::new();
        registry.register_file(&file, "run", counting());

        assert!(registry.resolve("ops/custom.rs:run", dir.path()).is_some());
        assert!(registry.resolve("ops/custom.rs:other", dir.path()).is_none());
        assert!(registry.resolve("ops/custom.rs:run", Path::new("/elsewhere")).is_none());
    }

    #[test]
    fn test_plain_name_wins_over_namespace() {
        let mut registry = OperationRegistry::new();
        registry.register("a:b", counting());
        assert!(registry.resolve("a:b", Path::new(".")).is_some());
        assert_eq!(registry.names(), vec!["a:b"]);
    }
}
