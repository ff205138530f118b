use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};

/// Reference-counted cache of loaded models, keyed by model path.
///
/// The first `lease` for a path loads the model; later leases share it.
/// The model is released when the last lease is dropped, and reloaded by
/// the next `lease` after that.
pub struct SharedModelCache<T> {
    entries: Mutex<HashMap<PathBuf, Weak<T>>>,
}

impl<T> SharedModelCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a lease on the model at `path`, loading it with `load` if no
    /// live lease exists.
    pub fn lease<E>(
        &self,
        path: &Path,
        load: impl FnOnce(&Path) -> Result<T, E>,
    ) -> Result<Arc<T>, E> {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(model) = entries.get(&key).and_then(Weak::upgrade) {
            log::debug!("reusing loaded model {}", key.display());
            return Ok(model);
        }

        log::info!("loading model {}", key.display());
        let model = Arc::new(load(path)?);
        entries.insert(key, Arc::downgrade(&model));
        entries.retain(|_, weak| weak.strong_count() > 0);
        Ok(model)
    }

    /// Number of models currently held by at least one lease.
    pub fn loaded_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.values().filter(|w| w.strong_count() > 0).count()
    }
}

impl<T> Default for SharedModelCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
