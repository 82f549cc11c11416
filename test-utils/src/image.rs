use std::collections::HashSet;

use parking_lot::Mutex;
use vmlet::runtime::{ImageStore, ImageTranslator};
use vmlet_shared::errors::{VmletError, VmletResult};

/// [`ImageStore`] that remembers names instead of downloading anything.
#[derive(Default)]
pub struct FakeImageStore {
    images: Mutex<HashSet<String>>,
    last_gc_in_use: Mutex<Option<HashSet<String>>>,
}

impl FakeImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.images.lock().contains(name)
    }

    /// The `in_use` set of the most recent GC.
    pub fn last_gc_in_use(&self) -> Option<HashSet<String>> {
        self.last_gc_in_use.lock().clone()
    }
}

#[async_trait::async_trait]
impl ImageStore for FakeImageStore {
    async fn pull(&self, name: &str, translator: &dyn ImageTranslator) -> VmletResult<String> {
        let reference = translator.translate(name);
        self.images.lock().insert(reference.clone());
        Ok(reference)
    }

    async fn remove(&self, name: &str) -> VmletResult<()> {
        if !self.images.lock().remove(name) {
            return Err(VmletError::NotFound(format!("image {:?}", name)));
        }
        Ok(())
    }

    async fn gc(&self, in_use: &HashSet<String>) -> VmletResult<()> {
        self.images.lock().retain(|name| in_use.contains(name));
        *self.last_gc_in_use.lock() = Some(in_use.clone());
        Ok(())
    }
}
