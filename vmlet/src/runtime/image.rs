//! Seam to the image store.

use std::collections::HashSet;

use vmlet_shared::errors::VmletResult;

/// Maps the image name a user wrote to something the store can fetch.
pub trait ImageTranslator: Send + Sync {
    fn translate(&self, name: &str) -> String;
}

/// Leaves names untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl ImageTranslator for IdentityTranslator {
    fn translate(&self, name: &str) -> String {
        name.to_string()
    }
}

#[async_trait::async_trait]
pub trait ImageStore: Send + Sync {
    /// Fetch `name` and return the stored reference.
    async fn pull(&self, name: &str, translator: &dyn ImageTranslator) -> VmletResult<String>;

    async fn remove(&self, name: &str) -> VmletResult<()>;

    /// Delete every stored image not named in `in_use`.
    async fn gc(&self, in_use: &HashSet<String>) -> VmletResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_translator() {
        assert_eq!(IdentityTranslator.translate("cirros"), "cirros");
    }
}
