pub mod sync {
    pub use parking_lot::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
    pub use std::sync::Arc;
}

pub mod error;
pub mod mesh;

pub trait Extension {
    /// Returns an id of the extension. Should be the crate name (eg in a `consult-mesh-ext` format)
    fn id(&self) -> String;

    /// Returns the name of an extension
    fn name(&self) -> String;

    /// Returns the description of the extension
    fn description(&self) -> String {
        format!(
            "{} is an extension that provides full-mesh meeting sessions",
            self.name()
        )
    }
}
