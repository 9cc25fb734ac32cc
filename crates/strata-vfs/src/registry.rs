//! Process-wide VFS registry.
//!
//! The one legitimately process-global datum in the storage core: a mapping
//! from scheme name to VFS implementation, populated at startup and read
//! thereafter. The built-in "unix" and "memory" entries are installed on
//! first use.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::memory::MemoryVfs;
use crate::traits::Vfs;
use crate::unix::UnixVfs;

fn table() -> &'static RwLock<HashMap<String, Arc<dyn Vfs>>> {
    static TABLE: OnceLock<RwLock<HashMap<String, Arc<dyn Vfs>>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn Vfs>> = HashMap::new();
        map.insert("unix".to_owned(), Arc::new(UnixVfs::new()));
        map.insert("memory".to_owned(), Arc::new(MemoryVfs::new()));
        RwLock::new(map)
    })
}

/// Register a VFS under `name`. Returns `false` when the name is taken.
pub fn register(name: &str, vfs: Arc<dyn Vfs>) -> bool {
    let mut map = table().write();
    if map.contains_key(name) {
        return false;
    }
    map.insert(name.to_owned(), vfs);
    true
}

/// Look up a VFS by name.
#[must_use]
pub fn find(name: &str) -> Option<Arc<dyn Vfs>> {
    table().read().get(name).cloned()
}

/// The default on-disk VFS.
#[must_use]
pub fn default_vfs() -> Arc<dyn Vfs> {
    find("unix").expect("built-in unix vfs is always registered")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        assert!(find("unix").is_some());
        assert!(find("memory").is_some());
        assert!(find("nope").is_none());
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        assert!(!register("unix", Arc::new(UnixVfs::new())));
    }

    #[test]
    fn custom_registration() {
        assert!(register("custom-mem", Arc::new(MemoryVfs::new())));
        assert_eq!(find("custom-mem").unwrap().name(), "memory");
    }
}
