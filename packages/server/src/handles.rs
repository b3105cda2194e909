//! Connection-scoped collection handles.

use std::collections::HashMap;
use std::sync::Arc;

use kvtree_core_store::{CollectionView, Error, Result};

/// The collection views a connection has been handed, by cid.
///
/// Asking again for the same csp returns the same cid. The registry lives
/// and dies with its connection.
#[derive(Default)]
pub(crate) struct HandleRegistry {
    next_cid: i64,
    by_csp: HashMap<String, i64>,
    by_cid: HashMap<i64, (String, Arc<dyn CollectionView>)>,
}

impl HandleRegistry {
    pub(crate) fn register(&mut self, csp: String, view: Arc<dyn CollectionView>) -> i64 {
        if let Some(cid) = self.by_csp.get(&csp) {
            return *cid;
        }
        self.next_cid += 1;
        let cid = self.next_cid;
        self.by_csp.insert(csp.clone(), cid);
        self.by_cid.insert(cid, (csp, view));
        cid
    }

    /// The view registered under `cid`, which must have been issued for
    /// `csp`.
    pub(crate) fn get(&self, cid: i64, csp: &str) -> Result<Arc<dyn CollectionView>> {
        match self.by_cid.get(&cid) {
            Some((registered, view)) if registered == csp => Ok(view.clone()),
            _ => Err(Error::InvalidHandle {
                csp: csp.to_string(),
                cid,
            }),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_cid.len()
    }

    pub(crate) fn clear(&mut self) {
        self.by_csp.clear();
        self.by_cid.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvtree_core_store::{
        CollectionKind, FunctionRegistry, HostId, InMemoryStore, KeyValueStore, MapCollection,
    };

    fn view() -> Arc<dyn CollectionView> {
        let store: Arc<dyn KeyValueStore> = Arc::new(InMemoryStore::new(
            "orders",
            HostId::default(),
            Arc::new(FunctionRegistry::default()),
        ));
        Arc::new(MapCollection::new(CollectionKind::KeySet, store))
    }

    #[test]
    fn same_csp_same_cid() {
        let mut handles = HandleRegistry::default();
        let a = handles.register("/orders?view=keySet".to_string(), view());
        let b = handles.register("/orders?view=keySet".to_string(), view());
        let c = handles.register("/orders?view=values".to_string(), view());
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(handles.len(), 2);
    }

    #[test]
    fn unknown_or_mismatched_handle_is_invalid() {
        let mut handles = HandleRegistry::default();
        let cid = handles.register("/orders?view=keySet".to_string(), view());
        assert!(handles.get(cid, "/orders?view=keySet").is_ok());
        assert!(matches!(
            handles.get(cid, "/other?view=keySet"),
            Err(Error::InvalidHandle { .. })
        ));
        assert!(matches!(
            handles.get(cid + 1, "/orders?view=keySet"),
            Err(Error::InvalidHandle { .. })
        ));

        handles.clear();
        assert!(handles.get(cid, "/orders?view=keySet").is_err());
    }
}
