//! Persistent Store: durable row-oriented collections under
//! `state/store/`, each backed by a `sled` tree, with watch/subscribe fanout
//! via a `tokio::sync::broadcast` channel per collection — the same
//! map-of-channels shape `common::wait_registry` uses for its per-subject
//! fanout, reused here for row-level change events instead of request/reply.
//!
//! A `broadcast::Receiver` that falls behind naturally yields
//! `RecvError::Lagged`, which this module surfaces directly as the
//! "resync, re-list" event the spec calls for — no separate cursor or
//! retention-window bookkeeping is needed on top of what `broadcast` already
//! tracks per receiver.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::broadcast;

use crate::error::{Error, Result};

#[derive(Clone, Debug)]
pub enum WatchEvent<T> {
    Put { id: String, value: T },
    Delete { id: String },
    /// Emitted to a freshly (re)subscribed receiver never signals loss by
    /// itself; callers observe loss via `RecvError::Lagged` from `recv()`.
    Resync,
}

pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::open(dir.join("rows"))?;
        Ok(Self { db })
    }

    pub fn collection<T>(&self, name: &str) -> Result<Collection<T>>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let tree = self.db.open_tree(name)?;
        let (tx, _rx) = broadcast::channel(1024);
        Ok(Collection {
            tree,
            tx: Arc::new(tx),
            _marker: PhantomData,
        })
    }
}

#[derive(Clone)]
pub struct Collection<T> {
    tree: sled::Tree,
    tx: Arc<broadcast::Sender<WatchEvent<T>>>,
    _marker: PhantomData<T>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub fn get(&self, id: &str) -> Result<Option<T>> {
        match self.tree.get(id)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (k, v) = item?;
            let id = String::from_utf8_lossy(&k).to_string();
            out.push((id, serde_json::from_slice(&v)?));
        }
        Ok(out)
    }

    /// Create-or-replace.
    pub fn put(&self, id: &str, value: T) -> Result<()> {
        let bytes = serde_json::to_vec(&value)?;
        self.tree.insert(id, bytes)?;
        self.tree.flush()?;
        let _ = self.tx.send(WatchEvent::Put {
            id: id.to_string(),
            value,
        });
        Ok(())
    }

    /// Optimistic patch: re-reads, applies `f`, and compare-and-swaps the raw
    /// bytes so a concurrent writer causes a `Conflict`, not a lost update.
    pub fn patch(&self, id: &str, f: impl FnOnce(&mut T) -> Result<()>) -> Result<T> {
        let before = self.tree.get(id)?;
        let mut value: T = match &before {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => return Err(Error::NotFound(id.to_string())),
        };
        f(&mut value)?;
        let after = serde_json::to_vec(&value)?;
        self.tree
            .compare_and_swap(id, before, Some(after))?
            .map_err(|_| Error::Conflict(format!("{id}: concurrent modification")))?;
        self.tree.flush()?;
        let _ = self.tx.send(WatchEvent::Put {
            id: id.to_string(),
            value: value.clone(),
        });
        Ok(value)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.tree.remove(id)?;
        self.tree.flush()?;
        let _ = self.tx.send(WatchEvent::Delete { id: id.to_string() });
        Ok(())
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Row {
        n: i32,
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let coll: Collection<Row> = store.collection("rows").unwrap();
        coll.put("a", Row { n: 1 }).unwrap();
        assert_eq!(coll.get("a").unwrap(), Some(Row { n: 1 }));
    }

    #[test]
    fn patch_on_missing_row_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let coll: Collection<Row> = store.collection("rows").unwrap();
        let err = coll.patch("missing", |r| {
            r.n += 1;
            Ok(())
        });
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[test]
    fn delete_removes_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let coll: Collection<Row> = store.collection("rows").unwrap();
        coll.put("a", Row { n: 1 }).unwrap();
        coll.delete("a").unwrap();
        assert_eq!(coll.get("a").unwrap(), None);
    }
}
