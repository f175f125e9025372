//! Pointer persistence
//!
//! The metadata service is consumed through [`PointerStore`]. Paths are plain
//! strings (`l/{stream}`, `s{i}/{stream}`); listing walks them in byte order.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::debug;
use uplink_core::{Pointer, Result};

/// Where a listing starts relative to its cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListDirection {
    /// Entries before the cursor, without it
    Before,
    /// Entries before the cursor, including it
    Backward,
    /// Entries from the cursor on, including it
    Forward,
    /// Entries after the cursor, without it
    #[default]
    After,
}

impl ListDirection {
    pub fn is_backward(self) -> bool {
        matches!(self, Self::Before | Self::Backward)
    }

    /// Direction that continues a page in this direction, with the page's
    /// outermost entry as the new cursor
    pub fn continuation(self) -> Self {
        if self.is_backward() {
            Self::Before
        } else {
            Self::After
        }
    }
}

/// One listing entry. `path` is relative to the listed prefix.
#[derive(Debug, Clone)]
pub struct ListItem {
    pub path: String,
    /// None for collapsed prefixes
    pub pointer: Option<Pointer>,
    pub is_prefix: bool,
}

/// One page of a listing
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<ListItem>,
    /// More items follow the last one returned
    pub more: bool,
}

/// Metadata service storing segment pointers
#[async_trait]
pub trait PointerStore: Send + Sync {
    async fn put_pointer(&self, path: &str, pointer: &Pointer) -> Result<()>;

    async fn get_pointer(&self, path: &str) -> Result<Option<Pointer>>;

    /// Returns false when nothing was stored at `path`
    async fn delete_pointer(&self, path: &str) -> Result<bool>;

    /// Pointers under `prefix` on the `direction` side of `cursor` (relative
    /// to the prefix). Items come back in path order; a backward page holds
    /// the entries closest to the cursor and `more` means earlier entries
    /// remain. Without `recursive`, deeper paths collapse into one prefix
    /// item ending in `/`. A `limit` of 0 means no limit.
    async fn list_pointers(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        direction: ListDirection,
        recursive: bool,
        limit: usize,
    ) -> Result<ListPage>;
}

/// In-process pointer store.
///
/// Pointers are kept in their wire form, so every read decodes what a remote
/// metadata service would have returned.
#[derive(Default)]
pub struct MemoryPointerStore {
    pointers: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryPointerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pointers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.read().is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.pointers.read().contains_key(path)
    }

    /// All stored paths in order
    pub fn paths(&self) -> Vec<String> {
        self.pointers.read().keys().cloned().collect()
    }
}

#[async_trait]
impl PointerStore for MemoryPointerStore {
    async fn put_pointer(&self, path: &str, pointer: &Pointer) -> Result<()> {
        let bytes = pointer.to_bytes()?;
        debug!(path, size = bytes.len(), "Storing pointer");
        self.pointers.write().insert(path.to_string(), bytes);
        Ok(())
    }

    async fn get_pointer(&self, path: &str) -> Result<Option<Pointer>> {
        match self.pointers.read().get(path) {
            Some(bytes) => Ok(Some(Pointer::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete_pointer(&self, path: &str) -> Result<bool> {
        Ok(self.pointers.write().remove(path).is_some())
    }

    async fn list_pointers(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        direction: ListDirection,
        recursive: bool,
        limit: usize,
    ) -> Result<ListPage> {
        let cursor = cursor.filter(|c| !c.is_empty());
        let bounds = list_bounds(prefix, cursor, direction);
        let backward = direction.is_backward();
        // Forward from the cursor, a collapsed prefix equal to it was already
        // returned by the previous page
        let seen_dir = match direction {
            ListDirection::After => cursor,
            _ => None,
        };

        let pointers = self.pointers.read();
        let range = pointers.range::<String, _>(bounds);
        let entries: Box<dyn Iterator<Item = (&String, &Vec<u8>)>> = if backward {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };

        let mut page = ListPage::default();
        let mut matched = false;

        for (path, bytes) in entries {
            let rest = match path.strip_prefix(prefix) {
                Some(rest) => {
                    matched = true;
                    rest
                }
                // Walking backward from the end, paths past the prefix come first
                None if backward && !matched => continue,
                None => break,
            };
            if rest.is_empty() {
                continue;
            }

            let item = match rest.find('/') {
                Some(pos) if !recursive => {
                    let dir = &rest[..=pos];
                    let repeated = page.items.last().is_some_and(|last| last.path == dir);
                    if repeated || seen_dir == Some(dir) {
                        continue;
                    }
                    ListItem {
                        path: dir.to_string(),
                        pointer: None,
                        is_prefix: true,
                    }
                }
                _ => ListItem {
                    path: rest.to_string(),
                    pointer: Some(Pointer::from_bytes(bytes)?),
                    is_prefix: false,
                },
            };

            if limit > 0 && page.items.len() == limit {
                page.more = true;
                break;
            }
            page.items.push(item);
        }

        if backward {
            page.items.reverse();
        }
        Ok(page)
    }
}

/// Key range a listing walks
fn list_bounds(
    prefix: &str,
    cursor: Option<&str>,
    direction: ListDirection,
) -> (Bound<String>, Bound<String>) {
    let from_prefix = Bound::Included(prefix.to_string());
    let Some(cursor) = cursor else {
        return (from_prefix, Bound::Unbounded);
    };
    let at = format!("{}{}", prefix, cursor);

    match direction {
        ListDirection::After => (Bound::Excluded(at), Bound::Unbounded),
        ListDirection::Forward => (Bound::Included(at), Bound::Unbounded),
        ListDirection::Before => (from_prefix, Bound::Excluded(at)),
        ListDirection::Backward => match cursor.strip_suffix('/') {
            // Include everything inside a collapsed prefix: '0' follows '/'
            Some(dir) => (from_prefix, Bound::Excluded(format!("{}{}0", prefix, dir))),
            None => (from_prefix, Bound::Included(at)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use uplink_core::{CipherKind, EncryptionScheme, KeySalt, SegmentKey, StreamPath};

    fn pointer(stream: &str) -> Pointer {
        Pointer::inline(
            SegmentKey::new(StreamPath::from(stream), 0),
            KeySalt::random(),
            Bytes::from_static(b"ciphertext"),
            0,
            EncryptionScheme::new(CipherKind::AesGcm, 1024).unwrap(),
            true,
        )
    }

    async fn store_with(paths: &[&str]) -> MemoryPointerStore {
        let store = MemoryPointerStore::new();
        for path in paths {
            store.put_pointer(path, &pointer(path)).await.unwrap();
        }
        store
    }

    fn paths(page: &ListPage) -> Vec<&str> {
        page.items.iter().map(|i| i.path.as_str()).collect()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryPointerStore::new();
        let p = pointer("b/k");

        store.put_pointer("l/b/k", &p).await.unwrap();
        assert_eq!(store.get_pointer("l/b/k").await.unwrap(), Some(p));
        assert!(store.get_pointer("l/b/other").await.unwrap().is_none());

        assert!(store.delete_pointer("l/b/k").await.unwrap());
        assert!(!store.delete_pointer("l/b/k").await.unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_recursive() {
        let store = store_with(&["l/b/a", "l/b/dir/x", "l/b/dir/y", "l/c/z", "s0/b/a"]).await;

        let page = store
            .list_pointers("l/b/", None, ListDirection::After, true, 0)
            .await
            .unwrap();
        assert_eq!(paths(&page), vec!["a", "dir/x", "dir/y"]);
        assert!(!page.more);
        assert!(page.items.iter().all(|i| i.pointer.is_some()));
    }

    #[tokio::test]
    async fn test_list_collapses_prefixes() {
        let store = store_with(&["l/b/a", "l/b/dir/x", "l/b/dir/y", "l/b/z"]).await;

        let page = store
            .list_pointers("l/b/", None, ListDirection::After, false, 0)
            .await
            .unwrap();
        assert_eq!(paths(&page), vec!["a", "dir/", "z"]);
        assert!(page.items[1].is_prefix);
        assert!(page.items[1].pointer.is_none());
    }

    #[tokio::test]
    async fn test_list_pages_with_cursor() {
        let store = store_with(&["l/b/a", "l/b/b", "l/b/c", "l/b/d"]).await;

        let first = store
            .list_pointers("l/b/", None, ListDirection::After, true, 2)
            .await
            .unwrap();
        assert_eq!(paths(&first), vec!["a", "b"]);
        assert!(first.more);

        let second = store
            .list_pointers("l/b/", Some("b"), ListDirection::After, true, 2)
            .await
            .unwrap();
        assert_eq!(paths(&second), vec!["c", "d"]);
        assert!(!second.more);
    }

    #[tokio::test]
    async fn test_cursor_on_collapsed_prefix() {
        let store = store_with(&["l/b/dir/x", "l/b/dir/y", "l/b/z"]).await;

        let page = store
            .list_pointers("l/b/", Some("dir/"), ListDirection::After, false, 0)
            .await
            .unwrap();
        assert_eq!(paths(&page), vec!["z"]);
    }

    async fn listed(
        store: &MemoryPointerStore,
        cursor: Option<&str>,
        direction: ListDirection,
    ) -> Vec<String> {
        let page = store
            .list_pointers("l/b/", cursor, direction, true, 0)
            .await
            .unwrap();
        page.items.into_iter().map(|i| i.path).collect()
    }

    #[tokio::test]
    async fn test_list_directions() {
        let store = store_with(&["l/b/a", "l/b/b", "l/b/c", "l/b/d", "l/c/z"]).await;

        assert_eq!(listed(&store, Some("b"), ListDirection::After).await, ["c", "d"]);
        assert_eq!(
            listed(&store, Some("b"), ListDirection::Forward).await,
            ["b", "c", "d"]
        );
        assert_eq!(listed(&store, Some("c"), ListDirection::Before).await, ["a", "b"]);
        assert_eq!(
            listed(&store, Some("c"), ListDirection::Backward).await,
            ["a", "b", "c"]
        );
        // No cursor lists backward from the end of the prefix
        assert_eq!(
            listed(&store, None, ListDirection::Before).await,
            ["a", "b", "c", "d"]
        );
    }

    #[tokio::test]
    async fn test_backward_pages_hold_closest_entries() {
        let store = store_with(&["l/b/a", "l/b/b", "l/b/c", "l/b/d"]).await;

        let page = store
            .list_pointers("l/b/", Some("d"), ListDirection::Before, true, 2)
            .await
            .unwrap();
        assert_eq!(paths(&page), vec!["b", "c"]);
        assert!(page.more);

        let rest = store
            .list_pointers("l/b/", Some("b"), ListDirection::Before.continuation(), true, 2)
            .await
            .unwrap();
        assert_eq!(paths(&rest), vec!["a"]);
        assert!(!rest.more);
    }

    #[tokio::test]
    async fn test_backward_collapses_prefixes() {
        let store = store_with(&["l/b/a", "l/b/dir/x", "l/b/dir/y", "l/b/z"]).await;

        let page = store
            .list_pointers("l/b/", Some("dir/"), ListDirection::Backward, false, 0)
            .await
            .unwrap();
        assert_eq!(paths(&page), vec!["a", "dir/"]);

        let page = store
            .list_pointers("l/b/", Some("dir/"), ListDirection::Forward, false, 0)
            .await
            .unwrap();
        assert_eq!(paths(&page), vec!["dir/", "z"]);

        let page = store
            .list_pointers("l/b/", Some("z"), ListDirection::Before, false, 0)
            .await
            .unwrap();
        assert_eq!(paths(&page), vec!["a", "dir/"]);
    }
}
