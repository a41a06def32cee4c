//! Listings nested under already-mapped parents.
//!
//! Examples and experiments are listed per dataset, runs and feedback per
//! experiment. Only mapped parents are walked, in sorted source id order.
//! The cursor is `<parent id>` (start of that parent's listing) or
//! `<parent id>:<inner cursor>`. Parents are found by id on resume, so
//! parents mapped in the meantime cannot shift the walk.

use serde_json::{json, Value};

use super::{ResourceKind, SourceItem};
use crate::error::Result;
use crate::mapping::IdMappingRegistry;
use crate::transport::{Cursor, Page, Transport};

/// Parent being listed and the position inside its listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ParentCursor {
    pub parent: String,
    pub inner: Option<Cursor>,
}

impl ParentCursor {
    fn start(parent: &str) -> Self {
        Self {
            parent: parent.to_string(),
            inner: None,
        }
    }

    /// Split at the first ':'; ids never contain one, inner cursors may.
    pub fn parse(cursor: &Cursor) -> Self {
        match cursor.as_str().split_once(':') {
            Some((parent, inner)) => Self {
                parent: parent.to_string(),
                inner: (!inner.is_empty()).then(|| Cursor::new(inner)),
            },
            None => Self::start(cursor.as_str()),
        }
    }

    pub fn encode(&self) -> Cursor {
        match &self.inner {
            Some(inner) => Cursor::new(format!("{}:{}", self.parent, inner)),
            None => Cursor::new(self.parent.clone()),
        }
    }
}

/// Per-parent offset listing, e.g. `GET /examples?dataset=<id>`.
pub(crate) struct ChildListing<'a> {
    pub path: &'a str,
    /// Query parameter carrying the parent's source id.
    pub parent_param: &'a str,
    /// Body field set to the parent id when the listing leaves it out.
    pub parent_field: &'a str,
    pub extra_query: &'a [(&'a str, &'a str)],
}

/// Snapshot of the mapped parents of one kind.
pub(crate) struct ParentWalk {
    parents: Vec<String>,
}

impl ParentWalk {
    pub fn new(registry: &IdMappingRegistry, parent_kind: ResourceKind) -> Self {
        Self {
            parents: registry.source_ids(parent_kind),
        }
    }

    /// Where to list next; None once every parent was walked.
    ///
    /// A cursor naming a parent that is not mapped any more continues at the
    /// next mapped id after it.
    pub fn position(&self, cursor: Option<&Cursor>) -> Option<ParentCursor> {
        let Some(cursor) = cursor else {
            return self.parents.first().map(|p| ParentCursor::start(p));
        };
        let at = ParentCursor::parse(cursor);
        match self.parents.binary_search(&at.parent) {
            Ok(_) => Some(at),
            Err(idx) => self.parents.get(idx).map(|p| ParentCursor::start(p)),
        }
    }

    /// Cursor following a page of `at` whose own listing continues at `inner_next`.
    pub fn next(&self, at: &ParentCursor, inner_next: Option<Cursor>) -> Option<Cursor> {
        if let Some(inner) = inner_next {
            return Some(
                ParentCursor {
                    parent: at.parent.clone(),
                    inner: Some(inner),
                }
                .encode(),
            );
        }
        let idx = match self.parents.binary_search(&at.parent) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        self.parents
            .get(idx)
            .map(|p| ParentCursor::start(p).encode())
    }

    /// Fetch the page at `cursor` of an offset listing nested under the parents.
    pub async fn fetch_offset_page(
        &self,
        source: &Transport,
        listing: &ChildListing<'_>,
        cursor: Option<&Cursor>,
        limit: usize,
    ) -> Result<Page<SourceItem>> {
        let Some(at) = self.position(cursor) else {
            return Ok(Page::last(Vec::new()));
        };

        let mut query = vec![(listing.parent_param.to_string(), at.parent.clone())];
        query.extend(
            listing
                .extra_query
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        let page = source
            .fetch_page(listing.path, &query, at.inner.as_ref(), limit)
            .await?;

        let offset = at.inner.as_ref().map(Cursor::as_offset).unwrap_or(0);
        let items = page
            .items
            .into_iter()
            .enumerate()
            .map(|(i, mut raw)| {
                if let Some(object) = raw.as_object_mut() {
                    if object.get(listing.parent_field).map_or(true, Value::is_null) {
                        object.insert(listing.parent_field.to_string(), json!(at.parent));
                    }
                }
                SourceItem::from_listing(raw, format!("{}/{}", at.parent, offset + i))
            })
            .collect();

        Ok(Page {
            items,
            next_cursor: self.next(&at, page.next_cursor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(parents: &[&str]) -> ParentWalk {
        let registry = IdMappingRegistry::new();
        for parent in parents {
            registry
                .put(ResourceKind::Dataset, parent, &format!("new-{}", parent), "fp")
                .unwrap();
        }
        ParentWalk::new(&registry, ResourceKind::Dataset)
    }

    #[test]
    fn test_cursor_encoding() {
        let at = ParentCursor::parse(&Cursor::new("d-1:300"));
        assert_eq!(at.parent, "d-1");
        assert_eq!(at.inner, Some(Cursor::offset(300)));
        assert_eq!(at.encode().as_str(), "d-1:300");

        // Opaque inner cursors keep their own separators
        let at = ParentCursor::parse(&Cursor::new("x-1:abc:def"));
        assert_eq!(at.inner, Some(Cursor::new("abc:def")));

        let at = ParentCursor::parse(&Cursor::new("d-2"));
        assert_eq!(at.inner, None);
        assert_eq!(at.encode().as_str(), "d-2");
    }

    #[test]
    fn test_walk_advances_through_parents() {
        let walk = walk(&["d-b", "d-a"]);
        let first = walk.position(None).unwrap();
        assert_eq!(first.parent, "d-a");

        assert_eq!(
            walk.next(&first, Some(Cursor::offset(2))).unwrap().as_str(),
            "d-a:2"
        );
        assert_eq!(walk.next(&first, None).unwrap().as_str(), "d-b");
        let last = walk.position(Some(&Cursor::new("d-b"))).unwrap();
        assert_eq!(walk.next(&last, None), None);
        assert!(self::walk(&[]).position(None).is_none());
    }

    #[test]
    fn test_resume_finds_parent_by_id() {
        // Saved while only d-b and d-d were mapped; d-a and d-c were mapped since
        let walk = walk(&["d-a", "d-b", "d-c", "d-d"]);
        let at = walk.position(Some(&Cursor::new("d-b:40"))).unwrap();
        assert_eq!(at.parent, "d-b");
        assert_eq!(at.inner, Some(Cursor::offset(40)));
        assert_eq!(walk.next(&at, None).unwrap().as_str(), "d-c");
    }

    #[test]
    fn test_unmapped_parent_continues_after_it() {
        let walk = walk(&["d-a", "d-c"]);
        let at = walk.position(Some(&Cursor::new("d-b:7"))).unwrap();
        assert_eq!(at, ParentCursor::start("d-c"));
        assert!(walk.position(Some(&Cursor::new("d-z"))).is_none());
    }
}
