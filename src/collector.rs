use std::{iter::FusedIterator, marker::PhantomData, ops::Deref};

use compact_str::CompactString;
use rustc_hash::FxHashSet;
use tracing::instrument;

use crate::{
    api::{
        ApiError, CategoryMember, ContinuationToken, EditorRef, Page, PageFetcher, PageId, Query,
        Revision, RevisionEntry, RevisionHistorySource,
    },
    rate_limit::{RateLimiter, Sleeper},
    utils::natural_cmp,
};

pub const CATEGORY_CONTINUE_KEY: &str = "cmcontinue";
pub const REVISION_CONTINUE_KEY: &str = "rvcontinue";

#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    /// Pages are counted from 0.
    #[error("fetching page {page_index} of the collection failed")]
    Fetch {
        page_index: usize,
        #[source]
        source: ApiError,
    },
    #[error("collection finished without yielding any items")]
    Exhausted,
    #[error("revision history of {page} is inconsistent at revision {revision_id}: {reason}")]
    InconsistentHistory {
        page: PageId,
        revision_id: u64,
        reason: &'static str,
    },
}

/// Lazy walk over a paged collection.
///
/// Every item is one remote page, requested through [`RateLimiter::before_request`]. The walk
/// ends after the first page without a continuation token or after the first failure; the
/// fetcher is never called again after that.
pub struct Pages<'l, T, F, S> {
    fetcher: F,
    query: Query,
    continuation_key: CompactString,
    limiter: &'l RateLimiter<S>,
    pages_fetched: usize,
    finished: bool,
    _items: PhantomData<fn() -> T>,
}

impl<'l, T, F, S> Pages<'l, T, F, S>
where
    F: PageFetcher<T>,
    S: Sleeper,
{
    pub fn new(
        initial_query: Query,
        fetcher: F,
        continuation_key: &str,
        limiter: &'l RateLimiter<S>,
    ) -> Self {
        Self {
            fetcher,
            query: initial_query,
            continuation_key: continuation_key.into(),
            limiter,
            pages_fetched: 0,
            finished: false,
            _items: PhantomData,
        }
    }

    /// Number of fetcher calls made so far, including a failed one.
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

impl<T, F, S> Iterator for Pages<'_, T, F, S>
where
    F: PageFetcher<T>,
    S: Sleeper,
{
    type Item = Result<Page<T>, CollectError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        self.limiter.before_request();
        let page_index = self.pages_fetched;
        self.pages_fetched += 1;

        match self.fetcher.fetch_page(&self.query) {
            Ok(page) => {
                tracing::debug!(
                    message = "Fetched page",
                    page_index,
                    items = page.items.len(),
                    continuation = ?page.continuation
                );
                match &page.continuation {
                    Some(token) => token.merge_into(&mut self.query, &self.continuation_key),
                    None => self.finished = true,
                }
                Some(Ok(page))
            }
            Err(source) => {
                self.finished = true;
                tracing::error!(
                    message = "Fetching page failed, aborting collection",
                    page_index,
                    error = %source
                );
                Some(Err(CollectError::Fetch { page_index, source }))
            }
        }
    }
}

impl<T, F, S> FusedIterator for Pages<'_, T, F, S>
where
    F: PageFetcher<T>,
    S: Sleeper,
{
}

/// Everything a paged collection handed out, in fetch order unless stated otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionResult<T> {
    pub items: Vec<T>,
    pub pages_fetched: usize,
}

impl<T> CollectionResult<T> {
    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// Drop later duplicates by `key`, then sort by `key` in natural order.
    pub fn unique_sorted_by<K>(self, key: K) -> Self
    where
        K: Fn(&T) -> &str,
    {
        let mut seen = FxHashSet::default();
        let mut items = Vec::with_capacity(self.items.len());
        for item in self.items {
            if seen.insert(CompactString::from(key(&item))) {
                items.push(item);
            }
        }
        items.sort_by(|a, b| natural_cmp(key(a), key(b)));

        Self {
            items,
            pages_fetched: self.pages_fetched,
        }
    }
}

impl<T> Deref for CollectionResult<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.items
    }
}

impl<T> IntoIterator for CollectionResult<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Walk the collection to completion. Either every page is fetched and merged or an error is
/// returned; there is no partial result.
pub fn collect<T, F, S>(
    initial_query: Query,
    fetcher: F,
    continuation_key: &str,
    limiter: &RateLimiter<S>,
) -> Result<CollectionResult<T>, CollectError>
where
    F: PageFetcher<T>,
    S: Sleeper,
{
    let mut pages = Pages::new(initial_query, fetcher, continuation_key, limiter);
    let mut items = Vec::new();
    for page in pages.by_ref() {
        items.extend(page?.items);
    }

    let pages_fetched = pages.pages_fetched();
    tracing::info!(
        message = "Collection complete",
        pages_fetched,
        items = items.len()
    );
    Ok(CollectionResult {
        items,
        pages_fetched,
    })
}

/// Like [`collect`], but an empty collection is an error.
pub fn collect_nonempty<T, F, S>(
    initial_query: Query,
    fetcher: F,
    continuation_key: &str,
    limiter: &RateLimiter<S>,
) -> Result<CollectionResult<T>, CollectError>
where
    F: PageFetcher<T>,
    S: Sleeper,
{
    let result = collect(initial_query, fetcher, continuation_key, limiter)?;
    if result.items.is_empty() {
        return Err(CollectError::Exhausted);
    }
    Ok(result)
}

/// For collections whose pages may overlap: de-duplicated by `key` and sorted naturally.
pub fn collect_unique_sorted<T, F, S, K>(
    initial_query: Query,
    fetcher: F,
    continuation_key: &str,
    limiter: &RateLimiter<S>,
    key: K,
) -> Result<CollectionResult<T>, CollectError>
where
    F: PageFetcher<T>,
    S: Sleeper,
    K: Fn(&T) -> &str,
{
    let result = collect(initial_query, fetcher, continuation_key, limiter)?;
    let fetched = result.items.len();
    let result = result.unique_sorted_by(key);
    if result.items.len() != fetched {
        tracing::debug!(
            message = "Dropped duplicate items",
            duplicates = fetched - result.items.len()
        );
    }
    Ok(result)
}

/// Category membership shifts under concurrent edits, so pages may overlap.
#[instrument(skip_all)]
pub fn collect_category_members<F, S>(
    initial_query: Query,
    fetcher: F,
    limiter: &RateLimiter<S>,
) -> Result<CollectionResult<CategoryMember>, CollectError>
where
    F: PageFetcher<CategoryMember>,
    S: Sleeper,
{
    collect_unique_sorted(
        initial_query,
        fetcher,
        CATEGORY_CONTINUE_KEY,
        limiter,
        |member: &CategoryMember| member.title.as_str(),
    )
}

/// Full edit history of one page, newest revision first.
///
/// Never empty: a page exists iff it has at least one revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionHistory {
    page: PageId,
    revisions: Vec<Revision>,
}

impl RevisionHistory {
    /// Assign positions to entries received newest-first and check the parent chain.
    ///
    /// A chain that does not line up is an error with the `strict` feature and a warning
    /// otherwise; deleted or imported revisions legitimately break it.
    pub fn from_newest_first(
        page: PageId,
        entries: Vec<RevisionEntry>,
    ) -> Result<Self, CollectError> {
        if entries.is_empty() {
            return Err(CollectError::Exhausted);
        }

        let len = entries.len();
        let older_ids: Vec<Option<u64>> = entries
            .iter()
            .skip(1)
            .map(|entry| Some(entry.revision_id))
            .chain(std::iter::once(None))
            .collect();

        let mut revisions = Vec::with_capacity(len);
        for (index, (entry, expected_parent)) in entries.into_iter().zip(older_ids).enumerate() {
            // the API reports the page creation as parent 0
            let parent_id = entry.parent_id.filter(|&parent| parent != 0);

            if parent_id != expected_parent {
                let reason = match expected_parent {
                    None => "oldest revision has a parent",
                    Some(_) => "parent is not the next older revision",
                };
                if cfg!(feature = "strict") {
                    tracing::error!(
                        message = "Inconsistent revision history",
                        page = %page,
                        revision_id = entry.revision_id,
                        parent_id = ?parent_id,
                        expected_parent = ?expected_parent
                    );
                    return Err(CollectError::InconsistentHistory {
                        page,
                        revision_id: entry.revision_id,
                        reason,
                    });
                } else {
                    tracing::warn!(
                        message = "Inconsistent revision history, continuing",
                        page = %page,
                        revision_id = entry.revision_id,
                        parent_id = ?parent_id,
                        expected_parent = ?expected_parent,
                        reason
                    );
                }
            }

            revisions.push(Revision {
                revision_id: entry.revision_id,
                parent_id,
                editor: entry.editor,
                position: len - 1 - index,
                timestamp: entry.timestamp,
            });
        }

        Ok(Self { page, revisions })
    }

    pub fn page(&self) -> &PageId {
        &self.page
    }

    pub fn newest_first(&self) -> &[Revision] {
        &self.revisions
    }

    pub fn len(&self) -> usize {
        self.revisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }

    pub fn newest(&self) -> &Revision {
        &self.revisions[0]
    }

    pub fn oldest(&self) -> &Revision {
        &self.revisions[self.revisions.len() - 1]
    }

    /// Editor of the revision that created the page.
    pub fn creator(&self) -> &EditorRef {
        &self.oldest().editor
    }

    pub fn at_position(&self, position: usize) -> Option<&Revision> {
        let index = self.revisions.len().checked_sub(position)?.checked_sub(1)?;
        self.revisions.get(index)
    }
}

/// Walks one page's history through `source`.
struct HistoryFetcher<'a, H: ?Sized> {
    source: &'a mut H,
    page: &'a PageId,
}

impl<H: RevisionHistorySource + ?Sized> PageFetcher<RevisionEntry> for HistoryFetcher<'_, H> {
    fn fetch_page(&mut self, query: &Query) -> Result<Page<RevisionEntry>, ApiError> {
        // the query only ever holds the merged continuation token
        let continuation = ContinuationToken::from_query(query, REVISION_CONTINUE_KEY);
        self.source
            .fetch_revision_history(self.page, continuation.as_ref())
    }
}

#[instrument(skip_all, fields(page = %page))]
pub fn collect_revision_history<H, S>(
    page: PageId,
    source: &mut H,
    limiter: &RateLimiter<S>,
) -> Result<RevisionHistory, CollectError>
where
    H: RevisionHistorySource + ?Sized,
    S: Sleeper,
{
    let fetcher = HistoryFetcher {
        source,
        page: &page,
    };
    let result = collect(Query::new(), fetcher, REVISION_CONTINUE_KEY, limiter)?;
    RevisionHistory::from_newest_first(page, result.into_items())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::prelude::*;

    fn titles(members: &[CategoryMember]) -> Vec<&str> {
        members.iter().map(|m| m.title.as_str()).collect()
    }

    #[test]
    fn test_single_page_without_continuation() {
        let limiter = recording_limiter();
        let mut fetcher = ScriptedPages::new(vec![Ok(Page::last(vec![1, 2, 3]))]);

        let result =
            collect(Query::new(), |q: &Query| fetcher.fetch_page(q), "cont", &limiter).unwrap();

        assert_eq!(result.items, vec![1, 2, 3]);
        assert_eq!(result.pages_fetched, 1);
        assert_eq!(fetcher.calls(), 1);
        assert!(limiter.sleeper().naps().is_empty());
    }

    #[test]
    fn test_continuation_token_is_merged_into_next_query() {
        let limiter = recording_limiter();
        let mut fetcher = ScriptedPages::new(vec![
            Ok(Page::with_continuation(
                vec!["a"],
                ContinuationToken::new("t1").with_companion("continue", "-||"),
            )),
            Ok(Page::with_continuation(
                vec!["b"],
                ContinuationToken::new("t2").with_companion("continue", "-||"),
            )),
            Ok(Page::last(vec!["c"])),
        ]);
        let initial = Query::new().with("list", "categorymembers");

        let result = collect(
            initial.clone(),
            |q: &Query| fetcher.fetch_page(q),
            "cmcontinue",
            &limiter,
        )
        .unwrap();

        assert_eq!(result.items, vec!["a", "b", "c"]);
        let queries = fetcher.queries();
        assert_eq!(queries[0], initial);
        assert_eq!(queries[1].get("cmcontinue"), Some("t1"));
        assert_eq!(queries[1].get("continue"), Some("-||"));
        assert_eq!(queries[1].get("list"), Some("categorymembers"));
        assert_eq!(queries[2].get("cmcontinue"), Some("t2"));
        // one pause between each pair of requests
        assert_eq!(limiter.sleeper().naps(), vec![Duration::from_secs(1); 2]);
    }

    #[test]
    fn test_failure_on_second_of_three_pages_discards_everything() {
        let limiter = recording_limiter();
        let mut fetcher = ScriptedPages::new(vec![
            Ok(Page::with_continuation(vec![1, 2], ContinuationToken::new("t1"))),
            Err(ApiError::transport(std::io::Error::other("connection reset"))),
            Ok(Page::last(vec![3])),
        ]);

        let error = collect(Query::new(), |q: &Query| fetcher.fetch_page(q), "cont", &limiter)
            .unwrap_err();

        match error {
            CollectError::Fetch { page_index, source } => {
                assert_eq!(page_index, 1);
                assert!(source.is_transport());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(fetcher.calls(), 2);
    }

    #[test]
    fn test_pages_iterator_is_fused_after_failure() {
        let limiter = recording_limiter();
        let mut fetcher = ScriptedPages::<u32>::new(vec![Err(ApiError::malformed("no `query`"))]);

        let mut pages =
            Pages::new(Query::new(), |q: &Query| fetcher.fetch_page(q), "cont", &limiter);
        assert!(matches!(pages.next(), Some(Err(CollectError::Fetch { page_index: 0, .. }))));
        assert!(pages.next().is_none());
        assert!(pages.next().is_none());
        assert_eq!(pages.pages_fetched(), 1);
    }

    #[test]
    fn test_pages_iterator_is_lazy() {
        let limiter = recording_limiter();
        let mut fetcher = ScriptedPages::new(vec![
            Ok(Page::with_continuation(vec![1], ContinuationToken::new("t1"))),
            Ok(Page::last(vec![2])),
        ]);

        {
            let mut pages =
                Pages::new(Query::new(), |q: &Query| fetcher.fetch_page(q), "cont", &limiter);
            assert_eq!(pages.next().unwrap().unwrap().items, vec![1]);
        }
        assert_eq!(fetcher.calls(), 1);
        // no pause is spent on a page nobody asked for
        assert!(limiter.sleeper().naps().is_empty());
    }

    #[test]
    fn test_consecutive_collections_keep_spacing() {
        let limiter = recording_limiter();
        let mut first = ScriptedPages::new(vec![Ok(Page::last(vec![1]))]);
        let mut second = ScriptedPages::new(vec![Ok(Page::last(vec![2]))]);

        collect(Query::new(), |q: &Query| first.fetch_page(q), "cont", &limiter).unwrap();
        assert!(limiter.sleeper().naps().is_empty());

        // the first page of the second walk still follows a request of the same run
        collect(Query::new(), |q: &Query| second.fetch_page(q), "cont", &limiter).unwrap();
        assert_eq!(limiter.sleeper().naps(), vec![Duration::from_secs(1)]);
    }

    #[test]
    fn test_collect_nonempty_reports_exhaustion() {
        let limiter = recording_limiter();
        let mut fetcher = ScriptedPages::<u32>::new(vec![
            Ok(Page::with_continuation(vec![], ContinuationToken::new("t1"))),
            Ok(Page::last(vec![])),
        ]);

        let error =
            collect_nonempty(Query::new(), |q: &Query| fetcher.fetch_page(q), "cont", &limiter)
                .unwrap_err();
        assert!(matches!(error, CollectError::Exhausted));
        assert_eq!(fetcher.calls(), 2);
    }

    #[test]
    fn test_category_members_are_deduplicated_and_sorted() {
        let limiter = recording_limiter();
        let mut fetcher = ScriptedPages::new(vec![
            Ok(Page::with_continuation(
                vec![member(3, "Page 10"), member(2, "Page 2")],
                ContinuationToken::new("page|2"),
            )),
            // membership shifted between the two requests
            Ok(Page::last(vec![member(2, "Page 2"), member(1, "page1")])),
        ]);

        let result =
            collect_category_members(Query::new(), |q: &Query| fetcher.fetch_page(q), &limiter)
                .unwrap();

        assert_eq!(titles(&result), vec!["page1", "Page 2", "Page 10"]);
        assert_eq!(result.pages_fetched, 2);
    }

    #[test]
    fn test_revision_history_positions() {
        let history = RevisionHistory::from_newest_first(
            "Foo".into(),
            vec![
                entry(12, Some(11), "Carol", 3),
                entry(11, Some(10), "Bob", 2),
                entry(10, Some(0), "Alice", 1),
            ],
        )
        .unwrap();

        let positions: Vec<_> = history.newest_first().iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![2, 1, 0]);
        assert_eq!(history.creator(), &editor("Alice", 1));
        assert_eq!(history.newest().revision_id, 12);
        assert_eq!(history.oldest().parent_id, None);
        assert_eq!(history.at_position(1).unwrap().revision_id, 11);
        assert_eq!(history.at_position(3), None);
        assert_eq!(history.at_position(usize::MAX), None);
    }

    #[test]
    fn test_empty_revision_history_is_exhausted() {
        let error = RevisionHistory::from_newest_first("Foo".into(), vec![]).unwrap_err();
        assert!(matches!(error, CollectError::Exhausted));
    }

    #[cfg(not(feature = "strict"))]
    #[test]
    fn test_broken_parent_chain_is_tolerated() {
        let history = RevisionHistory::from_newest_first(
            "Foo".into(),
            vec![entry(12, Some(9), "Bob", 2), entry(10, None, "Alice", 1)],
        )
        .unwrap();
        assert_eq!(history.len(), 2);
    }

    #[cfg(feature = "strict")]
    #[test]
    fn test_broken_parent_chain_is_rejected() {
        let error = RevisionHistory::from_newest_first(
            "Foo".into(),
            vec![entry(12, Some(9), "Bob", 2), entry(10, None, "Alice", 1)],
        )
        .unwrap_err();
        assert!(matches!(
            error,
            CollectError::InconsistentHistory { revision_id: 12, .. }
        ));
    }

    #[test]
    fn test_collect_revision_history_passes_continuation_back() {
        let limiter = recording_limiter();
        let mut source = ScriptedHistory::new(vec![
            Ok(Page::with_continuation(
                vec![entry(12, Some(11), "Carol", 3), entry(11, Some(10), "Bob", 2)],
                ContinuationToken::new("20240101000000|10").with_companion("continue", "||"),
            )),
            Ok(Page::last(vec![entry(10, None, "Alice", 1)])),
        ]);

        let history = collect_revision_history("Foo".into(), &mut source, &limiter).unwrap();

        assert_eq!(history.len(), 3);
        assert_eq!(history.page().as_str(), "Foo");
        assert_eq!(
            source.continuations(),
            vec![
                None,
                Some(ContinuationToken::new("20240101000000|10").with_companion("continue", "||"))
            ]
        );
    }

    proptest! {
        #[test]
        fn collect_concatenates_pages_in_fetch_order(
            pages in prop::collection::vec(prop::collection::vec(any::<u16>(), 0..5), 1..8)
        ) {
            let limiter = recording_limiter();
            let last = pages.len() - 1;
            let script = pages
                .iter()
                .enumerate()
                .map(|(i, items)| {
                    if i == last {
                        Ok(Page::last(items.clone()))
                    } else {
                        Ok(Page::with_continuation(
                            items.clone(),
                            ContinuationToken::new(format!("t{i}")),
                        ))
                    }
                })
                .collect();
            let mut fetcher = ScriptedPages::new(script);

            let result =
                collect(Query::new(), |q: &Query| fetcher.fetch_page(q), "cont", &limiter)
                    .unwrap();

            let expected: Vec<u16> = pages.concat();
            prop_assert_eq!(result.items, expected);
            prop_assert_eq!(result.pages_fetched, pages.len());
            prop_assert_eq!(fetcher.calls(), pages.len());
            prop_assert_eq!(limiter.sleeper().naps().len(), pages.len() - 1);
        }
    }
}
