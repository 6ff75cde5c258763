//! Scripted stand-ins for the remote service. Nothing in here touches the network or sleeps.

use std::{
    cell::RefCell,
    collections::{HashMap, VecDeque},
    time::Duration,
};

use chrono::{DateTime, Utc};
use rustc_hash::FxHashSet;

use crate::{
    api::{
        ApiError, CategoryMember, ContinuationToken, EditorRef, MarkerState, MarkerStateSource,
        Page, PageFetcher, PageId, Query, RevisionEntry, RevisionHistorySource,
    },
    collector::RevisionHistory,
    mediawiki::Transport,
    rate_limit::{RateLimiter, Sleeper},
};

pub mod prelude {
    pub(crate) use super::{
        editor, entry, history, marked_positions, member, recording_limiter, template_marker,
        RecordingSleeper, ScriptedHistory, ScriptedMarkers, ScriptedPages, ScriptedTransport,
    };
    pub(crate) use proptest::prelude::*;
}

/// Remembers every requested sleep instead of sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    naps: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn naps(&self) -> Vec<Duration> {
        self.naps.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.naps.borrow_mut().push(duration);
    }
}

/// One second between requests, recorded rather than slept.
pub fn recording_limiter() -> RateLimiter<RecordingSleeper> {
    RateLimiter::with_sleeper(Duration::from_secs(1), RecordingSleeper::default())
}

pub fn editor(username: &str, user_id: u64) -> EditorRef {
    EditorRef::new(username, user_id)
}

pub fn member(page_id: u64, title: &str) -> CategoryMember {
    CategoryMember {
        page_id,
        namespace: 0,
        title: title.into(),
    }
}

fn timestamp(revision_id: u64) -> DateTime<Utc> {
    // one revision per hour, starting 2024-01-01
    DateTime::from_timestamp(1_704_067_200 + revision_id as i64 * 3600, 0).unwrap()
}

pub fn entry(
    revision_id: u64,
    parent_id: Option<u64>,
    username: &str,
    user_id: u64,
) -> RevisionEntry {
    RevisionEntry {
        revision_id,
        parent_id,
        editor: editor(username, user_id),
        timestamp: timestamp(revision_id),
    }
}

/// History built from `(username, user_id)` pairs, oldest first.
///
/// The revision at position `p` has id `10 + p` and the previous revision as parent.
pub fn history(page: &str, editors_oldest_first: &[(&str, u64)]) -> RevisionHistory {
    let entries = editors_oldest_first
        .iter()
        .enumerate()
        .rev()
        .map(|(position, &(username, user_id))| {
            let revision_id = 10 + position as u64;
            let parent_id = (position > 0).then(|| revision_id - 1);
            entry(revision_id, parent_id, username, user_id)
        })
        .collect();

    RevisionHistory::from_newest_first(page.into(), entries).unwrap()
}

/// Marker oracle that reports the marker at the given positions of `history`.
pub fn marked_positions(
    history: &RevisionHistory,
    positions: &[usize],
) -> impl FnMut(u64) -> Result<bool, ApiError> {
    let marked: FxHashSet<u64> = positions
        .iter()
        .map(|&position| history.at_position(position).unwrap().revision_id)
        .collect();

    move |revision_id| Ok(marked.contains(&revision_id))
}

pub fn template_marker() -> MarkerState {
    MarkerState {
        has_template: true,
        has_category: false,
    }
}

/// Hands out pre-recorded pages in order and records the queries it was called with.
pub struct ScriptedPages<T> {
    script: VecDeque<Result<Page<T>, ApiError>>,
    queries: Vec<Query>,
}

impl<T> ScriptedPages<T> {
    pub fn new(script: Vec<Result<Page<T>, ApiError>>) -> Self {
        Self {
            script: script.into(),
            queries: Vec::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.queries.len()
    }

    pub fn queries(&self) -> &[Query] {
        &self.queries
    }
}

impl<T> PageFetcher<T> for ScriptedPages<T> {
    fn fetch_page(&mut self, query: &Query) -> Result<Page<T>, ApiError> {
        self.queries.push(query.clone());
        self.script
            .pop_front()
            .unwrap_or_else(|| panic!("fetcher called again after the final page"))
    }
}

type HistoryScript = VecDeque<Result<Page<RevisionEntry>, ApiError>>;

/// Revision history pages, either for any page or per title.
#[derive(Default)]
pub struct ScriptedHistory {
    any_page: HistoryScript,
    per_page: HashMap<PageId, HistoryScript>,
    requests: Vec<(PageId, Option<ContinuationToken>)>,
}

impl ScriptedHistory {
    pub fn new(script: Vec<Result<Page<RevisionEntry>, ApiError>>) -> Self {
        Self {
            any_page: script.into(),
            ..Self::default()
        }
    }

    pub fn with_page(
        mut self,
        page: &str,
        script: Vec<Result<Page<RevisionEntry>, ApiError>>,
    ) -> Self {
        self.per_page.insert(page.into(), script.into());
        self
    }

    pub fn continuations(&self) -> Vec<Option<ContinuationToken>> {
        self.requests
            .iter()
            .map(|(_, continuation)| continuation.clone())
            .collect()
    }

    pub fn requested_pages(&self) -> Vec<PageId> {
        self.requests.iter().map(|(page, _)| page.clone()).collect()
    }
}

impl RevisionHistorySource for ScriptedHistory {
    fn fetch_revision_history(
        &mut self,
        page: &PageId,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page<RevisionEntry>, ApiError> {
        self.requests.push((page.clone(), continuation.cloned()));
        let script = match self.per_page.get_mut(page) {
            Some(script) => script,
            None => &mut self.any_page,
        };
        script
            .pop_front()
            .unwrap_or_else(|| panic!("no more history pages scripted for {page}"))
    }
}

/// Marker states per revision id; unlisted revisions are unmarked.
#[derive(Default)]
pub struct ScriptedMarkers {
    states: HashMap<u64, MarkerState>,
    failing: FxHashSet<u64>,
    lookups: Vec<u64>,
}

impl ScriptedMarkers {
    pub fn new(states: impl IntoIterator<Item = (u64, MarkerState)>) -> Self {
        Self {
            states: states.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Lookups of `revision_id` fail with a transport error.
    pub fn failing(mut self, revision_id: u64) -> Self {
        self.failing.insert(revision_id);
        self
    }

    pub fn lookups(&self) -> Vec<u64> {
        self.lookups.clone()
    }
}

impl MarkerStateSource for ScriptedMarkers {
    fn fetch_rendered_marker_state(&mut self, revision_id: u64) -> Result<MarkerState, ApiError> {
        self.lookups.push(revision_id);
        if self.failing.contains(&revision_id) {
            return Err(ApiError::transport(std::io::Error::other("timed out")));
        }
        Ok(self.states.get(&revision_id).copied().unwrap_or_default())
    }
}

/// Canned JSON responses in request order.
pub struct ScriptedTransport {
    responses: RefCell<VecDeque<Result<serde_json::Value, ApiError>>>,
    requests: RefCell<Vec<Query>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<serde_json::Value, ApiError>>) -> Self {
        Self {
            responses: RefCell::new(responses.into()),
            requests: RefCell::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<Query> {
        self.requests.borrow().clone()
    }
}

impl Transport for ScriptedTransport {
    fn execute(&self, query: &Query) -> Result<serde_json::Value, ApiError> {
        self.requests.borrow_mut().push(query.clone());
        self.responses
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| panic!("unexpected request: {query:?}"))
    }
}
