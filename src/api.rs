use std::{
    collections::BTreeMap,
    fmt::{Debug, Display},
    time::Duration,
};

use compact_str::CompactString;

/// Name of a remote document, e.g. `Foo` or `Category:Candidates for deletion`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(CompactString);

impl PageId {
    pub fn new(title: impl Into<CompactString>) -> Self {
        Self(title.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PageId {
    fn from(title: &str) -> Self {
        Self::new(title)
    }
}

impl From<CompactString> for PageId {
    fn from(title: CompactString) -> Self {
        Self(title)
    }
}

/// The account (or IP address) that saved a revision.
///
/// Equality compares both fields. Usernames alone are not a reliable identity key
/// because accounts can be renamed; see [`crate::provenance::IdentityPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EditorRef {
    pub username: CompactString,
    /// `0` for logged-out (IP) editors
    pub user_id: u64,
}

impl EditorRef {
    pub fn new(username: impl Into<CompactString>, user_id: u64) -> Self {
        Self {
            username: username.into(),
            user_id,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id == 0
    }
}

impl Display for EditorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_anonymous() {
            write!(f, "{} (anonymous)", self.username)
        } else {
            write!(f, "{} (#{})", self.username, self.user_id)
        }
    }
}

/// A revision as reported by the history endpoint. Its rank in the page history is
/// only known once the whole history has been collected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RevisionEntry {
    pub revision_id: u64,
    pub parent_id: Option<u64>,
    pub editor: EditorRef,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub revision_id: u64,
    /// `None` for the revision that created the page
    pub parent_id: Option<u64>,
    pub editor: EditorRef,
    /// rank in the page history, 0 = oldest
    pub position: usize,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// A member of a category listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CategoryMember {
    pub page_id: u64,
    pub namespace: i32,
    pub title: CompactString,
}

/// Parameters of one API request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query(BTreeMap<CompactString, String>);

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<CompactString>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<CompactString>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<CompactString>, V: Into<String>> FromIterator<(K, V)> for Query {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut query = Query::new();
        for (key, value) in iter {
            query.set(key, value);
        }
        query
    }
}

/// Opaque cursor handed out by a paged endpoint when more results remain.
///
/// The main value is sent back under the query's continuation key. MediaWiki also
/// hands out companion parameters (the bare `continue` field) that must be echoed
/// verbatim, so those travel with the token.
#[derive(Clone, PartialEq, Eq)]
pub struct ContinuationToken {
    value: String,
    companions: Vec<(CompactString, String)>,
}

impl ContinuationToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            companions: Vec::new(),
        }
    }

    pub fn with_companion(
        mut self,
        key: impl Into<CompactString>,
        value: impl Into<String>,
    ) -> Self {
        self.companions.push((key.into(), value.into()));
        self
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn companions(&self) -> impl Iterator<Item = (&str, &str)> {
        self.companions.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Write this token into `query`, replacing whatever an earlier token put there.
    pub fn merge_into(&self, query: &mut Query, continuation_key: &str) {
        query.set(continuation_key, self.value.as_str());
        for (key, value) in &self.companions {
            query.set(key.clone(), value.as_str());
        }
    }

    /// Rebuild the token that [`ContinuationToken::merge_into`] wrote into `query`.
    ///
    /// Only meaningful for queries that carry nothing but continuation parameters.
    pub fn from_query(query: &Query, continuation_key: &str) -> Option<Self> {
        let value = query.get(continuation_key)?;
        let mut token = ContinuationToken::new(value);
        for (key, value) in query.iter().filter(|(key, _)| *key != continuation_key) {
            token = token.with_companion(key, value);
        }
        Some(token)
    }
}

impl Debug for ContinuationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.companions.is_empty() {
            f.debug_tuple("ContinuationToken")
                .field(&self.value)
                .finish()
        } else {
            f.debug_tuple("ContinuationToken")
                .field(&self.value)
                .field(&self.companions)
                .finish()
        }
    }
}

/// One response of a paged endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` once the server has nothing more to hand out
    pub continuation: Option<ContinuationToken>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            continuation: None,
        }
    }

    pub fn with_continuation(items: Vec<T>, continuation: ContinuationToken) -> Self {
        Self {
            items,
            continuation: Some(continuation),
        }
    }
}

/// What the rendered content of one revision says about the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MarkerState {
    pub has_template: bool,
    pub has_category: bool,
}

/// Request quota the remote service enforces.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    pub requests_per_window: u32,
    pub window_seconds: f64,
}

impl Quota {
    /// Minimum spacing between two requests, `None` if the quota is degenerate.
    pub fn interval(&self) -> Option<Duration> {
        if self.requests_per_window == 0
            || !self.window_seconds.is_finite()
            || self.window_seconds <= 0.0
        {
            return None;
        }

        Duration::try_from_secs_f64(self.window_seconds / f64::from(self.requests_per_window)).ok()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response (connection, TLS, timeout, ...).
    #[error("transport failure")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
    /// The server answered with an error object instead of a result.
    #[error("remote API error `{code}`: {info}")]
    Remote { code: CompactString, info: String },
    #[error("malformed response: {context}")]
    Malformed {
        context: String,
        #[source]
        source: Option<serde_json::Error>,
    },
}

impl ApiError {
    pub fn transport(error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        ApiError::Transport(error.into())
    }

    pub fn malformed(context: impl Into<String>) -> Self {
        ApiError::Malformed {
            context: context.into(),
            source: None,
        }
    }

    /// Failures at the network or protocol layer.
    pub fn is_transport(&self) -> bool {
        matches!(self, ApiError::Transport(_) | ApiError::Remote { .. })
    }

    /// The response arrived but lacked an expected field or shape.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ApiError::Malformed { .. })
    }
}

/// One request to a paged collection endpoint.
pub trait PageFetcher<T> {
    fn fetch_page(&mut self, query: &Query) -> Result<Page<T>, ApiError>;
}

impl<T, F> PageFetcher<T> for F
where
    F: FnMut(&Query) -> Result<Page<T>, ApiError>,
{
    fn fetch_page(&mut self, query: &Query) -> Result<Page<T>, ApiError> {
        self(query)
    }
}

/// One request for a slice of a page's history, newest revisions first.
pub trait RevisionHistorySource {
    fn fetch_revision_history(
        &mut self,
        page: &PageId,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page<RevisionEntry>, ApiError>;
}

/// Evaluates the rendered content of one revision. The answer never changes for a
/// given revision id.
pub trait MarkerStateSource {
    fn fetch_rendered_marker_state(&mut self, revision_id: u64) -> Result<MarkerState, ApiError>;
}

pub trait QuotaSource {
    fn rate_limit_quota(&mut self) -> Result<Quota, ApiError>;
}
