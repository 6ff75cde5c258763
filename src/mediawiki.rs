//! Decoding of MediaWiki Action API responses (`format=json&formatversion=2`).
//!
//! The HTTP side is left to a [`Transport`]: it sends one request and hands back the decoded
//! JSON body. Each endpoint below implements exactly one of the capability traits in
//! [`crate::api`] on top of it.

use std::collections::BTreeMap;

use compact_str::CompactString;
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    api::{
        ApiError, CategoryMember, ContinuationToken, EditorRef, MarkerState, MarkerStateSource,
        Page, PageFetcher, PageId, Query, Quota, QuotaSource, RevisionEntry,
        RevisionHistorySource,
    },
    collector::{CATEGORY_CONTINUE_KEY, REVISION_CONTINUE_KEY},
    marker::DeletionMarker,
    utils::normalize_title,
};

/// Sends one request to `api.php`.
///
/// Network and HTTP-level failures are reported as [`ApiError::Transport`]. Session handling,
/// retries and timeouts are the transport's business.
pub trait Transport {
    fn execute(&self, query: &Query) -> Result<serde_json::Value, ApiError>;
}

/// The rate limit that governs how fast a bot may work through its queue.
pub const RATE_LIMIT_ACTION: &str = "edit";

fn base_query() -> Query {
    Query::new().with("format", "json").with("formatversion", "2")
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    code: CompactString,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<RemoteError>,
}

fn call<R: DeserializeOwned>(
    transport: &(impl Transport + ?Sized),
    query: &Query,
    context: &str,
) -> Result<R, ApiError> {
    let value = transport.execute(query)?;

    if let Ok(ErrorEnvelope {
        error: Some(RemoteError { code, info }),
    }) = ErrorEnvelope::deserialize(&value)
    {
        return Err(ApiError::Remote { code, info });
    }

    R::deserialize(value).map_err(|source| ApiError::Malformed {
        context: format!("unexpected {context} response"),
        source: Some(source),
    })
}

#[derive(Debug, Deserialize)]
struct QueryEnvelope<Q> {
    #[serde(rename = "continue")]
    continuation: Option<BTreeMap<CompactString, String>>,
    query: Option<Q>,
}

impl<Q> QueryEnvelope<Q> {
    fn into_parts(
        self,
        continuation_key: &str,
    ) -> Result<(Q, Option<ContinuationToken>), ApiError> {
        let query = self
            .query
            .ok_or_else(|| ApiError::malformed("response lacks `query`"))?;

        let continuation = match self.continuation {
            None => None,
            Some(mut fields) => {
                let value = fields.remove(continuation_key).ok_or_else(|| {
                    ApiError::malformed(format!("`continue` block lacks `{continuation_key}`"))
                })?;
                let token = fields
                    .into_iter()
                    .fold(ContinuationToken::new(value), |token, (key, value)| {
                        token.with_companion(key, value)
                    });
                Some(token)
            }
        };

        Ok((query, continuation))
    }
}

/// `list=categorymembers`
#[derive(Debug, Clone)]
pub struct CategoryQuery {
    /// full title including the namespace, e.g. `Category:Candidates for deletion`
    pub category: PageId,
    pub namespace: Option<i32>,
    /// `None` asks for as many as the server allows per request
    pub limit: Option<u32>,
    pub descending: bool,
}

impl CategoryQuery {
    pub fn new(category: impl Into<PageId>) -> Self {
        Self {
            category: category.into(),
            namespace: None,
            limit: None,
            descending: true,
        }
    }

    pub fn to_query(&self) -> Query {
        let mut query = base_query()
            .with("action", "query")
            .with("list", "categorymembers")
            .with("cmtitle", normalize_title(self.category.as_str()))
            .with("cmprop", "ids|title")
            .with(
                "cmlimit",
                self.limit
                    .map_or_else(|| "max".to_string(), |limit| limit.to_string()),
            )
            .with("cmdir", if self.descending { "desc" } else { "asc" });
        if let Some(namespace) = self.namespace {
            query.set("cmnamespace", namespace.to_string());
        }
        query
    }
}

#[derive(Debug, Deserialize)]
struct CategoryMembersQuery {
    categorymembers: Vec<RawCategoryMember>,
}

#[derive(Debug, Deserialize)]
struct RawCategoryMember {
    pageid: u64,
    ns: i32,
    title: CompactString,
}

pub struct CategoryMembersEndpoint<'t, T: ?Sized> {
    transport: &'t T,
}

impl<'t, T: Transport + ?Sized> CategoryMembersEndpoint<'t, T> {
    pub fn new(transport: &'t T) -> Self {
        Self { transport }
    }
}

impl<T: Transport + ?Sized> PageFetcher<CategoryMember> for CategoryMembersEndpoint<'_, T> {
    fn fetch_page(&mut self, query: &Query) -> Result<Page<CategoryMember>, ApiError> {
        let envelope: QueryEnvelope<CategoryMembersQuery> =
            call(self.transport, query, "categorymembers")?;
        let (members, continuation) = envelope.into_parts(CATEGORY_CONTINUE_KEY)?;

        let items = members
            .categorymembers
            .into_iter()
            .map(|member| CategoryMember {
                page_id: member.pageid,
                namespace: member.ns,
                title: member.title,
            })
            .collect();
        Ok(Page {
            items,
            continuation,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PagesQuery<R> {
    #[serde(default = "Vec::new")]
    pages: Vec<RawPage<R>>,
}

#[derive(Debug, Deserialize)]
struct RawPage<R> {
    title: Option<CompactString>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default = "Vec::new")]
    revisions: Vec<R>,
}

#[derive(Debug, Deserialize)]
struct RawRevision {
    revid: u64,
    #[serde(default)]
    parentid: u64,
    user: Option<CompactString>,
    userid: Option<u64>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl RawRevision {
    fn into_entry(self) -> Result<RevisionEntry, ApiError> {
        // hidden (revision-deleted) usernames come without `user`/`userid`
        let username = self.user.ok_or_else(|| {
            ApiError::malformed(format!("revision {} lacks `user`", self.revid))
        })?;
        let user_id = self.userid.ok_or_else(|| {
            ApiError::malformed(format!("revision {} lacks `userid`", self.revid))
        })?;

        Ok(RevisionEntry {
            revision_id: self.revid,
            parent_id: Some(self.parentid).filter(|&parent| parent != 0),
            editor: EditorRef::new(username, user_id),
            timestamp: self.timestamp,
        })
    }
}

/// `prop=revisions` over one title, newest first.
pub struct RevisionsEndpoint<'t, T: ?Sized> {
    transport: &'t T,
}

impl<'t, T: Transport + ?Sized> RevisionsEndpoint<'t, T> {
    pub fn new(transport: &'t T) -> Self {
        Self { transport }
    }

    fn history_query(page: &PageId) -> Query {
        base_query()
            .with("action", "query")
            .with("prop", "revisions")
            .with("titles", normalize_title(page.as_str()))
            .with("rvprop", "ids|user|userid|timestamp")
            .with("rvlimit", "max")
            .with("rvdir", "older")
    }
}

impl<T: Transport + ?Sized> RevisionHistorySource for RevisionsEndpoint<'_, T> {
    fn fetch_revision_history(
        &mut self,
        page: &PageId,
        continuation: Option<&ContinuationToken>,
    ) -> Result<Page<RevisionEntry>, ApiError> {
        let mut query = Self::history_query(page);
        if let Some(token) = continuation {
            token.merge_into(&mut query, REVISION_CONTINUE_KEY);
        }

        let envelope: QueryEnvelope<PagesQuery<RawRevision>> =
            call(self.transport, &query, "revisions")?;
        let (pages, continuation) = envelope.into_parts(REVISION_CONTINUE_KEY)?;

        let raw_page = pages
            .pages
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::malformed("revisions response lists no page"))?;
        if raw_page.missing || raw_page.invalid {
            tracing::warn!(
                message = "Page does not exist",
                page = %page,
                reported_title = ?raw_page.title
            );
            return Ok(Page::last(Vec::new()));
        }

        let items = raw_page
            .revisions
            .into_iter()
            .map(RawRevision::into_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Page {
            items,
            continuation,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ParseEnvelope {
    parse: ParsedRevision,
}

#[derive(Debug, Deserialize)]
struct ParsedRevision {
    #[serde(default = "Vec::new")]
    templates: Vec<ParsedTemplate>,
    #[serde(default = "Vec::new")]
    categories: Vec<ParsedCategory>,
}

#[derive(Debug, Deserialize)]
struct ParsedTemplate {
    ns: i32,
    title: CompactString,
}

#[derive(Debug, Deserialize)]
struct ParsedCategory {
    category: CompactString,
}

/// Evaluates the marker on the rendered revision (`action=parse&oldid=`). Sees templates and
/// categories pulled in through other templates.
pub struct ParseEndpoint<'t, T: ?Sized> {
    transport: &'t T,
    marker: &'t DeletionMarker,
}

impl<'t, T: Transport + ?Sized> ParseEndpoint<'t, T> {
    pub fn new(transport: &'t T, marker: &'t DeletionMarker) -> Self {
        Self { transport, marker }
    }
}

impl<T: Transport + ?Sized> MarkerStateSource for ParseEndpoint<'_, T> {
    fn fetch_rendered_marker_state(&mut self, revision_id: u64) -> Result<MarkerState, ApiError> {
        let query = base_query()
            .with("action", "parse")
            .with("oldid", revision_id.to_string())
            .with("prop", "templates|categories");

        let envelope: ParseEnvelope = call(self.transport, &query, "parse")?;
        Ok(self.marker.evaluate_parsed(
            envelope
                .parse
                .templates
                .iter()
                .map(|t| (t.ns, t.title.as_str())),
            envelope
                .parse
                .categories
                .iter()
                .map(|c| c.category.as_str()),
        ))
    }
}

#[derive(Debug, Deserialize)]
struct RawContentRevision {
    slots: Option<RawSlots>,
}

#[derive(Debug, Deserialize)]
struct RawSlots {
    main: RawSlot,
}

#[derive(Debug, Deserialize)]
struct RawSlot {
    content: Option<String>,
}

/// Evaluates the marker on the stored wikitext (`prop=revisions&rvprop=content`). Cheaper than
/// parsing, but blind to markers added through other templates.
pub struct RevisionContentEndpoint<'t, T: ?Sized> {
    transport: &'t T,
    marker: &'t DeletionMarker,
}

impl<'t, T: Transport + ?Sized> RevisionContentEndpoint<'t, T> {
    pub fn new(transport: &'t T, marker: &'t DeletionMarker) -> Self {
        Self { transport, marker }
    }
}

impl<T: Transport + ?Sized> MarkerStateSource for RevisionContentEndpoint<'_, T> {
    fn fetch_rendered_marker_state(&mut self, revision_id: u64) -> Result<MarkerState, ApiError> {
        let query = base_query()
            .with("action", "query")
            .with("prop", "revisions")
            .with("revids", revision_id.to_string())
            .with("rvprop", "content")
            .with("rvslots", "main");

        let envelope: QueryEnvelope<PagesQuery<RawContentRevision>> =
            call(self.transport, &query, "revision content")?;
        let pages = envelope
            .query
            .ok_or_else(|| ApiError::malformed("response lacks `query`"))?;

        let content = pages
            .pages
            .into_iter()
            .flat_map(|page| page.revisions)
            .next()
            .and_then(|revision| revision.slots)
            .and_then(|slots| slots.main.content)
            .ok_or_else(|| {
                ApiError::malformed(format!("no content for revision {revision_id}"))
            })?;

        Ok(self.marker.evaluate_wikitext(&content))
    }
}

#[derive(Debug, Deserialize)]
struct UserInfoQuery {
    userinfo: UserInfo,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    // an empty array when the user is exempt from all limits
    #[serde(default)]
    ratelimits: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawLimit {
    hits: u32,
    seconds: f64,
}

/// Reads the quota of the logged-in user (`meta=userinfo&uiprop=ratelimits`).
pub struct UserInfoEndpoint<'t, T: ?Sized> {
    transport: &'t T,
}

impl<'t, T: Transport + ?Sized> UserInfoEndpoint<'t, T> {
    pub fn new(transport: &'t T) -> Self {
        Self { transport }
    }
}

impl<T: Transport + ?Sized> QuotaSource for UserInfoEndpoint<'_, T> {
    fn rate_limit_quota(&mut self) -> Result<Quota, ApiError> {
        let query = base_query()
            .with("action", "query")
            .with("meta", "userinfo")
            .with("uiprop", "ratelimits");

        let envelope: QueryEnvelope<UserInfoQuery> = call(self.transport, &query, "userinfo")?;
        let userinfo = envelope
            .query
            .ok_or_else(|| ApiError::malformed("response lacks `query`"))?
            .userinfo;

        let limits: BTreeMap<CompactString, RawLimit> = match userinfo
            .ratelimits
            .get(RATE_LIMIT_ACTION)
        {
            Some(limits) => BTreeMap::deserialize(limits).map_err(|source| {
                ApiError::Malformed {
                    context: format!("unexpected `{RATE_LIMIT_ACTION}` rate limits"),
                    source: Some(source),
                }
            })?,
            None => BTreeMap::new(),
        };

        // several user groups may apply; the slowest one is the one that bites
        limits
            .into_values()
            .filter(|limit| limit.hits > 0 && limit.seconds > 0.0)
            .map(|limit| Quota {
                requests_per_window: limit.hits,
                window_seconds: limit.seconds,
            })
            .min_by(|a, b| {
                let rate_a = f64::from(a.requests_per_window) / a.window_seconds;
                let rate_b = f64::from(b.requests_per_window) / b.window_seconds;
                rate_a.total_cmp(&rate_b)
            })
            .ok_or_else(|| {
                ApiError::malformed(format!("no `{RATE_LIMIT_ACTION}` rate limit reported"))
            })
    }
}
