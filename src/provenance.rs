use tracing::instrument;

use crate::{
    api::{ApiError, EditorRef, MarkerStateSource, Revision},
    collector::RevisionHistory,
    marker::{MarkerCache, MarkerKind},
    rate_limit::{RateLimiter, Sleeper, ThreadSleeper},
};

#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("revision history is empty")]
    EmptyHistory,
    #[error("looking up the marker state of revision {revision_id} failed")]
    MarkerLookup {
        revision_id: u64,
        #[source]
        source: ApiError,
    },
    #[error("marker was added by {tagger}, but the page was created by {creator}")]
    Unauthorized {
        tagger: EditorRef,
        creator: EditorRef,
    },
}

/// Find the revision that put the page into its current marked state.
///
/// Walks from the newest revision towards the oldest while the marker is present and returns
/// the oldest revision of that span. Only the newest contiguous span counts: a marker that was
/// removed and added again is attributed to whoever added it again. Returns `None` if the newest
/// revision is not marked.
///
/// `marker_present` is asked at most once per revision, newest first, and not at all for
/// revisions older than the first unmarked one.
pub fn find_introducing_revision<M>(
    revisions_newest_first: &[Revision],
    mut marker_present: M,
) -> Result<Option<&Revision>, VerifyError>
where
    M: FnMut(u64) -> Result<bool, ApiError>,
{
    if revisions_newest_first.is_empty() {
        return Err(VerifyError::EmptyHistory);
    }

    let mut introducing = None;
    for revision in revisions_newest_first {
        let present =
            marker_present(revision.revision_id).map_err(|source| VerifyError::MarkerLookup {
                revision_id: revision.revision_id,
                source,
            })?;
        tracing::debug!(
            message = "Evaluated marker",
            revision_id = revision.revision_id,
            position = revision.position,
            present
        );

        if !present {
            break;
        }
        introducing = Some(revision);
    }

    Ok(introducing)
}

/// Editor whose revision introduced the marker, see [`find_introducing_revision`].
pub fn find_introducer<M>(
    revisions_newest_first: &[Revision],
    marker_present: M,
) -> Result<Option<EditorRef>, VerifyError>
where
    M: FnMut(u64) -> Result<bool, ApiError>,
{
    find_introducing_revision(revisions_newest_first, marker_present)
        .map(|revision| revision.map(|revision| revision.editor.clone()))
}

/// How two [`EditorRef`]s are matched when deciding authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IdentityPolicy {
    /// username and user id must both match
    #[default]
    Exact,
    /// registered accounts match by user id alone, so a rename in between does not count as a
    /// different editor; logged-out editors (id 0) match by name
    UserId,
}

impl IdentityPolicy {
    pub fn same_editor(self, a: &EditorRef, b: &EditorRef) -> bool {
        match self {
            IdentityPolicy::Exact => a == b,
            IdentityPolicy::UserId => {
                if a.is_anonymous() || b.is_anonymous() {
                    a == b
                } else {
                    a.user_id == b.user_id
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The newest revision does not carry the marker, nothing to act on.
    NotMarked,
    /// The page creator added the marker.
    Authorized {
        creator: EditorRef,
        introduced_in: u64,
    },
    /// Someone other than the creator added the marker. Must be confirmed by a human before
    /// anything destructive happens.
    Unauthorized {
        tagger: EditorRef,
        creator: EditorRef,
        introduced_in: u64,
    },
}

impl Verdict {
    pub fn decide(
        history: &RevisionHistory,
        introducing: Option<&Revision>,
        identity: IdentityPolicy,
    ) -> Self {
        let Some(introducing) = introducing else {
            return Verdict::NotMarked;
        };

        let creator = history.creator();
        if identity.same_editor(&introducing.editor, creator) {
            Verdict::Authorized {
                creator: creator.clone(),
                introduced_in: introducing.revision_id,
            }
        } else {
            Verdict::Unauthorized {
                tagger: introducing.editor.clone(),
                creator: creator.clone(),
                introduced_in: introducing.revision_id,
            }
        }
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self, Verdict::Authorized { .. })
    }

    pub fn requires_confirmation(&self) -> bool {
        matches!(self, Verdict::Unauthorized { .. })
    }

    /// Turn an unauthorized verdict into an error, for callers that never prompt.
    pub fn ensure_authorized(self) -> Result<Self, VerifyError> {
        match self {
            Verdict::Unauthorized {
                tagger, creator, ..
            } => Err(VerifyError::Unauthorized { tagger, creator }),
            verdict => Ok(verdict),
        }
    }
}

/// Checks whether the editor who marked a page is the one who created it.
pub struct ProvenanceVerifier<'l, S = ThreadSleeper> {
    limiter: &'l RateLimiter<S>,
    kind: MarkerKind,
    identity: IdentityPolicy,
}

impl<'l, S: Sleeper> ProvenanceVerifier<'l, S> {
    pub fn new(limiter: &'l RateLimiter<S>, kind: MarkerKind) -> Self {
        Self {
            limiter,
            kind,
            identity: IdentityPolicy::default(),
        }
    }

    pub fn with_identity_policy(mut self, identity: IdentityPolicy) -> Self {
        self.identity = identity;
        self
    }

    /// Read-only over `history`; every remote lookup goes through
    /// [`RateLimiter::before_request`].
    #[instrument(skip_all, fields(page = %history.page(), revisions = history.len()))]
    pub fn verify<M>(
        &self,
        history: &RevisionHistory,
        source: &mut M,
    ) -> Result<Verdict, VerifyError>
    where
        M: MarkerStateSource + ?Sized,
    {
        let mut cache = MarkerCache::default();
        let mut lookups = 0usize;

        let introducing = find_introducing_revision(history.newest_first(), |revision_id| {
            cache.get_or_try_insert(revision_id, |revision_id| {
                self.limiter.before_request();
                lookups += 1;
                source
                    .fetch_rendered_marker_state(revision_id)
                    .map(|state| self.kind.is_present(state))
            })
        })?;

        let verdict = Verdict::decide(history, introducing, self.identity);
        match &verdict {
            Verdict::NotMarked => tracing::info!(
                message = "Page is not marked",
                newest_revision = history.newest().revision_id,
                lookups
            ),
            Verdict::Authorized {
                creator,
                introduced_in,
            } => tracing::info!(
                message = "Marker added by the page creator",
                creator = %creator,
                introduced_in,
                lookups
            ),
            Verdict::Unauthorized {
                tagger,
                creator,
                introduced_in,
            } => tracing::warn!(
                message = "Marker added by someone other than the page creator",
                tagger = %tagger,
                creator = %creator,
                introduced_in,
                lookups
            ),
        }
        Ok(verdict)
    }
}
