//! One pass over a deletion category: who tagged each member, and was it the page creator?
//!
//! The review only reads. Acting on the report (deleting authorized pages, asking a human about
//! the rest) is up to the caller.

use tracing::instrument;

use crate::{
    api::{CategoryMember, MarkerStateSource, PageFetcher, PageId, Query, RevisionHistorySource},
    collector::{collect_category_members, collect_revision_history, CollectError},
    marker::MarkerKind,
    provenance::{IdentityPolicy, ProvenanceVerifier, Verdict, VerifyError},
    rate_limit::{RateLimiter, Sleeper, ThreadSleeper},
};

#[derive(Debug, thiserror::Error)]
pub enum ReviewError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

#[derive(Debug)]
pub struct ReviewEntry {
    pub member: CategoryMember,
    pub outcome: Result<Verdict, ReviewError>,
}

impl ReviewEntry {
    pub fn verdict(&self) -> Option<&Verdict> {
        self.outcome.as_ref().ok()
    }
}

/// Per-member outcomes in natural title order.
#[derive(Debug, Default)]
pub struct ReviewReport {
    pub entries: Vec<ReviewEntry>,
    /// requests spent on listing the category
    pub listing_pages: usize,
}

impl ReviewReport {
    fn with_verdict(&self, pred: fn(&Verdict) -> bool) -> impl Iterator<Item = &ReviewEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.verdict().is_some_and(pred))
    }

    /// Marked by their creator.
    pub fn authorized(&self) -> impl Iterator<Item = &ReviewEntry> {
        self.with_verdict(Verdict::is_authorized)
    }

    /// Marked by someone else; a human has to confirm before anything is deleted.
    pub fn needing_confirmation(&self) -> impl Iterator<Item = &ReviewEntry> {
        self.with_verdict(Verdict::requires_confirmation)
    }

    /// Members whose newest revision no longer carries the marker.
    pub fn not_marked(&self) -> impl Iterator<Item = &ReviewEntry> {
        self.with_verdict(|verdict| *verdict == Verdict::NotMarked)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&CategoryMember, &ReviewError)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            Ok(_) => None,
            Err(error) => Some((&entry.member, error)),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct DeletionReview<'l, S = ThreadSleeper> {
    limiter: &'l RateLimiter<S>,
    kind: MarkerKind,
    identity: IdentityPolicy,
}

impl<'l, S: Sleeper> DeletionReview<'l, S> {
    /// `limiter` spaces every request of the run, usually derived once through
    /// [`RateLimiter::from_quota_source`] so that the quota query is spaced too.
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

    /// List the category and review every member.
    ///
    /// Only a failure to list the category fails the run; per-member failures end up in the
    /// report.
    #[instrument(skip_all)]
    pub fn run<F, H, M>(
        &self,
        members_query: Query,
        members: F,
        histories: &mut H,
        markers: &mut M,
    ) -> Result<ReviewReport, CollectError>
    where
        F: PageFetcher<CategoryMember>,
        H: RevisionHistorySource + ?Sized,
        M: MarkerStateSource + ?Sized,
    {
        let listing = collect_category_members(members_query, members, self.limiter)?;
        let listing_pages = listing.pages_fetched;
        tracing::info!(message = "Reviewing category members", members = listing.len());

        let mut entries = Vec::with_capacity(listing.len());
        for member in listing {
            let outcome = self.review_page(&member, histories, markers);
            if let Err(error) = &outcome {
                tracing::error!(
                    message = "Reviewing page failed, skipping",
                    title = %member.title,
                    error = %error
                );
            }
            entries.push(ReviewEntry { member, outcome });
        }

        let report = ReviewReport {
            entries,
            listing_pages,
        };
        tracing::info!(
            message = "Review complete",
            authorized = report.authorized().count(),
            needing_confirmation = report.needing_confirmation().count(),
            not_marked = report.not_marked().count(),
            failed = report.failures().count()
        );
        Ok(report)
    }

    /// Collect the history of one member and verify who marked it.
    #[instrument(skip_all, fields(title = %member.title))]
    pub fn review_page<H, M>(
        &self,
        member: &CategoryMember,
        histories: &mut H,
        markers: &mut M,
    ) -> Result<Verdict, ReviewError>
    where
        H: RevisionHistorySource + ?Sized,
        M: MarkerStateSource + ?Sized,
    {
        let history =
            collect_revision_history(PageId::new(member.title.clone()), histories, self.limiter)?;
        let verdict = ProvenanceVerifier::new(self.limiter, self.kind)
            .with_identity_policy(self.identity)
            .verify(&history, markers)?;
        Ok(verdict)
    }
}
