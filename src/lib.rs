// SPDX-License-Identifier: MPL-2.0
//! # wikiwarden
//!
//! Building blocks for MediaWiki maintenance bots: paginated collection of API results under a
//! rate limit, and verification of *who* put a marker (such as a deletion template) on a page.
//!
//! ## Overview
//!
//! A bot that cleans up a deletion category has two problems. Listing the category and reading
//! page histories means walking continuation tokens across many requests without tripping the
//! wiki's rate limits. And before acting on a `{{Delete}}` it has to know whether the tag was
//! placed by the page's creator (who may have their own page deleted) or by somebody else (in
//! which case a human should have a look).
//!
//! **Key Features:**
//!
//! - **Complete collections**: Continuation tokens are followed until the server reports no more
//!   results. A collection either succeeds in full or fails; there are no silent partial results.
//! - **Polite by construction**: One [`RateLimiter`](rate_limit::RateLimiter), derived from the
//!   user's reported quota, spaces every request of a run.
//! - **Provenance**: The revision that introduced the marker is the oldest revision of the newest
//!   contiguous span of marked revisions. Its editor is compared with the page creator.
//! - **Read-only**: Nothing in this crate edits or deletes anything.
//!
//! ## Getting Started
//!
//! The HTTP side is yours: implement [`Transport`](mediawiki::Transport) on top of whatever
//! client and session handling your bot already has. Everything else is provided.
//!
//! ```rust,no_run
//! use wikiwarden::{
//!     api::{ApiError, Query},
//!     marker::{DeletionMarker, MarkerKind},
//!     mediawiki::{
//!         CategoryMembersEndpoint, CategoryQuery, ParseEndpoint, RevisionsEndpoint, Transport,
//!         UserInfoEndpoint,
//!     },
//!     rate_limit::RateLimiter,
//!     review::DeletionReview,
//! };
//!
//! struct Http; // your HTTP client of choice
//!
//! impl Transport for Http {
//!     fn execute(&self, _query: &Query) -> Result<serde_json::Value, ApiError> {
//!         // send the query to `https://<wiki>/w/api.php` and decode the JSON body
//!         Err(ApiError::transport("not connected"))
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let http = Http;
//!     let limiter = RateLimiter::from_quota_source(&mut UserInfoEndpoint::new(&http));
//!     let marker = DeletionMarker::new("Delete", "Candidates for deletion")?;
//!
//!     let report = DeletionReview::new(&limiter, MarkerKind::Either).run(
//!         CategoryQuery::new("Category:Candidates for deletion").to_query(),
//!         CategoryMembersEndpoint::new(&http),
//!         &mut RevisionsEndpoint::new(&http),
//!         &mut ParseEndpoint::new(&http, &marker),
//!     )?;
//!
//!     for entry in report.needing_confirmation() {
//!         println!("{}: {:?}", entry.member.title, entry.verdict());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules and API
//!
//! ### `collector` Module
//!
//! **Purpose**: Walks paged collections.
//!
//! Any [`PageFetcher`](api::PageFetcher) will do, including a closure. The continuation token
//! of each page is merged into the query for the next one:
//!
//! ```rust
//! use std::time::Duration;
//! use wikiwarden::{
//!     api::{ApiError, ContinuationToken, Page, Query},
//!     collector::collect,
//!     rate_limit::RateLimiter,
//! };
//!
//! let limiter = RateLimiter::new(Duration::ZERO);
//! let fetch = |query: &Query| -> Result<Page<u32>, ApiError> {
//!     Ok(match query.get("offset") {
//!         None => Page::with_continuation(vec![1, 2], ContinuationToken::new("2")),
//!         Some(_) => Page::last(vec![3]),
//!     })
//! };
//!
//! let result = collect(Query::new(), fetch, "offset", &limiter)?;
//! assert_eq!(result.items, vec![1, 2, 3]);
//! assert_eq!(result.pages_fetched, 2);
//! # Ok::<(), wikiwarden::collector::CollectError>(())
//! ```
//!
//! [`Pages`](collector::Pages) is the lazy variant: one page per `next()`, pausing only when
//! another page is actually requested.
//!
//! ### `provenance` Module
//!
//! **Purpose**: Finds the revision that introduced the marker and decides whether its editor
//! was the page creator. [`find_introducer`](provenance::find_introducer) works on any marker
//! oracle; [`ProvenanceVerifier`](provenance::ProvenanceVerifier) asks a
//! [`MarkerStateSource`](api::MarkerStateSource), caching and rate limiting the lookups.
//!
//! The resulting [`Verdict`](provenance::Verdict) is `NotMarked`, `Authorized` or
//! `Unauthorized`. The last one always needs a human decision.
//!
//! ### `utils` Module
//!
//! **Purpose**: Natural ordering of titles.
//!
//! ```rust
//! use wikiwarden::utils::sort_naturally;
//!
//! let mut titles = vec!["Page 10", "Page 2", "page1"];
//! sort_naturally(&mut titles, |title| *title);
//! assert_eq!(titles, ["page1", "Page 2", "Page 10"]);
//! ```
//!
//! ## Features and Configuration
//!
//! There are no configuration files; everything is passed in explicitly (quota, marker names,
//! [`MarkerKind`](marker::MarkerKind), [`IdentityPolicy`](provenance::IdentityPolicy)).
//!
//! ### Logging and Error Handling
//!
//! - Uses the `tracing` crate for logging; install any subscriber to see it.
//! - Revision histories whose parent chain does not line up are logged and accepted. Enable the
//!   `strict` feature to reject them instead.
//!
//! ```toml
//! [dependencies]
//! wikiwarden = { version = "0.1.0", features = ["strict"] }
//! ```
//!
//! ## Limitations
//!
//! - **Single-threaded**: Requests of one run are strictly sequential, which is what the rate
//!   limit asks for anyway.
//! - **Hidden usernames**: Revisions whose editor was suppressed cannot be attributed and fail
//!   the review of that page.
//!
//! ## Licensing
//!
//! This project is licensed under the Mozilla Public License 2.0.

pub mod api;
pub mod collector;
pub mod marker;
pub mod mediawiki;
pub mod provenance;
pub mod rate_limit;
pub mod review;
#[cfg(test)]
mod test_support;
pub mod utils;
