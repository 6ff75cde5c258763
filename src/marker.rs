use std::sync::LazyLock;

use compact_str::CompactString;
use regex::Regex;
use rustc_hash::FxHashMap;

use crate::{api::MarkerState, utils::normalize_title};

/// Namespace number of templates; the same on every wiki, whatever the local prefix.
pub const TEMPLATE_NAMESPACE: i32 = 10;

/// Which part of the rendered content counts as the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MarkerKind {
    Template,
    Category,
    /// template or category
    #[default]
    Either,
    Both,
}

impl MarkerKind {
    pub fn is_present(self, state: MarkerState) -> bool {
        match self {
            MarkerKind::Template => state.has_template,
            MarkerKind::Category => state.has_category,
            MarkerKind::Either => state.has_template || state.has_category,
            MarkerKind::Both => state.has_template && state.has_category,
        }
    }
}

/// Marker results of one verification run, keyed by revision id.
///
/// A revision's content never changes, so neither does its marker result.
#[derive(Debug, Default)]
pub struct MarkerCache {
    present: FxHashMap<u64, bool>,
}

impl MarkerCache {
    pub fn get(&self, revision_id: u64) -> Option<bool> {
        self.present.get(&revision_id).copied()
    }

    pub fn get_or_try_insert<E>(
        &mut self,
        revision_id: u64,
        evaluate: impl FnOnce(u64) -> Result<bool, E>,
    ) -> Result<bool, E> {
        if let Some(present) = self.get(revision_id) {
            return Ok(present);
        }
        let present = evaluate(revision_id)?;
        self.present.insert(revision_id, present);
        Ok(present)
    }

    pub fn len(&self) -> usize {
        self.present.len()
    }

    pub fn is_empty(&self) -> bool {
        self.present.is_empty()
    }
}

/// The deletion request: a template (e.g. `{{Delete}}`) that usually also files the page
/// into a category (e.g. `[[Category:Candidates for deletion]]`).
#[derive(Debug, Clone)]
pub struct DeletionMarker {
    template: CompactString,
    category: CompactString,
    template_pattern: Regex,
    category_pattern: Regex,
}

impl DeletionMarker {
    /// Both names are given without namespace prefix.
    pub fn new(template: &str, category: &str) -> Result<Self, regex::Error> {
        let template = CompactString::from(normalize_title(template));
        let category = CompactString::from(normalize_title(category));

        // {{Delete}}, {{delete|reason}}, {{Template:Delete}}, {{ subst:delete }}
        let template_pattern = Regex::new(&format!(
            r"\{{\{{\s*(?:(?i:subst|safesubst)\s*:\s*)?(?:(?i:template)\s*:\s*)?{}\s*(?:\||\}}\}})",
            title_pattern(&template)
        ))?;
        // [[Category:Candidates for deletion]], [[category:candidates_for_deletion|sort key]]
        let category_pattern = Regex::new(&format!(
            r"\[\[\s*(?i:category)\s*:\s*{}\s*(?:\||\]\])",
            title_pattern(&category)
        ))?;

        Ok(Self {
            template,
            category,
            template_pattern,
            category_pattern,
        })
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// Evaluate the template and category lists of a parsed revision.
    ///
    /// Templates come as `(namespace, title)` pairs with the localized prefix in the title
    /// (`(10, "Template:Delete")`). Transcluded pages outside the template namespace never
    /// count. Category names carry no prefix.
    pub fn evaluate_parsed<'a>(
        &self,
        templates: impl IntoIterator<Item = (i32, &'a str)>,
        categories: impl IntoIterator<Item = &'a str>,
    ) -> MarkerState {
        let has_template = templates
            .into_iter()
            .filter(|&(ns, _)| ns == TEMPLATE_NAMESPACE)
            .any(|(_, title)| {
                let name = title.split_once(':').map_or(title, |(_, name)| name);
                normalize_title(name) == self.template
            });
        let has_category = categories
            .into_iter()
            .any(|name| normalize_title(name) == self.category);

        MarkerState {
            has_template,
            has_category,
        }
    }

    /// Evaluate raw wikitext. Commented-out markers do not count.
    pub fn evaluate_wikitext(&self, text: &str) -> MarkerState {
        static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());

        let text = COMMENT.replace_all(text, "");
        MarkerState {
            has_template: self.template_pattern.is_match(&text),
            has_category: self.category_pattern.is_match(&text),
        }
    }
}

// first letter case-insensitive, spaces and underscores interchangeable
fn title_pattern(normalized: &str) -> String {
    let mut pattern = String::new();
    let mut chars = normalized.chars();

    if let Some(first) = chars.next() {
        let upper: String = first.to_uppercase().collect();
        let lower: String = first.to_lowercase().collect();
        if upper == lower {
            pattern.push_str(&regex::escape(&upper));
        } else {
            pattern.push_str(&format!(
                "(?:{}|{})",
                regex::escape(&upper),
                regex::escape(&lower)
            ));
        }
    }

    let mut buf = [0; 4];
    for c in chars {
        if c == ' ' {
            pattern.push_str("[ _]+");
        } else {
            pattern.push_str(&regex::escape(c.encode_utf8(&mut buf)));
        }
    }

    pattern
}
