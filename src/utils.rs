use std::{cmp::Ordering, sync::LazyLock};

use regex::Regex;

// Natural ("human") ordering.
//
// A key is split the way `re.split(r"(\d+)", key)` would: text, digits, text, digits, ..., text,
// where the leading and trailing text runs may be empty. Text runs compare case-insensitively,
// digit runs compare by numeric value. Because both sides always start with a text run and
// alternate from there, a text run is never compared against a digit run.
//
// Keys that compare equal run by run (e.g. "a01" and "A1") fall back to a plain byte comparison
// so the order is total and sorting is deterministic.

#[derive(Debug, Clone, PartialEq, Eq)]
enum NaturalRun {
    /// lowercased text
    Text(String),
    /// digits with leading zeros stripped
    Number(String),
}

impl Ord for NaturalRun {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (NaturalRun::Text(a), NaturalRun::Text(b)) => a.cmp(b),
            (NaturalRun::Number(a), NaturalRun::Number(b)) => compare_digit_runs(a, b),
            // unreachable for keys built by `natural_key`, see above
            (NaturalRun::Text(_), NaturalRun::Number(_)) => Ordering::Less,
            (NaturalRun::Number(_), NaturalRun::Text(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for NaturalRun {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Precomputed sort key for [`natural_cmp`] ordering, for use with `sort_by_cached_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaturalKey {
    runs: Vec<NaturalRun>,
    original: String,
}

impl Ord for NaturalKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.runs
            .cmp(&other.runs)
            .then_with(|| self.original.cmp(&other.original))
    }
}

impl PartialOrd for NaturalKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn fold_case(text: &str) -> String {
    // per-character mapping, `str::to_lowercase` special-cases the final sigma
    text.chars().flat_map(char::to_lowercase).collect()
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    // no leading zeros left, so the longer run is the larger number
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

pub fn natural_key(key: &str) -> NaturalKey {
    static DIGIT_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9]+").unwrap());

    let mut runs = Vec::new();
    let mut last_end = 0;
    for m in DIGIT_RUN.find_iter(key) {
        runs.push(NaturalRun::Text(fold_case(&key[last_end..m.start()])));
        runs.push(NaturalRun::Number(
            m.as_str().trim_start_matches('0').to_string(),
        ));
        last_end = m.end();
    }
    runs.push(NaturalRun::Text(fold_case(&key[last_end..])));

    NaturalKey {
        runs,
        original: key.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Run<'a> {
    Text(&'a str),
    Digits(&'a str),
}

/// Yields the runs of a key without allocating.
struct Runs<'a> {
    rest: &'a str,
    expect_digits: bool,
    done: bool,
}

impl<'a> Runs<'a> {
    fn new(key: &'a str) -> Self {
        Self {
            rest: key,
            expect_digits: false,
            done: false,
        }
    }
}

impl<'a> Iterator for Runs<'a> {
    type Item = Run<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if self.expect_digits {
            // a text run only stops early at a digit, so `rest` starts with one here
            let end = self
                .rest
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(self.rest.len());
            let (digits, rest) = self.rest.split_at(end);
            self.rest = rest;
            self.expect_digits = false;
            Some(Run::Digits(digits))
        } else {
            let end = self
                .rest
                .find(|c: char| c.is_ascii_digit())
                .unwrap_or(self.rest.len());
            let (text, rest) = self.rest.split_at(end);
            self.rest = rest;
            self.expect_digits = true;
            if rest.is_empty() {
                self.done = true;
            }
            Some(Run::Text(text))
        }
    }
}

/// Compare two keys in natural order: `"page1" < "Page 2" < "Page 10"`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut runs_a = Runs::new(a);
    let mut runs_b = Runs::new(b);

    loop {
        let ordering = match (runs_a.next(), runs_b.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(Run::Text(x)), Some(Run::Text(y))) => x
                .chars()
                .flat_map(char::to_lowercase)
                .cmp(y.chars().flat_map(char::to_lowercase)),
            (Some(Run::Digits(x)), Some(Run::Digits(y))) => compare_digit_runs(x, y),
            (Some(Run::Text(_)), Some(Run::Digits(_))) => Ordering::Less,
            (Some(Run::Digits(_)), Some(Run::Text(_))) => Ordering::Greater,
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

pub fn sort_naturally<T>(items: &mut [T], key: impl Fn(&T) -> &str) {
    items.sort_by(|a, b| natural_cmp(key(a), key(b)));
}

/// Normalize a page title the way MediaWiki does before comparing titles:
/// underscores are spaces, runs of whitespace collapse and the first letter is uppercase.
pub fn normalize_title(title: &str) -> String {
    let mut normalized = String::with_capacity(title.len());
    for word in title
        .split(|c: char| c == '_' || c.is_whitespace())
        .filter(|word| !word.is_empty())
    {
        if !normalized.is_empty() {
            normalized.push(' ');
        }
        normalized.push_str(word);
    }

    let mut chars = normalized.chars();
    match chars.next() {
        Some(first) if !first.is_uppercase() => first.to_uppercase().chain(chars).collect(),
        _ => normalized,
    }
}
