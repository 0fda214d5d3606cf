//! Vendor name normalization.
//!
//! Names are folded to a comparable form before scoring:
//!
//! 1. Unicode NFKD, combining marks dropped (`Zürich` → `zurich`)
//! 2. lowercase, `&` → `and`
//! 3. periods and apostrophes removed, other punctuation becomes whitespace
//! 4. trailing legal-form tokens stripped (`Acme Holdings, L.L.C.` → `acme holdings`)
//!
//! A name that folds to nothing yields `None`.

use std::collections::BTreeSet;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Legal-form tokens removed from the end of a name, after periods are dropped.
pub const LEGAL_SUFFIXES: &[&str] = &[
    "inc",
    "incorporated",
    "llc",
    "ltd",
    "limited",
    "corp",
    "corporation",
    "co",
    "company",
    "plc",
    "gmbh",
    "ag",
    "sa",
    "bv",
    "lp",
    "llp",
    "pty",
];

/// A name in comparable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedName {
    full: String,
    tokens: Vec<String>,
}

impl NormalizedName {
    /// Tokens joined by single spaces.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.full
    }

    #[must_use]
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Distinct tokens, for set similarity.
    #[must_use]
    pub fn token_set(&self) -> BTreeSet<&str> {
        self.tokens.iter().map(String::as_str).collect()
    }
}

/// Normalize a raw vendor name.
///
/// Legal suffixes are stripped only while another token remains, so a vendor
/// literally named `Company` still has a name to compare.
///
/// ```
/// use vmerge_match::normalize::normalize_name;
///
/// let name = normalize_name("ACME Holdings, Inc.").expect("name");
/// assert_eq!(name.as_str(), "acme holdings");
/// assert!(normalize_name(" .,- ").is_none());
/// ```
#[must_use]
pub fn normalize_name(raw: &str) -> Option<NormalizedName> {
    let mut folded = String::with_capacity(raw.len());
    for ch in raw.nfkd().filter(|ch| !is_combining_mark(*ch)) {
        match ch {
            '&' => folded.push_str(" and "),
            '.' | '\'' | '\u{2019}' => {}
            ch if ch.is_alphanumeric() => folded.extend(ch.to_lowercase()),
            _ => folded.push(' '),
        }
    }

    let mut tokens: Vec<String> = folded.split_whitespace().map(str::to_owned).collect();
    while tokens.len() > 1
        && tokens
            .last()
            .is_some_and(|last| LEGAL_SUFFIXES.contains(&last.as_str()))
    {
        tokens.pop();
    }

    if tokens.is_empty() {
        return None;
    }
    Some(NormalizedName {
        full: tokens.join(" "),
        tokens,
    })
}
