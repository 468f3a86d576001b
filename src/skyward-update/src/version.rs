//! Version string ordering.
//!
//! Versions are split into numeric and alphabetic runs; anything else
//! separates runs. Runs compare pairwise under this token order:
//!
//! ```text
//! ranked qualifier (alpha < beta < ... < rc)  <  end of version == 0  <  number  <  other word
//! ```
//!
//! so `1.0 beta < 1.0 == 1.0.0 < 1.0.1 < 1.0a`. Missing trailing runs count
//! as end of version.

use std::cmp::Ordering;

use once_cell::sync::Lazy;

/// Pre-release qualifiers in ascending rank.
pub const DEFAULT_QUALIFIERS: &[&str] = &[
    "alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta", "theta", "iota", "kappa",
    "lambda", "mu", "nu", "xi", "omicron", "pi", "rho", "sigma", "tau", "upsilon", "phi", "chi",
    "psi", "omega", "rc",
];

static DEFAULT_COMPARATOR: Lazy<VersionComparator> = Lazy::new(VersionComparator::default);

/// Compare two versions with the default qualifier vocabulary.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    DEFAULT_COMPARATOR.compare(a, b)
}

/// Version ordering with a configurable qualifier vocabulary.
#[derive(Debug, Clone)]
pub struct VersionComparator {
    /// Lowercased, in ascending rank.
    qualifiers: Vec<String>,
}

impl Default for VersionComparator {
    fn default() -> Self {
        Self::new(DEFAULT_QUALIFIERS.iter().copied())
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
enum Token<'a> {
    Qualifier(usize),
    /// End of version, or a numeric run equal to zero.
    Zero,
    /// Non-zero number: digit count, then the digits without leading zeros.
    Number(usize, &'a str),
    Word(&'a str),
}

impl VersionComparator {
    pub fn new<I, S>(qualifiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            qualifiers: qualifiers
                .into_iter()
                .map(|q| q.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        let left = self.tokens(a);
        let right = self.tokens(b);
        let len = left.len().max(right.len());
        for i in 0..len {
            let l = left.get(i).unwrap_or(&Token::Zero);
            let r = right.get(i).unwrap_or(&Token::Zero);
            match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }

    pub fn equal(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }

    /// `candidate` is at least `minimum`.
    pub fn meets_minimum(&self, candidate: &str, minimum: &str) -> bool {
        self.compare(candidate, minimum) != Ordering::Less
    }

    fn tokens<'a>(&self, version: &'a str) -> Vec<Token<'a>> {
        let mut version = version.trim();
        if let Some(rest) = version.strip_prefix(['v', 'V'])
            && rest.starts_with(|c: char| c.is_ascii_digit())
        {
            version = rest;
        }

        let mut out = Vec::new();
        let mut chars = version.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            let class: fn(char) -> bool = if c.is_ascii_digit() {
                |c: char| c.is_ascii_digit()
            } else if c.is_alphabetic() {
                |c: char| c.is_alphabetic()
            } else {
                continue;
            };
            let mut end = start + c.len_utf8();
            while let Some(&(i, next)) = chars.peek() {
                if !class(next) {
                    break;
                }
                end = i + next.len_utf8();
                chars.next();
            }
            let run = &version[start..end];
            out.push(if c.is_ascii_digit() {
                let digits = run.trim_start_matches('0');
                if digits.is_empty() {
                    Token::Zero
                } else {
                    Token::Number(digits.len(), digits)
                }
            } else {
                self.word(run)
            });
        }
        out
    }

    fn word<'a>(&self, run: &'a str) -> Token<'a> {
        let lower = run.to_lowercase();
        match self.qualifiers.iter().position(|q| *q == lower) {
            Some(rank) => Token::Qualifier(rank),
            None => Token::Word(run),
        }
    }
}
