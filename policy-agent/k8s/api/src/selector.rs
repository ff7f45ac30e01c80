//! Label selector expressions.
//!
//! Selectors are boolean expressions evaluated against an endpoint's labels:
//!
//! ```text
//! role == 'web' && (env in {'prod', 'staging'} || !has(canary))
//! ```
//!
//! Every selector has a canonical text form (produced by its `Display` impl). Two selectors with
//! the same canonical form are the same selector, regardless of how they were originally spelled.

use crate::labels::Labels;
use std::{collections::BTreeSet, fmt, sync::Arc};

mod parse;

pub use self::parse::ParseError;

/// A parsed, validated selector.
#[derive(Clone)]
pub struct Selector {
    expr: Arc<Expr>,
    canonical: Arc<str>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Expr {
    All,
    Has(String),
    Eq(String, String),
    Ne(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    StartsWith(String, String),
    EndsWith(String, String),
    Contains(String, String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

// === impl Selector ===

impl Selector {
    /// Parses a selector. The empty (or all-whitespace) string selects everything.
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        let expr = parse::parse(s)?;
        Ok(Self::from_expr(expr))
    }

    /// A selector matching every label set.
    pub fn all() -> Self {
        Self::from_expr(Expr::All)
    }

    /// A selector requiring `key == value`.
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::from_expr(Expr::Eq(key.into(), value.into()))
    }

    fn from_expr(expr: Expr) -> Self {
        let canonical = expr.to_string().into();
        Self {
            expr: Arc::new(expr),
            canonical,
        }
    }

    /// Returns a selector matching when both `self` and `other` match.
    pub fn and(&self, other: &Selector) -> Self {
        match (&*self.expr, &*other.expr) {
            (Expr::All, _) => other.clone(),
            (_, Expr::All) => self.clone(),
            (a, b) => Self::from_expr(Expr::And(Box::new(a.clone()), Box::new(b.clone()))),
        }
    }

    #[inline]
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.expr.matches(labels)
    }

    /// Every label key referenced anywhere in the expression.
    ///
    /// A change to a label that is not in this set can never change the result of `matches`.
    pub fn label_keys(&self) -> BTreeSet<String> {
        let mut keys = BTreeSet::new();
        self.expr.collect_keys(&mut keys);
        keys
    }

    /// Label keys that every matching label set must carry.
    pub fn required_keys(&self) -> BTreeSet<String> {
        self.expr.required_keys()
    }
}

impl PartialEq for Selector {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Selector {}

impl std::hash::Hash for Selector {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.canonical.hash(state)
    }
}

impl PartialOrd for Selector {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Selector {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Selector").field(&&*self.canonical).finish()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl std::str::FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// === impl Expr ===

impl Expr {
    fn matches(&self, labels: &Labels) -> bool {
        match self {
            Self::All => true,
            Self::Has(k) => labels.contains_key(k),
            Self::Eq(k, v) => labels.get(k) == Some(v.as_str()),
            // An unset key is never equal to anything, so it's always not-equal.
            Self::Ne(k, v) => labels.get(k) != Some(v.as_str()),
            Self::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Self::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
            Self::StartsWith(k, p) => labels.get(k).map(|v| v.starts_with(p.as_str())).unwrap_or(false),
            Self::EndsWith(k, s) => labels.get(k).map(|v| v.ends_with(s.as_str())).unwrap_or(false),
            Self::Contains(k, s) => labels.get(k).map(|v| v.contains(s.as_str())).unwrap_or(false),
            Self::Not(e) => !e.matches(labels),
            Self::And(a, b) => a.matches(labels) && b.matches(labels),
            Self::Or(a, b) => a.matches(labels) || b.matches(labels),
        }
    }

    fn collect_keys(&self, keys: &mut BTreeSet<String>) {
        match self {
            Self::All => {}
            Self::Has(k)
            | Self::Eq(k, _)
            | Self::Ne(k, _)
            | Self::In(k, _)
            | Self::NotIn(k, _)
            | Self::StartsWith(k, _)
            | Self::EndsWith(k, _)
            | Self::Contains(k, _) => {
                keys.insert(k.clone());
            }
            Self::Not(e) => e.collect_keys(keys),
            Self::And(a, b) | Self::Or(a, b) => {
                a.collect_keys(keys);
                b.collect_keys(keys);
            }
        }
    }

    fn required_keys(&self) -> BTreeSet<String> {
        match self {
            Self::Has(k)
            | Self::Eq(k, _)
            | Self::In(k, _)
            | Self::StartsWith(k, _)
            | Self::EndsWith(k, _)
            | Self::Contains(k, _) => Some(k.clone()).into_iter().collect(),
            Self::All | Self::Ne(..) | Self::NotIn(..) | Self::Not(_) => BTreeSet::new(),
            Self::And(a, b) => {
                let mut keys = a.required_keys();
                keys.extend(b.required_keys());
                keys
            }
            Self::Or(a, b) => {
                let b = b.required_keys();
                a.required_keys()
                    .into_iter()
                    .filter(|k| b.contains(k))
                    .collect()
            }
        }
    }
}

struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values may not contain both quote styles, so one of them always works.
        if self.0.contains('"') {
            write!(f, "'{}'", self.0)
        } else {
            write!(f, "\"{}\"", self.0)
        }
    }
}

fn fmt_set(f: &mut fmt::Formatter<'_>, values: &BTreeSet<String>) -> fmt::Result {
    f.write_str("{")?;
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", Quoted(v))?;
    }
    f.write_str("}")
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all()"),
            Self::Has(k) => write!(f, "has({k})"),
            Self::Eq(k, v) => write!(f, "{k} == {}", Quoted(v)),
            Self::Ne(k, v) => write!(f, "{k} != {}", Quoted(v)),
            Self::In(k, vs) => {
                write!(f, "{k} in ")?;
                fmt_set(f, vs)
            }
            Self::NotIn(k, vs) => {
                write!(f, "{k} not in ")?;
                fmt_set(f, vs)
            }
            Self::StartsWith(k, v) => write!(f, "{k} starts with {}", Quoted(v)),
            Self::EndsWith(k, v) => write!(f, "{k} ends with {}", Quoted(v)),
            Self::Contains(k, v) => write!(f, "{k} contains {}", Quoted(v)),
            Self::Not(e) => match **e {
                Self::And(..) | Self::Or(..) => write!(f, "!{e}"),
                _ => write!(f, "!({e})"),
            },
            Self::And(a, b) => write!(f, "({a} && {b})"),
            Self::Or(a, b) => write!(f, "({a} || {b})"),
        }
    }
}
