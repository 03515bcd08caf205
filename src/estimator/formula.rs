//! Formula terms understood by the reference GLM
//!
//! Grammar: `[response] ~ term + term ...` where a term is a column name
//! (used as a numeric covariate), `factor(column)` (dummy coded against the
//! first level seen), `1` (intercept, the default) or `0` / `-1` (no intercept).

use super::{EstimatorError, FormulaSpec};

/// A single right-hand-side term
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    Numeric(String),
    Factor(String),
}

impl Term {
    pub fn column(&self) -> &str {
        match self {
            Term::Numeric(c) | Term::Factor(c) => c,
        }
    }
}

/// Parsed formula
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formula {
    pub response: Option<String>,
    pub intercept: bool,
    pub terms: Vec<Term>,
}

impl Formula {
    pub fn parse(spec: &FormulaSpec) -> Result<Self, EstimatorError> {
        let raw = spec.as_str();
        let error = |reason: &str| EstimatorError::Formula {
            formula: raw.to_string(),
            reason: reason.to_string(),
        };

        let (lhs, rhs) = match raw.split_once('~') {
            Some((lhs, rhs)) => (lhs.trim(), rhs.trim()),
            None => return Err(error("missing '~'")),
        };
        if rhs.contains('~') {
            return Err(error("more than one '~'"));
        }

        let response = if lhs.is_empty() {
            None
        } else if is_identifier(lhs) {
            Some(lhs.to_string())
        } else {
            return Err(error("response must be a column name"));
        };

        let mut intercept = true;
        let mut terms = Vec::new();

        // "-1" arrives as a "-" separated piece; normalise to "+ -1"
        let compact: String = rhs.split_whitespace().collect();
        let normalised = compact.replace('-', "+-");
        for piece in normalised.split('+').map(str::trim) {
            match piece {
                "" => {
                    if rhs.is_empty() {
                        return Err(error("empty right-hand side"));
                    }
                }
                "1" => intercept = true,
                "0" | "-1" => intercept = false,
                p if p.starts_with("factor(") && p.ends_with(')') => {
                    let inner = p["factor(".len()..p.len() - 1].trim();
                    if !is_identifier(inner) {
                        return Err(error("factor() needs a column name"));
                    }
                    push_unique(&mut terms, Term::Factor(inner.to_string()));
                }
                p if is_identifier(p) => push_unique(&mut terms, Term::Numeric(p.to_string())),
                _ => return Err(error(&format!("unsupported term '{}'", piece))),
            }
        }

        if !intercept && terms.is_empty() {
            return Err(error("model has no terms"));
        }

        Ok(Self { response, intercept, terms })
    }
}

fn push_unique(terms: &mut Vec<Term>, term: Term) {
    if !terms.contains(&term) {
        terms.push(term);
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}
