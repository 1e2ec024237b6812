//! # Structured Model Formulas
//!
//! A formula names the explanatory terms of the per-row regression. The response
//! is never part of the formula text that matters: every row of the input matrix
//! is bound as the response by reference at fit time, so the formula is parsed
//! exactly once per run and no text is ever built from row data.
//!
//! Grammar (whitespace-insensitive):
//!
//! ```text
//! formula  := [lhs] "~" term ("+" term)*
//! term     := "1" | identifier | "(" "1" "|" identifier ")"
//! ```
//!
//! A left-hand side, when present, is accepted and discarded. `(1|g)` declares a
//! random intercept for grouping variable `g`; a bare identifier is a fixed
//! effect. The intercept is always included.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Whether a term contributes coefficients or a variance component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TermKind {
    Fixed,
    Random,
}

/// A single explanatory term of a formula.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub variable: String,
    pub kind: TermKind,
}

impl Term {
    pub fn fixed(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            kind: TermKind::Fixed,
        }
    }

    pub fn random(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            kind: TermKind::Random,
        }
    }

    /// Column label used for this term in variance tables.
    pub fn name(&self) -> &str {
        &self.variable
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TermKind::Fixed => f.write_str(&self.variable),
            TermKind::Random => write!(f, "(1|{})", self.variable),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("The formula '{0}' has no '~'. Write it as '~ term + term + (1|group)'.")]
    MissingTilde(String),
    #[error("The formula '{0}' contains more than one '~'.")]
    MultipleTilde(String),
    #[error("The formula has an empty term. Check for a doubled or trailing '+'.")]
    EmptyTerm,
    #[error("The term '{0}' appears more than once in the formula.")]
    DuplicateTerm(String),
    #[error(
        "The term '{0}' is not supported. Use plain variable names for fixed effects and '(1|group)' for random intercepts."
    )]
    UnsupportedTerm(String),
    #[error("The formula has no explanatory terms.")]
    NoTerms,
}

/// A parsed, validated model formula.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formula {
    terms: Vec<Term>,
}

impl Formula {
    /// Builds a formula from terms directly, applying the same checks as the parser.
    pub fn new(terms: Vec<Term>) -> Result<Self, FormulaError> {
        if terms.is_empty() {
            return Err(FormulaError::NoTerms);
        }
        let mut seen = HashSet::with_capacity(terms.len());
        for term in &terms {
            if !is_identifier(&term.variable) {
                return Err(FormulaError::UnsupportedTerm(term.to_string()));
            }
            if !seen.insert(term.variable.as_str()) {
                return Err(FormulaError::DuplicateTerm(term.variable.clone()));
            }
        }
        Ok(Self { terms })
    }

    pub fn parse(text: &str) -> Result<Self, FormulaError> {
        let mut sides = text.split('~');
        let lhs = sides.next().unwrap_or_default();
        let rhs = match sides.next() {
            Some(rhs) => rhs,
            None => return Err(FormulaError::MissingTilde(text.trim().to_string())),
        };
        if sides.next().is_some() {
            return Err(FormulaError::MultipleTilde(text.trim().to_string()));
        }
        if !lhs.trim().is_empty() {
            log::debug!(
                "Ignoring formula left-hand side '{}'; each matrix row is the response.",
                lhs.trim()
            );
        }

        let mut terms = Vec::new();
        for token in split_top_level(rhs) {
            let token = token.trim();
            if token.is_empty() {
                return Err(FormulaError::EmptyTerm);
            }
            if token == "1" {
                continue;
            }
            terms.push(parse_term(token)?);
        }
        Self::new(terms)
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    pub fn random_terms(&self) -> impl Iterator<Item = &Term> {
        self.terms.iter().filter(|t| t.kind == TermKind::Random)
    }

    pub fn has_random_terms(&self) -> bool {
        self.random_terms().next().is_some()
    }

    /// Term names in formula order; the column order of every variance table.
    pub fn term_names(&self) -> Vec<String> {
        self.terms.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.terms.iter().any(|t| t.name() == name)
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "~ {}", self.terms.iter().join(" + "))
    }
}

fn parse_term(token: &str) -> Result<Term, FormulaError> {
    if let Some(inner) = token.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        let mut parts = inner.split('|');
        let (Some(slope), Some(group), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(FormulaError::UnsupportedTerm(token.to_string()));
        };
        let group = group.trim();
        if slope.trim() != "1" || !is_identifier(group) {
            return Err(FormulaError::UnsupportedTerm(token.to_string()));
        }
        return Ok(Term::random(group));
    }
    if is_identifier(token) {
        Ok(Term::fixed(token))
    } else {
        Err(FormulaError::UnsupportedTerm(token.to_string()))
    }
}

/// Splits on `+` outside parentheses.
fn split_top_level(rhs: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, ch) in rhs.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '+' if depth == 0 => {
                pieces.push(&rhs[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&rhs[start..]);
    pieces
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '.' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_formula_in_order() {
        let formula = Formula::parse("~ Age + (1|Individual) + (1 | Tissue) + Batch").unwrap();
        assert_eq!(
            formula.terms(),
            &[
                Term::fixed("Age"),
                Term::random("Individual"),
                Term::random("Tissue"),
                Term::fixed("Batch"),
            ]
        );
        assert!(formula.has_random_terms());
        assert!(formula.contains("Individual"));
        assert!(!formula.contains("(1|Individual)"));
        assert_eq!(
            formula.term_names(),
            vec!["Age", "Individual", "Tissue", "Batch"]
        );
    }

    #[test]
    fn left_hand_side_and_explicit_intercept_are_accepted() {
        let formula = Formula::parse("expr ~ 1 + Age").unwrap();
        assert_eq!(formula.terms(), &[Term::fixed("Age")]);
        assert!(!formula.has_random_terms());
    }

    #[test]
    fn display_is_canonical() {
        let formula = Formula::parse("~Age+(1|Individual)").unwrap();
        assert_eq!(formula.to_string(), "~ Age + (1|Individual)");
        assert_eq!(Formula::parse(&formula.to_string()).unwrap(), formula);
    }

    #[test]
    fn rejects_malformed_formulas() {
        assert!(matches!(
            Formula::parse("Age + Sex"),
            Err(FormulaError::MissingTilde(_))
        ));
        assert!(matches!(
            Formula::parse("~ Age + "),
            Err(FormulaError::EmptyTerm)
        ));
        assert!(matches!(
            Formula::parse("~ Age + Age"),
            Err(FormulaError::DuplicateTerm(t)) if t == "Age"
        ));
        assert!(matches!(
            Formula::parse("~ (Age|Individual)"),
            Err(FormulaError::UnsupportedTerm(_))
        ));
        assert!(matches!(
            Formula::parse("~ Age:Sex"),
            Err(FormulaError::UnsupportedTerm(_))
        ));
        assert!(matches!(Formula::parse("~ 1"), Err(FormulaError::NoTerms)));
    }
}
