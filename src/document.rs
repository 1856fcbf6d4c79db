//! Documents, terms and delete queries
//!
//! Analysis is out of scope: text fields are split on whitespace and
//! lowercased, keyword fields index their value verbatim.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const DOC_OVERHEAD_BYTES: usize = 64;
const FIELD_OVERHEAD_BYTES: usize = 48;
const POSTING_OVERHEAD_BYTES: usize = 24;
const QUERY_OVERHEAD_BYTES: usize = 40;

/// A (field, text) pair identifying indexed content
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new(field: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            text: text.into(),
        }
    }

    pub fn ram_bytes_used(&self) -> usize {
        POSTING_OVERHEAD_BYTES + self.field.len() + self.text.len()
    }
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

/// Value stored in a document field
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Tokenized on whitespace, lowercased
    Text(String),
    /// Indexed as a single exact term
    Keyword(String),
    /// Indexed as its decimal string, range-queryable
    Long(i64),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

/// An ordered collection of fields
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<Field>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(name, FieldValue::Text(value.into()));
        self
    }

    pub fn with_keyword(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.add(name, FieldValue::Keyword(value.into()));
        self
    }

    pub fn with_long(mut self, name: impl Into<String>, value: i64) -> Self {
        self.add(name, FieldValue::Long(value));
        self
    }

    pub fn add(&mut self, name: impl Into<String>, value: FieldValue) {
        self.fields.push(Field {
            name: name.into(),
            value,
        });
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// First value of the named field
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Convenience accessor for keyword and text fields
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            FieldValue::Text(s) | FieldValue::Keyword(s) => Some(s.as_str()),
            FieldValue::Long(_) => None,
        }
    }

    /// Distinct terms this document indexes
    pub fn terms(&self) -> BTreeSet<Term> {
        let mut terms = BTreeSet::new();
        for field in &self.fields {
            match &field.value {
                FieldValue::Text(text) => {
                    for token in text.split_whitespace() {
                        terms.insert(Term::new(field.name.clone(), token.to_lowercase()));
                    }
                }
                FieldValue::Keyword(value) => {
                    terms.insert(Term::new(field.name.clone(), value.clone()));
                }
                FieldValue::Long(value) => {
                    terms.insert(Term::new(field.name.clone(), value.to_string()));
                }
            }
        }
        terms
    }

    pub fn has_term(&self, term: &Term) -> bool {
        self.fields.iter().any(|field| {
            field.name == term.field
                && match &field.value {
                    FieldValue::Text(text) => text
                        .split_whitespace()
                        .any(|token| token.to_lowercase() == term.text),
                    FieldValue::Keyword(value) => *value == term.text,
                    FieldValue::Long(value) => value.to_string() == term.text,
                }
        })
    }

    fn long_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = i64> + 'a {
        self.fields.iter().filter_map(move |f| match &f.value {
            FieldValue::Long(v) if f.name == name => Some(*v),
            _ => None,
        })
    }

    /// Estimated bytes this document occupies once buffered and inverted
    pub fn ram_bytes_used(&self) -> usize {
        let stored: usize = self
            .fields
            .iter()
            .map(|f| {
                FIELD_OVERHEAD_BYTES
                    + f.name.len()
                    + match &f.value {
                        FieldValue::Text(s) | FieldValue::Keyword(s) => s.len(),
                        FieldValue::Long(_) => std::mem::size_of::<i64>(),
                    }
            })
            .sum();
        let postings: usize = self.terms().iter().map(Term::ram_bytes_used).sum();
        DOC_OVERHEAD_BYTES + stored + postings
    }
}

/// Selects documents to delete
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeleteQuery {
    /// Documents containing the term
    Term(Term),
    /// Documents containing every term
    AllTerms(Vec<Term>),
    /// Documents containing at least one term
    AnyTerm(Vec<Term>),
    /// Documents with a long value in `[min, max]`
    LongRange { field: String, min: i64, max: i64 },
    /// Every document
    MatchAll,
}

impl DeleteQuery {
    pub fn term(field: impl Into<String>, text: impl Into<String>) -> Self {
        DeleteQuery::Term(Term::new(field, text))
    }

    pub fn long_range(field: impl Into<String>, min: i64, max: i64) -> Self {
        DeleteQuery::LongRange {
            field: field.into(),
            min,
            max,
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            DeleteQuery::Term(term) => doc.has_term(term),
            DeleteQuery::AllTerms(terms) => {
                !terms.is_empty() && terms.iter().all(|t| doc.has_term(t))
            }
            DeleteQuery::AnyTerm(terms) => terms.iter().any(|t| doc.has_term(t)),
            DeleteQuery::LongRange { field, min, max } => {
                doc.long_values(field).any(|v| v >= *min && v <= *max)
            }
            DeleteQuery::MatchAll => true,
        }
    }

    /// True for single-term deletes, which count toward the delete-term trigger
    pub fn is_term(&self) -> bool {
        matches!(self, DeleteQuery::Term(_))
    }

    pub fn ram_bytes_used(&self) -> usize {
        QUERY_OVERHEAD_BYTES
            + match self {
                DeleteQuery::Term(term) => term.ram_bytes_used(),
                DeleteQuery::AllTerms(terms) | DeleteQuery::AnyTerm(terms) => {
                    terms.iter().map(Term::ram_bytes_used).sum()
                }
                DeleteQuery::LongRange { field, .. } => field.len() + 16,
                DeleteQuery::MatchAll => 0,
            }
    }
}
