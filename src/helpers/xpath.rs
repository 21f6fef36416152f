//! XPath evaluation over HTML documents
//!
//! HTML is parsed leniently into an XML tree and queried with XPath 1.0.
//! Parsed documents are not `Send`, so the free functions take the raw text
//! and return owned results.

use crate::{Result, SumiError};
use sxd_document::Package;
use sxd_xpath::{evaluate_xpath, Value};

/// An HTML page parsed once for several XPath queries
///
/// Not `Send`; build it inside synchronous code.
pub struct XPathDocument {
    package: Package,
}

impl XPathDocument {
    pub fn parse(html: &str) -> Self {
        Self {
            package: sxd_html::parse_html(html),
        }
    }

    /// Returns true if `expr` selects anything
    ///
    /// Empty node sets, `false`, empty strings, zero and invalid expressions
    /// all count as no match.
    pub fn matches(&self, expr: &str) -> bool {
        let document = self.package.as_document();
        match evaluate_xpath(&document, expr) {
            Ok(Value::Nodeset(nodes)) => nodes.size() > 0,
            Ok(Value::Boolean(value)) => value,
            Ok(Value::String(value)) => !value.is_empty(),
            Ok(Value::Number(value)) => value != 0.0 && !value.is_nan(),
            Err(_) => false,
        }
    }

    /// Every value selected by `expr`, trimmed
    ///
    /// Nodes yield their string value in document order; scalar results
    /// yield a single entry.
    ///
    /// # Errors
    ///
    /// Returns [`SumiError::XPath`] when the expression does not compile or
    /// cannot be evaluated.
    pub fn values(&self, expr: &str) -> Result<Vec<String>> {
        let document = self.package.as_document();
        let value = evaluate_xpath(&document, expr)
            .map_err(|e| SumiError::XPath(format!("{}: {:?}", expr, e)))?;

        let values = match value {
            Value::Nodeset(nodes) => nodes
                .document_order()
                .into_iter()
                .map(|node| node.string_value().trim().to_string())
                .collect(),
            Value::String(value) => vec![value.trim().to_string()],
            Value::Number(value) => vec![value.to_string()],
            Value::Boolean(value) => vec![value.to_string()],
        };
        Ok(values)
    }

    /// The first non-empty value selected by `expr`
    pub fn first(&self, expr: &str) -> Result<Option<String>> {
        Ok(self.values(expr)?.into_iter().find(|value| !value.is_empty()))
    }
}

/// Returns true if `expr` selects anything in the document
pub fn xpath_matches(html: &str, expr: &str) -> bool {
    XPathDocument::parse(html).matches(expr)
}

/// Extracts every value selected by `expr`, trimmed
pub fn extract_xpath_all(html: &str, expr: &str) -> Result<Vec<String>> {
    XPathDocument::parse(html).values(expr)
}

/// Extracts the first non-empty value selected by `expr`
pub fn extract_xpath(html: &str, expr: &str) -> Result<Option<String>> {
    XPathDocument::parse(html).first(expr)
}
