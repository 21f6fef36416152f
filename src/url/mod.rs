//! URL handling module for Sumi-Pipeline
//!
//! This module provides URL normalization, request fingerprint keys and
//! domain helpers used by the HTTP layer, the rule engine and the
//! incremental engine.

mod domain;
mod key;
mod normalize;

// Re-export main functions
pub use domain::{domain_matches, extract_domain, normalize_domain};
pub use key::{hash_data, join_key, make_url_key};
pub use normalize::normalize_url;
