//! Helpers shared by stage operations
//!
//! - [`xpath`]: XPath evaluation over HTML text
//! - [`dates`]: loose date parsing into ISO form
//! - [`template`]: placeholder substitution in URLs and paths
//! - [`regex`]: first-match extraction with typed errors
//! - [`pagination`]: page-number URLs and next-page detection

pub mod dates;
pub mod pagination;
pub mod regex;
pub mod template;
pub mod xpath;
