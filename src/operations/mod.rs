//! Built-in stage operations
//!
//! Every operation here is a unit struct implementing
//! [`Operation`](crate::pipeline::Operation), registered under the name a
//! pipeline file uses in a stage's `method`:
//!
//! | Method | Purpose |
//! |---|---|
//! | `init` | merge stage params into the item |
//! | `seed` | emit one item per configured URL |
//! | `enumerate` | emit one item per configured value |
//! | `tee` | emit the item on every handler rule |
//! | `sequence` | emit a range of numbers |
//! | `dates` | emit a range of dates |
//! | `fetch` | GET a URL and archive the response |
//! | `session` | configure the run's HTTP session |
//! | `post`, `post_json` | POST form or JSON data |
//! | `parse` | extract metadata and links from HTML |
//! | `clean` | drop, default, rewrite and require item fields |
//! | `directory`, `store` | write archived content to a directory |
//! | `cleanup_archive` | remove content from the archive |
//! | `inspect` | log the item |

mod clean;
mod debug;
mod fetch;
mod initializers;
mod parse;
mod store;

pub use clean::Clean;
pub use debug::Inspect;
pub use fetch::{Fetch, Post, PostJson, Session};
pub use initializers::{Dates, Enumerate, Init, Seed, Sequence, Tee};
pub use parse::Parse;
pub use store::{CleanupArchive, Directory, Store};

use crate::pipeline::OperationRegistry;

/// Registers every built-in operation under its method name
pub fn register_builtins(registry: &mut OperationRegistry) {
    registry
        .register("init", Init)
        .register("seed", Seed)
        .register("enumerate", Enumerate)
        .register("tee", Tee)
        .register("sequence", Sequence)
        .register("dates", Dates)
        .register("fetch", Fetch)
        .register("session", Session)
        .register("post", Post)
        .register("post_json", PostJson)
        .register("parse", Parse)
        .register("clean", Clean)
        .register("directory", Directory)
        .register("store", Store)
        .register("cleanup_archive", CleanupArchive)
        .register("inspect", Inspect);
}

/// A param value as a list: arrays as is, `null`/absent as empty, anything
/// else as a single entry
pub(crate) fn ensure_list(value: Option<serde_json::Value>) -> Vec<serde_json::Value> {
    match value {
        None | Some(serde_json::Value::Null) => Vec::new(),
        Some(serde_json::Value::Array(items)) => items,
        Some(other) => vec![other],
    }
}
