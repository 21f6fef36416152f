//! HTML parsing: metadata extraction and link discovery

use crate::context::Context;
use crate::helpers::dates::iso_date;
use crate::helpers::pagination::{next_page, paginated_url};
use crate::helpers::xpath::XPathDocument;
use crate::operations::ensure_list;
use crate::pipeline::Operation;
use crate::rules::Rule;
use crate::url::make_url_key;
use crate::{Data, Result, SumiError};
use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::Value;
use std::collections::HashSet;
use url::Url;

/// Elements and the attribute holding their link
const LINK_SELECTOR: &str = "a[href], img[src], link[href], iframe[src]";

/// Parses an HTML response, extracting metadata and following links
///
/// Items must carry response metadata from `fetch`. For HTML bodies:
///
/// 1. `title` is set from `<title>` unless the item has one
/// 2. `meta` and `meta_date` params (`{ field = xpath }` or a list of XPaths
///    tried in order) fill item fields; `meta_date` values are normalised to
///    ISO dates
/// 3. every link (`a`, `img`, `link`, `iframe`) is emitted once per run on
///    the `fetch` rule; `include` limits discovery to elements matching
///    these CSS selectors, `link_title` copies the link text into `title`
/// 4. with a `pagination` param the next page is emitted on `next_page`
///
/// Finally the item is emitted on `store` if the response matches the
/// `store` rule (everything by default).
pub struct Parse;

/// A link found on a page
#[derive(Debug, Clone, PartialEq)]
struct Link {
    url: String,
    title: Option<String>,
}

#[async_trait]
impl Operation for Parse {
    async fn execute(&self, ctx: &Context, mut data: Data) -> Result<()> {
        let mut response = ctx.http.rehash(&data)?;

        if let Some(html) = response.html_text()? {
            let base_url = response
                .url()
                .or_else(|| data.get("url").and_then(Value::as_str).map(str::to_string));
            tracing::info!("Parse HTML: {}", base_url.as_deref().unwrap_or_default());

            extract_metadata(ctx, &mut data, &html)?;

            if let Some(base_url) = base_url.as_deref().and_then(|u| Url::parse(u).ok()) {
                let include = selectors(ctx)?;
                let links = discover_links(&html, &base_url, &include, ctx.get_bool("link_title", false));
                emit_links(ctx, &data, links)?;
            }
            paginate(ctx, &data, &html)?;
        }

        let rule = Rule::parse_or_default(ctx.params().get("store"))?;
        let subject = response.subject_for(&rule).await?;
        if rule.apply(&subject) {
            ctx.emit_rule("store", data)?;
        }
        Ok(())
    }
}

fn extract_metadata(ctx: &Context, data: &mut Data, html: &str) -> Result<()> {
    let document = XPathDocument::parse(html);

    if !data.contains_key("title") {
        if let Some(title) = document.first("//title")? {
            data.insert("title".to_string(), Value::String(collapse_spaces(&title)));
        }
    }

    for (param, dates) in [("meta", false), ("meta_date", true)] {
        let Some(Value::Object(fields)) = ctx.get(param) else {
            continue;
        };
        for (key, xpaths) in fields {
            for xpath in ensure_list(Some(xpaths)) {
                let Some(xpath) = xpath.as_str() else {
                    continue;
                };
                let Some(value) = document.values(xpath)?.into_iter().next() else {
                    continue;
                };
                let value = collapse_spaces(&value);
                let value = if dates { iso_date(&value) } else { Some(value) };
                if let Some(value) = value.filter(|v| !v.is_empty()) {
                    data.insert(key.clone(), Value::String(value));
                }
                break;
            }
        }
    }
    Ok(())
}

fn selectors(ctx: &Context) -> Result<Vec<String>> {
    let include: Vec<String> = ensure_list(ctx.get("include"))
        .iter()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();
    for selector in &include {
        Selector::parse(selector)
            .map_err(|e| SumiError::Parse(format!("Invalid selector {:?}: {:?}", selector, e)))?;
    }
    Ok(include)
}

/// Finds every link on the page, deduplicated, in document order
///
/// Fragment-only and `javascript:`/`mailto:`/`tel:`/`data:` links are
/// ignored, as are links that do not resolve to http(s).
fn discover_links(html: &str, base_url: &Url, include: &[String], link_title: bool) -> Vec<Link> {
    let document = Html::parse_document(html);
    let Ok(link_selector) = Selector::parse(LINK_SELECTOR) else {
        return Vec::new();
    };

    let roots: Vec<ElementRef> = if include.is_empty() {
        vec![document.root_element()]
    } else {
        include
            .iter()
            .filter_map(|s| Selector::parse(s).ok())
            .flat_map(|selector| document.select(&selector).collect::<Vec<_>>())
            .collect()
    };

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for root in roots {
        let candidates = std::iter::once(root).chain(root.select(&link_selector));
        for element in candidates {
            let value = element.value();
            let Some(href) = value.attr("href").or_else(|| value.attr("src")) else {
                continue;
            };
            let Some(url) = resolve_link(href, base_url) else {
                continue;
            };
            if !seen.insert(url.clone()) {
                continue;
            }

            let title = if link_title {
                Some(collapse_spaces(&element.text().collect::<String>()))
            } else {
                value.attr("title").map(collapse_spaces)
            };
            links.push(Link {
                url,
                title: title.filter(|t| !t.is_empty()),
            });
        }
    }
    links
}

fn resolve_link(href: &str, base_url: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || ["javascript:", "mailto:", "tel:", "data:"]
            .iter()
            .any(|scheme| href.starts_with(scheme))
    {
        return None;
    }
    let url = base_url.join(href).ok()?;
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

/// Emits each link not seen before in this run
fn emit_links(ctx: &Context, data: &Data, links: Vec<Link>) -> Result<()> {
    for link in links {
        let tag = make_url_key(&link.url, "GET", None);
        let Some(tag) = ctx.make_key(&[ctx.run_id(), tag.as_str()], None) else {
            continue;
        };
        if ctx.check_tag(&tag)? {
            continue;
        }
        ctx.set_tag(&tag, &Value::Null)?;

        let mut item = data.clone();
        item.insert("url".to_string(), Value::String(link.url));
        if !item.get("title").map_or(false, |t| !t.is_null()) {
            if let Some(title) = link.title {
                item.insert("title".to_string(), Value::String(title));
            }
        }
        ctx.emit_rule("fetch", item)?;
    }
    Ok(())
}

/// Emits the next page on `next_page` if the pagination config finds one
fn paginate(ctx: &Context, data: &Data, html: &str) -> Result<()> {
    let Some(config) = ctx.get("pagination").filter(Value::is_object) else {
        return Ok(());
    };
    let current = data.get("page").and_then(Value::as_i64).unwrap_or(1);
    let Some(page) = next_page(html, current, &config)? else {
        return Ok(());
    };
    tracing::info!("Next page: {}", page);

    let mut item = data.clone();
    item.insert("page".to_string(), Value::from(page));
    let param = config.get("param").and_then(Value::as_str).unwrap_or("page");
    if let Some(url) = data.get("url").and_then(Value::as_str) {
        item.insert("url".to_string(), Value::String(paginated_url(url, page, param)?));
    }
    ctx.emit_rule("next_page", item)
}

fn collapse_spaces(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{data, Fixture};
    use serde_json::json;

    const PAGE: &str = r##"<html><head><title>  Annual
        report </title><link rel="stylesheet" href="/style.css"></head>
        <body>
          <h1>Report 2020</h1>
          <span class="date">3 March 2021</span>
          <div id="content">
            <a href="/doc/1.pdf" title="First">one</a>
            <a href="/doc/2.pdf">two</a>
            <a href="/doc/1.pdf">again</a>
          </div>
          <a href="mailto:x@example.com">mail</a>
          <a href="#top">top</a>
          <img src="https://cdn.example.com/logo.png">
          <span id="pages">2</span>
        </body></html>"##;

    const PIPELINE: &str = r#"
name = "parse_ops"

[pipeline.parse]
method = "parse"
params = { meta = { heading = ["//h2", "//h1"] }, meta_date = { published = "//span[@class='date']" }, pagination = { total_pages = "//span[@id='pages']" } }
handle = { fetch = "fetch", store = "store", next_page = "fetch" }

[pipeline.fetch]
method = "inspect"

[pipeline.store]
method = "inspect"
"#;

    fn base() -> Url {
        Url::parse("https://example.com/reports/").unwrap()
    }

    #[test]
    fn test_discover_links() {
        let links = discover_links(PAGE, &base(), &[], false);
        let urls: Vec<_> = links.iter().map(|l| l.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://example.com/style.css",
                "https://example.com/doc/1.pdf",
                "https://example.com/doc/2.pdf",
                "https://cdn.example.com/logo.png",
            ]
        );
        assert_eq!(links[1].title.as_deref(), Some("First"));
    }

    #[test]
    fn test_discover_links_with_include_and_link_title() {
        let links = discover_links(PAGE, &base(), &["#content".to_string()], true);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].title.as_deref(), Some("one"));
        assert_eq!(links[1].title.as_deref(), Some("two"));
    }

    #[test]
    fn test_resolve_link_filters_schemes() {
        assert_eq!(resolve_link("javascript:void(0)", &base()), None);
        assert_eq!(resolve_link("ftp://example.com/x", &base()), None);
        assert_eq!(
            resolve_link(" a.html ", &base()).as_deref(),
            Some("https://example.com/reports/a.html")
        );
    }

    #[tokio::test]
    async fn test_parse_emits_links_metadata_and_store() {
        let fixture = Fixture::new(PIPELINE);
        let ctx = fixture.context("parse", false);
        let hash = ctx.store_data(PAGE.as_bytes()).unwrap();
        let item = data(json!({
            "url": "https://example.com/reports/",
            "status_code": 200,
            "content_hash": hash,
            "headers": {"content-type": "text/html"},
        }));
        let run_id = ctx.run_id().to_string();
        ctx.execute(item.clone()).await.unwrap();

        let jobs = fixture.queued();
        let links: Vec<_> = jobs.iter().filter(|j| j.stage == "fetch").collect();
        // 4 links plus the next page
        assert_eq!(links.len(), 5);
        let next = links
            .iter()
            .find(|j| j.data.get("page") == Some(&json!(2)))
            .unwrap();
        assert_eq!(next.data["url"], json!("https://example.com/reports/?page=2"));

        let stored: Vec<_> = jobs.iter().filter(|j| j.stage == "store").collect();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].data["title"], json!("Annual report"));
        assert_eq!(stored[0].data["heading"], json!("Report 2020"));
        assert_eq!(stored[0].data["published"], json!("2021-03-03"));

        // links already seen in this run are not emitted again
        let state = crate::context::RunState {
            run_id,
            ..fixture.context("parse", false).dump_state()
        };
        let again = crate::Context::from_state(
            fixture.pipeline.clone(),
            "parse",
            state,
            fixture.services.clone(),
        )
        .unwrap();
        again.execute(item).await.unwrap();
        let jobs = fixture.queued();
        assert_eq!(jobs.iter().filter(|j| j.stage == "fetch").count(), 1);
    }

    #[tokio::test]
    async fn test_parse_store_rule_filters() {
        let fixture = Fixture::new(&PIPELINE.replace(
            "pagination = {",
            r#"store = { mime_group = "documents" }, pagination = {"#,
        ));
        let ctx = fixture.context("parse", false);
        let hash = ctx.store_data(PAGE.as_bytes()).unwrap();
        ctx.execute(data(json!({
            "url": "https://example.com/reports/",
            "status_code": 200,
            "content_hash": hash,
            "headers": {"content-type": "text/html"},
        })))
        .await
        .unwrap();
        assert!(fixture.queued().iter().all(|j| j.stage != "store"));
    }
}
