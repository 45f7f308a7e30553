//! Catalog source contracts + HTML and fixture-directory implementations.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use mapsnap_core::CatalogItem;
use mapsnap_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub const CRATE_NAME: &str = "mapsnap-adapters";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),
    #[error("download link missing for {0}")]
    LinkMissing(String),
    #[error("http status {status} for {url}")]
    FetchFailed { status: u16, url: String },
    #[error("{0}")]
    Other(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl From<FetchError> for SourceError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Status { status, url } => SourceError::FetchFailed { status, url },
            transport @ FetchError::Transport { .. } => SourceError::Other(transport.to_string()),
        }
    }
}

/// Upstream listing of downloadable items.
///
/// Implementations only talk to the outside world; classification of failures into item
/// outcomes happens in the collection run.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn list_catalog(&self) -> Result<Vec<CatalogItem>, SourceError>;

    async fn resolve_download_link(&self, item: &CatalogItem) -> Result<String, SourceError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError>;
}

/// Where and how the HTML catalog is scraped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSpec {
    pub listing_url: String,
    pub script_variable: String,
    pub item_url_template: String,
    pub download_link_selector: String,
    pub download_link_attr: String,
}

impl Default for CatalogSpec {
    fn default() -> Self {
        Self {
            listing_url: "https://zh-cn.ubisoft.com/r6s/maps".to_string(),
            script_variable: "maps".to_string(),
            item_url_template: "https://zh-cn.ubisoft.com/r6s/map?name={slug}".to_string(),
            download_link_selector: r#"a[data-innertext*="download blueprints"]"#.to_string(),
            download_link_attr: "href".to_string(),
        }
    }
}

impl CatalogSpec {
    pub fn item_url(&self, slug: &str) -> String {
        self.item_url_template.replace("{slug}", slug)
    }
}

/// One element of the listing page's embedded catalog array.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub url: String,
}

fn skip_ws(s: &str, from: usize) -> usize {
    s[from..]
        .char_indices()
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, _)| from + i)
        .unwrap_or(s.len())
}

/// Byte offset just past `<kw> <variable> =`, for any of `var`/`let`/`const`.
fn find_declaration(script: &str, variable: &str) -> Option<usize> {
    for kw in ["var", "let", "const"] {
        for (pos, _) in script.match_indices(kw) {
            let after_kw = pos + kw.len();
            let name_at = skip_ws(script, after_kw);
            if name_at == after_kw || !script[name_at..].starts_with(variable) {
                continue;
            }
            let eq_at = skip_ws(script, name_at + variable.len());
            if script[eq_at..].starts_with('=') {
                return Some(eq_at + 1);
            }
        }
    }
    None
}

/// Balanced `[...]` literal assigned to `variable` inside a script body.
pub fn extract_array_literal<'a>(script: &'a str, variable: &str) -> Option<&'a str> {
    let value_at = find_declaration(script, variable)?;
    let open = skip_ws(script, value_at);
    let body = &script[open..];
    if !body.starts_with('[') {
        return None;
    }

    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, ch) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '[' | '{' => depth += 1,
            ']' | '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&body[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Rewrites a JS object literal into JSON: single-quoted strings, bare keys and trailing
/// commas are normalized. String contents are left alone.
pub fn loosen_js_literal(literal: &str) -> String {
    let chars: Vec<char> = literal.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(literal.len() + 16);
    let mut quote: Option<char> = None;
    let mut i = 0;

    while i < len {
        let ch = chars[i];
        if let Some(q) = quote {
            if ch == '\\' && i + 1 < len {
                let next = chars[i + 1];
                if next == '\'' {
                    out.push('\'');
                } else {
                    out.push('\\');
                    out.push(next);
                }
                i += 2;
                continue;
            }
            if ch == q {
                out.push('"');
                quote = None;
            } else if ch == '"' {
                out.push_str("\\\"");
            } else {
                out.push(ch);
            }
            i += 1;
            continue;
        }

        match ch {
            '"' | '\'' => {
                quote = Some(ch);
                out.push('"');
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < len && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < len && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < len && chars[j] == ':' {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
                continue;
            }
            ',' => {
                let mut j = i + 1;
                while j < len && chars[j].is_whitespace() {
                    j += 1;
                }
                if !(j < len && (chars[j] == ']' || chars[j] == '}')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
        i += 1;
    }
    out
}

/// Finds the catalog array embedded in the listing page's scripts.
pub fn parse_catalog_entries(html: &str, variable: &str) -> Result<Vec<CatalogEntry>, SourceError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse("script").map_err(|e| SourceError::Other(e.to_string()))?;

    for script in document.select(&sel) {
        let text = script.text().collect::<String>();
        let Some(literal) = extract_array_literal(&text, variable) else {
            continue;
        };
        return serde_json::from_str::<Vec<CatalogEntry>>(literal)
            .or_else(|_| serde_json::from_str(&loosen_js_literal(literal)))
            .map_err(|e| {
                SourceError::CatalogUnavailable(format!("parsing `{variable}` literal: {e}"))
            });
    }

    Err(SourceError::CatalogUnavailable(format!(
        "no `{variable}` catalog variable found in listing page"
    )))
}

/// First matching link attribute on a detail page, resolved against the page URL.
pub fn select_download_link(
    html: &str,
    selector: &str,
    attr: &str,
    page_url: &str,
) -> Result<Option<String>, SourceError> {
    let document = Html::parse_document(html);
    let sel = Selector::parse(selector).map_err(|e| SourceError::Other(e.to_string()))?;
    let Some(href) = document
        .select(&sel)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(str::trim)
        .filter(|s| !s.is_empty())
    else {
        return Ok(None);
    };

    let resolved = Url::parse(page_url)
        .and_then(|base| base.join(href))
        .map_err(|e| SourceError::Other(format!("resolving link {href}: {e}")))?;
    Ok(Some(resolved.to_string()))
}

/// Scrapes the catalog out of static listing/detail pages over HTTP.
#[derive(Debug)]
pub struct HtmlCatalogSource {
    spec: CatalogSpec,
    http: HttpFetcher,
}

impl HtmlCatalogSource {
    pub fn new(spec: CatalogSpec, http: HttpFetcher) -> Self {
        Self { spec, http }
    }
}

#[async_trait]
impl CatalogSource for HtmlCatalogSource {
    fn source_id(&self) -> &str {
        &self.spec.listing_url
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogItem>, SourceError> {
        let page = self
            .http
            .fetch_bytes(&self.spec.listing_url)
            .await
            .map_err(|e| SourceError::CatalogUnavailable(e.to_string()))?;
        let html = String::from_utf8_lossy(&page.body);
        let entries = parse_catalog_entries(&html, &self.spec.script_variable)?;
        debug!(items = entries.len(), "parsed catalog listing");
        Ok(entries
            .into_iter()
            .map(|entry| CatalogItem::new(entry.name, self.spec.item_url(&entry.url)))
            .collect())
    }

    async fn resolve_download_link(&self, item: &CatalogItem) -> Result<String, SourceError> {
        let page = self.http.fetch_bytes(&item.source_url).await?;
        let html = String::from_utf8_lossy(&page.body);
        select_download_link(
            &html,
            &self.spec.download_link_selector,
            &self.spec.download_link_attr,
            &page.final_url,
        )?
        .ok_or_else(|| SourceError::LinkMissing(item.name.clone()))
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        Ok(self.http.fetch_bytes(url).await?.body)
    }
}

/// Offline catalog backed by a directory of `<name>.zip` files.
#[derive(Debug, Clone)]
pub struct FixtureCatalogSource {
    dir: PathBuf,
}

impl FixtureCatalogSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl CatalogSource for FixtureCatalogSource {
    fn source_id(&self) -> &str {
        "fixture-dir"
    }

    async fn list_catalog(&self) -> Result<Vec<CatalogItem>, SourceError> {
        let mut read_dir = fs::read_dir(&self.dir).await.map_err(|e| {
            SourceError::CatalogUnavailable(format!("reading {}: {e}", self.dir.display()))
        })?;

        let mut items = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| SourceError::CatalogUnavailable(e.to_string()))?
        {
            let path = entry.path();
            let is_zip = path
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false);
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().into_owned()) else {
                continue;
            };
            if is_zip {
                items.push(CatalogItem::new(stem, path.display().to_string()));
            }
        }
        items.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(items)
    }

    async fn resolve_download_link(&self, item: &CatalogItem) -> Result<String, SourceError> {
        if item.source_url.trim().is_empty() {
            return Err(SourceError::LinkMissing(item.name.clone()));
        }
        Ok(item.source_url.clone())
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, SourceError> {
        match fs::read(url).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(SourceError::FetchFailed {
                status: 404,
                url: url.to_string(),
            }),
            Err(err) => Err(SourceError::Other(format!("reading {url}: {err}"))),
        }
    }
}
