// SPDX-License-Identifier: MIT

//! Case-law search backend
//!
//! [`CaseSearch`] is the narrow interface the historical-cases task uses.
//! [`KanoonSearch`] talks to the Indian Kanoon API: searches are `POST
//! /search/` with the query in the URL, full documents come from `POST
//! /doc/{id}/`.

use crate::backend::error::BackendError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::env;
use std::future::Future;

const KANOON_API: &str = "https://api.indiankanoon.org";
const KANOON_PUBLIC: &str = "https://indiankanoon.org";

/// Documents larger than this are skipped
const MAX_DOC_SIZE: u64 = 500_000;

/// Result pages requested per query before giving up on `max_results`
const MAX_SEARCH_PAGES: usize = 3;

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Filters applied to a case search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchOptions {
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Words that must appear in the judgment title
    #[serde(default)]
    pub title_filter: Option<String>,
    /// Earliest judgment date, `DD-MM-YYYY`
    #[serde(default)]
    pub from_date: Option<String>,
}

fn default_max_results() -> usize {
    6
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            title_filter: None,
            from_date: None,
        }
    }
}

/// One judgment returned by a search
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaseHit {
    pub id: String,
    pub title: String,
    pub url: String,
    /// Highlighted excerpt with markup removed
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[async_trait]
pub trait CaseSearch: Send + Sync {
    /// Run a query, returning unique hits in ranking order
    async fn search(&self, query: &str, options: &SearchOptions)
        -> Result<Vec<CaseHit>, BackendError>;

    /// Full text of a judgment, if the backend can provide it
    async fn fetch_document(&self, _id: &str) -> Result<Option<String>, BackendError> {
        Ok(None)
    }
}

/// Strip markup and collapse whitespace
pub fn clean_html(text: &str) -> String {
    let stripped = HTML_TAG.replace_all(text, "");
    WHITESPACE.replace_all(&stripped, " ").trim().to_string()
}

pub struct KanoonSearch {
    client: Client,
    token: String,
    base_url: String,
}

impl KanoonSearch {
    /// Requires `INDIAN_KANOON_API_TOKEN` to be set
    pub fn new() -> Result<Self, BackendError> {
        let token = env::var("INDIAN_KANOON_API_TOKEN")
            .map_err(|_| BackendError::ApiKeyMissing("indian_kanoon".into()))?;
        Ok(Self::with_token(token))
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
            base_url: KANOON_API.to_string(),
        }
    }

    fn search_url(
        &self,
        query: &str,
        options: &SearchOptions,
        page: usize,
    ) -> Result<url::Url, BackendError> {
        let mut url = url::Url::parse(&format!("{}/search/", self.base_url))
            .map_err(|e| BackendError::InvalidResponse(format!("bad search url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("formInput", query)
            .append_pair("pagenum", &page.to_string())
            .append_pair("doctypes", "judgments,supremecourt,highcourts");

        if let Some(from) = &options.from_date {
            url.query_pairs_mut().append_pair("fromdate", from);
        }
        if let Some(title) = &options.title_filter {
            url.query_pairs_mut().append_pair("title", title);
        }
        Ok(url)
    }

    /// Add the new hits of one result page; returns how many docs the page had
    fn parse_hits(
        body: &Value,
        seen: &mut HashSet<String>,
        hits: &mut Vec<CaseHit>,
        max_results: usize,
    ) -> Result<usize, BackendError> {
        let docs = body
            .get("docs")
            .and_then(|d| d.as_array())
            .ok_or_else(|| BackendError::InvalidResponse("missing docs in search response".into()))?;

        for doc in docs {
            if hits.len() >= max_results {
                break;
            }
            let id = match &doc["tid"] {
                Value::Number(n) => n.to_string(),
                Value::String(s) => s.clone(),
                _ => continue,
            };
            if doc["docsize"].as_u64().unwrap_or(0) > MAX_DOC_SIZE {
                log::debug!("Skipping oversized judgment {}", id);
                continue;
            }
            if !seen.insert(id.clone()) {
                continue;
            }

            hits.push(CaseHit {
                url: format!("{}/doc/{}/", KANOON_PUBLIC, id),
                title: clean_html(doc["title"].as_str().unwrap_or("N/A")),
                snippet: clean_html(doc["headline"].as_str().unwrap_or_default()),
                source: doc["docsource"].as_str().map(str::to_string),
                id,
            });
        }

        Ok(docs.len())
    }

    /// Page through results until `max_results` unique hits, an empty page
    /// or the page limit
    async fn collect_pages<F, Fut>(
        max_results: usize,
        mut fetch_page: F,
    ) -> Result<Vec<CaseHit>, BackendError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<Value, BackendError>>,
    {
        let mut seen = HashSet::new();
        let mut hits = Vec::new();

        for page in 0..MAX_SEARCH_PAGES {
            let body = fetch_page(page).await?;
            let docs = Self::parse_hits(&body, &mut seen, &mut hits, max_results)?;
            if docs == 0 {
                log::debug!("No more results at page {}", page);
                break;
            }
            if hits.len() >= max_results {
                break;
            }
        }

        Ok(hits)
    }

    async fn search_page(
        &self,
        query: &str,
        options: &SearchOptions,
        page: usize,
    ) -> Result<Value, BackendError> {
        let url = self.search_url(query, options, page)?;
        log::debug!("Case search: {}", url);

        let resp = self
            .client
            .post(url)
            .header("Accept", "application/json")
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(BackendError::api(
                "indian_kanoon",
                format!("{}: {}", status, text),
            ));
        }

        Ok(resp.json().await?)
    }
}

#[async_trait]
impl CaseSearch for KanoonSearch {
    async fn search(
        &self,
        query: &str,
        options: &SearchOptions,
    ) -> Result<Vec<CaseHit>, BackendError> {
        Self::collect_pages(options.max_results, |page| {
            self.search_page(query, options, page)
        })
        .await
    }

    async fn fetch_document(&self, id: &str) -> Result<Option<String>, BackendError> {
        let resp = self
            .client
            .post(format!("{}/doc/{}/", self.base_url, id))
            .header("Accept", "application/json")
            .header("Authorization", format!("Token {}", self.token))
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await?;
            return Err(BackendError::api(
                "indian_kanoon",
                format!("{}: {}", status, text),
            ));
        }

        let body: Value = resp.json().await?;
        Ok(body["doc"]
            .as_str()
            .map(clean_html)
            .filter(|text| !text.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_clean_html() {
        assert_eq!(
            clean_html("<b>State</b>  vs\n <i>Ram</i> "),
            "State vs Ram"
        );
        assert_eq!(clean_html(""), "");
    }

    #[test]
    fn test_search_url_carries_filters() {
        let search = KanoonSearch::with_token("t");
        let url = search
            .search_url(
                "Ganja NDPS bail",
                &SearchOptions {
                    max_results: 6,
                    title_filter: Some("NDPS".into()),
                    from_date: Some("01-01-2010".into()),
                },
                1,
            )
            .unwrap();

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("formInput".into(), "Ganja NDPS bail".into())));
        assert!(pairs.contains(&("fromdate".into(), "01-01-2010".into())));
        assert!(pairs.contains(&("title".into(), "NDPS".into())));
        assert!(pairs.contains(&("pagenum".into(), "1".into())));
        assert!(url.as_str().starts_with("https://api.indiankanoon.org/search/?"));
    }

    #[test]
    fn test_parse_hits_dedupes_and_limits() {
        let body = json!({
            "docs": [
                {"tid": 11, "title": "A <b>vs</b> B", "headline": "held <em>bail</em>"},
                {"tid": 11, "title": "A vs B duplicate"},
                {"tid": 12, "title": "Too big", "docsize": 900000},
                {"tid": "13", "title": "C vs D"},
                {"tid": 14, "title": "E vs F"}
            ]
        });

        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        let docs = KanoonSearch::parse_hits(&body, &mut seen, &mut hits, 2).unwrap();
        assert_eq!(docs, 5);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "11");
        assert_eq!(hits[0].title, "A vs B");
        assert_eq!(hits[0].snippet, "held bail");
        assert_eq!(hits[0].url, "https://indiankanoon.org/doc/11/");
        assert_eq!(hits[1].id, "13");
    }

    #[test]
    fn test_parse_hits_requires_docs() {
        let err = KanoonSearch::parse_hits(
            &json!({"errmsg": "bad"}),
            &mut HashSet::new(),
            &mut Vec::new(),
            6,
        )
        .unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    fn page(ids: &[u64]) -> Value {
        let docs: Vec<Value> = ids
            .iter()
            .map(|id| json!({"tid": id, "title": format!("Case {}", id)}))
            .collect();
        json!({ "docs": docs })
    }

    #[tokio::test]
    async fn test_pages_until_enough_unique_hits() {
        let requested = std::sync::Mutex::new(Vec::new());
        let hits = KanoonSearch::collect_pages(4, |n| {
            requested.lock().unwrap().push(n);
            let body = match n {
                0 => page(&[1, 2, 2]),
                1 => page(&[2, 3, 4, 5]),
                _ => page(&[6]),
            };
            async move { Ok(body) }
        })
        .await
        .unwrap();

        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["1", "2", "3", "4"]);
        assert_eq!(*requested.lock().unwrap(), [0, 1]);
    }

    #[tokio::test]
    async fn test_paging_stops_at_empty_page_and_limit() {
        let calls = std::sync::atomic::AtomicUsize::new(0);
        let hits = KanoonSearch::collect_pages(6, |n| {
            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let body = if n == 0 { page(&[1]) } else { page(&[]) };
            async move { Ok(body) }
        })
        .await
        .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);

        let hits = KanoonSearch::collect_pages(10, |n| {
            let body = page(&[n as u64 * 10 + 1]);
            async move { Ok(body) }
        })
        .await
        .unwrap();
        assert_eq!(hits.len(), MAX_SEARCH_PAGES);
    }
}
