// SPDX-License-Identifier: MIT

//! Precedent search
//!
//! The model first turns the FIR into a search plan, the case search
//! backend is queried (with substance-based fallbacks when nothing comes
//! back) and every hit is summarised and scored for relevance.

use async_trait::async_trait;
use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::{render_template, schema_of};
use crate::backend::error::{BackendError, TaskError};
use crate::backend::model::{GenerationBackend, GenerationConfig, GenerationRequest};
use crate::backend::retry::RetryPolicy;
use crate::backend::search::{CaseHit, CaseSearch, SearchOptions};
use crate::casefile::workflow::state::{StateUpdate, StateView};
use crate::casefile::workflow::task::TaskUnit;
use crate::casefile::workflow::types::TaskDefinition;

const PLAN_INSTRUCTIONS: &str = "You prepare searches of Indian case law. From the FIR, \
identify the narcotic substance and write a short search query for bail judgments in \
similar NDPS cases.";

const PLAN_PROMPT: &str = "{{document_text}}";

const SUMMARY_INSTRUCTIONS: &str = "Summarise the judgment for a lawyer handling the FIR below. \
Give the case number and year if stated and rate its relevance from 0 to 10.";

/// Judgment text sent for summarisation is cut to this many characters
const MAX_JUDGMENT_CHARS: usize = 12_000;

const REQUIRED_KEYWORD: &str = "BAIL";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SearchPlan {
    pub search_query: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Narcotic substance named in the FIR
    #[serde(default)]
    pub substance: String,
}

impl SearchPlan {
    fn ensure_bail(&mut self) {
        if !self
            .keywords
            .iter()
            .any(|k| k.eq_ignore_ascii_case(REQUIRED_KEYWORD))
        {
            self.keywords.push(REQUIRED_KEYWORD.to_string());
        }
    }

    fn query(&self) -> String {
        let mut parts = vec![self.search_query.trim().to_string()];
        let lower = self.search_query.to_lowercase();
        parts.extend(
            self.keywords
                .iter()
                .filter(|k| !lower.contains(&k.to_lowercase()))
                .cloned(),
        );
        parts.retain(|p| !p.is_empty());
        parts.join(" ")
    }

    fn fallback_queries(&self) -> Vec<String> {
        let substance = self.substance.trim();
        if substance.is_empty() {
            return Vec::new();
        }
        vec![
            format!("{} NDPS bail", substance),
            format!("{} NDPS", substance),
            format!("NDPS {}", substance),
        ]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CaseSummary {
    pub summary: String,
    #[serde(default)]
    pub case_number: String,
    #[serde(default)]
    pub year: String,
    /// 0 to 10
    #[serde(default)]
    pub relevancy_score: u8,
}

pub struct HistoricalCasesTask {
    definition: TaskDefinition,
    generation: Arc<dyn GenerationBackend>,
    search: Option<Arc<dyn CaseSearch>>,
    retry: RetryPolicy,
    config: GenerationConfig,
}

impl HistoricalCasesTask {
    pub fn new(
        definition: TaskDefinition,
        generation: Arc<dyn GenerationBackend>,
        search: Option<Arc<dyn CaseSearch>>,
        retry: RetryPolicy,
        config: GenerationConfig,
    ) -> Self {
        Self {
            definition,
            generation,
            search,
            retry,
            config,
        }
    }

    async fn plan(&self, input: &StateView) -> Result<SearchPlan, TaskError> {
        let template = self.definition.prompt.as_deref().unwrap_or(PLAN_PROMPT);
        let prompt = render_template(template, input, &HashMap::new())?;
        let instructions = self
            .definition
            .instructions
            .as_deref()
            .unwrap_or(PLAN_INSTRUCTIONS);

        let request = GenerationRequest::new(prompt)
            .with_instructions(instructions)
            .with_schema("search_plan", schema_of::<SearchPlan>())
            .with_config(self.config.clone());

        let label = format!("{} planning", self.definition.name);
        let result = self
            .retry
            .execute(&label, || self.generation.generate(&request))
            .await?;

        let mut plan: SearchPlan = serde_json::from_value(result)
            .map_err(|e| TaskError::MalformedOutput(format!("search plan: {}", e)))?;
        plan.ensure_bail();
        Ok(plan)
    }

    async fn find(
        &self,
        search: &dyn CaseSearch,
        plan: &SearchPlan,
        options: &SearchOptions,
    ) -> Result<Vec<CaseHit>, TaskError> {
        let mut queries = vec![plan.query()];
        queries.extend(plan.fallback_queries());

        for (i, query) in queries.iter().enumerate() {
            let label = format!("{} search", self.definition.name);
            let hits = self
                .retry
                .execute(&label, || search.search(query, options))
                .await?;
            if !hits.is_empty() {
                log::info!("Case search '{}' returned {} hits", query, hits.len());
                return Ok(hits);
            }
            if i + 1 < queries.len() {
                log::info!("No cases for '{}', trying fallback", query);
            }
        }
        Ok(Vec::new())
    }

    async fn summarise(&self, search: &dyn CaseSearch, hit: &CaseHit, facts: &str) -> Value {
        let label = format!("fetch of judgment {}", hit.id);
        let judgment = match self
            .retry
            .execute(&label, || search.fetch_document(&hit.id))
            .await
        {
            Ok(Some(text)) => text.chars().take(MAX_JUDGMENT_CHARS).collect(),
            Ok(None) => hit.snippet.clone(),
            Err(e) => {
                log::warn!("Using snippet for judgment {}: {}", hit.id, e);
                hit.snippet.clone()
            }
        };

        let request = GenerationRequest::new(format!(
            "## FIR\n{}\n\n## Judgment: {}\n{}",
            facts, hit.title, judgment
        ))
        .with_instructions(SUMMARY_INSTRUCTIONS)
        .with_schema("case_summary", schema_of::<CaseSummary>())
        .with_config(self.config.clone());

        let label = format!("summary of {}", hit.id);
        let summary = match self
            .retry
            .execute(&label, || self.generation.generate(&request))
            .await
        {
            Ok(value) => CaseSummary::from_reply(value).unwrap_or_else(|e| {
                log::warn!("Unusable summary for {}: {}", hit.id, e);
                CaseSummary::fallback(hit)
            }),
            Err(e) => {
                log::warn!("{}", e);
                CaseSummary::fallback(hit)
            }
        };

        json!({
            "title": hit.title,
            "url": hit.url,
            "summary": summary.summary,
            "case_number": summary.case_number,
            "year": summary.year,
            "relevancy_score": summary.relevancy_score.min(10),
        })
    }
}

impl CaseSummary {
    fn fallback(hit: &CaseHit) -> Self {
        Self {
            summary: hit.snippet.clone(),
            ..Default::default()
        }
    }

    /// Models answer `7.5`, `"8"` or `12` as often as `7`
    fn from_reply(mut value: Value) -> Result<Self, serde_json::Error> {
        if let Some(score) = value.get_mut("relevancy_score") {
            *score = json!(lenient_score(score));
        }
        serde_json::from_value(value)
    }
}

/// Any numeric reading of the score, rounded and clamped to 0..=10
fn lenient_score(value: &Value) -> u8 {
    let score = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match score {
        Some(s) if s.is_finite() => s.clamp(0.0, 10.0).round() as u8,
        _ => 0,
    }
}

#[async_trait]
impl TaskUnit for HistoricalCasesTask {
    fn name(&self) -> &str {
        &self.definition.name
    }

    async fn run(&self, input: &StateView) -> Result<StateUpdate, TaskError> {
        let field = self
            .definition
            .produces
            .first()
            .ok_or_else(|| TaskError::MalformedOutput("no output field declared".into()))?;
        let search = self
            .search
            .as_deref()
            .ok_or_else(|| BackendError::ApiKeyMissing("indian_kanoon".into()))?;
        let options = self.definition.search.clone().unwrap_or_default();

        let plan = self.plan(input).await?;
        log::info!("Case search plan: {:?}", plan);

        let mut seen = HashSet::new();
        let mut hits = self.find(search, &plan, &options).await?;
        hits.retain(|h| seen.insert(h.id.clone()));
        hits.truncate(options.max_results);

        let facts = input.get_str("document_text").unwrap_or_default();
        let mut cases = join_all(hits.iter().map(|hit| self.summarise(search, hit, facts))).await;
        cases.sort_by_key(|c| std::cmp::Reverse(c["relevancy_score"].as_u64().unwrap_or(0)));

        Ok(StateUpdate::from([(field.clone(), Value::Array(cases))]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers plan requests with `plan` and summary requests from `scores`
    struct MockModel {
        plan: Value,
        scores: HashMap<String, u8>,
        fail_summaries: bool,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GenerationBackend for MockModel {
        async fn generate(&self, request: &GenerationRequest) -> Result<Value, BackendError> {
            match request.schema_name.as_deref() {
                Some("search_plan") => Ok(self.plan.clone()),
                Some("case_summary") => {
                    self.prompts.lock().unwrap().push(request.prompt.clone());
                    if self.fail_summaries {
                        return Err(BackendError::api("mock", "overloaded"));
                    }
                    let score = self
                        .scores
                        .iter()
                        .find(|(title, _)| request.prompt.contains(title.as_str()))
                        .map(|(_, s)| *s)
                        .unwrap_or(1);
                    Ok(json!({"summary": "bail granted", "case_number": "BA 1/2020", "year": "2020", "relevancy_score": score}))
                }
                _ => Err(BackendError::InvalidResponse("unexpected request".into())),
            }
        }
    }

    struct MockSearch {
        results: HashMap<String, Vec<CaseHit>>,
        queries: Mutex<Vec<String>>,
        calls: AtomicUsize,
        documents: HashMap<String, String>,
        /// Fetches that fail before documents are served
        fetch_failures: AtomicUsize,
        fetches: AtomicUsize,
    }

    impl MockSearch {
        fn new(results: HashMap<String, Vec<CaseHit>>) -> Self {
            Self {
                results,
                queries: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                documents: HashMap::new(),
                fetch_failures: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CaseSearch for MockSearch {
        async fn search(
            &self,
            query: &str,
            _options: &SearchOptions,
        ) -> Result<Vec<CaseHit>, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.queries.lock().unwrap().push(query.to_string());
            Ok(self.results.get(query).cloned().unwrap_or_default())
        }

        async fn fetch_document(&self, id: &str) -> Result<Option<String>, BackendError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let failing = self
                .fetch_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BackendError::api("mock", "503 Service Unavailable"));
            }
            Ok(self.documents.get(id).cloned())
        }
    }

    fn hit(id: &str, title: &str) -> CaseHit {
        CaseHit {
            id: id.into(),
            title: title.into(),
            url: format!("https://indiankanoon.org/doc/{}/", id),
            snippet: format!("snippet of {}", title),
            source: None,
        }
    }

    fn definition(max_results: usize) -> TaskDefinition {
        let mut def: TaskDefinition = serde_yaml::from_str(
            "name: historical_cases\nkind: case_search\nrequires: [document_text]\nproduces: [historical_cases]",
        )
        .unwrap();
        def.search = Some(SearchOptions {
            max_results,
            ..Default::default()
        });
        def
    }

    fn input() -> StateView {
        StateView::from_iter([("document_text", json!("2kg ganja seized"))])
    }

    #[test]
    fn test_plan_adds_bail_and_builds_query() {
        let mut plan = SearchPlan {
            search_query: "ganja commercial quantity".into(),
            keywords: vec!["ganja".into()],
            substance: "Ganja".into(),
        };
        plan.ensure_bail();
        assert_eq!(plan.keywords, vec!["ganja", "BAIL"]);
        assert_eq!(plan.query(), "ganja commercial quantity BAIL");
        assert_eq!(plan.fallback_queries()[0], "Ganja NDPS bail");

        plan.ensure_bail();
        assert_eq!(plan.keywords.len(), 2);
    }

    #[tokio::test]
    async fn test_fallback_dedupe_limit_and_sort() {
        let model = MockModel {
            plan: json!({"search_query": "heroin", "keywords": [], "substance": "Heroin"}),
            scores: HashMap::from([("Case B".to_string(), 9), ("Case A".to_string(), 4)]),
            fail_summaries: false,
            prompts: Mutex::new(Vec::new()),
        };
        let search = Arc::new(MockSearch::new(HashMap::from([(
            "Heroin NDPS bail".to_string(),
            vec![
                hit("1", "Case A"),
                hit("1", "Case A"),
                hit("2", "Case B"),
                hit("3", "Case C"),
            ],
        )])));
        let task = HistoricalCasesTask::new(
            definition(2),
            Arc::new(model),
            Some(search.clone()),
            RetryPolicy::no_retry(),
            GenerationConfig::default(),
        );

        let update = task.run(&input()).await.unwrap();
        let cases = update["historical_cases"].as_array().unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0]["title"], json!("Case B"));
        assert_eq!(cases[0]["relevancy_score"], json!(9));
        assert_eq!(cases[1]["title"], json!("Case A"));

        assert_eq!(
            *search.queries.lock().unwrap(),
            vec!["heroin BAIL", "Heroin NDPS bail"]
        );
    }

    #[tokio::test]
    async fn test_failed_summary_keeps_snippet() {
        let model = MockModel {
            plan: json!({"search_query": "ganja bail", "keywords": ["BAIL"], "substance": ""}),
            scores: HashMap::new(),
            fail_summaries: true,
            prompts: Mutex::new(Vec::new()),
        };
        let search = Arc::new(MockSearch::new(HashMap::from([(
            "ganja bail".to_string(),
            vec![hit("7", "Case G")],
        )])));
        let task = HistoricalCasesTask::new(
            definition(6),
            Arc::new(model),
            Some(search),
            RetryPolicy::no_retry(),
            GenerationConfig::default(),
        );

        let update = task.run(&input()).await.unwrap();
        let case = &update["historical_cases"][0];
        assert_eq!(case["summary"], json!("snippet of Case G"));
        assert_eq!(case["relevancy_score"], json!(0));
    }

    #[tokio::test]
    async fn test_no_results_after_fallbacks() {
        let model = MockModel {
            plan: json!({"search_query": "opium", "keywords": ["bail"], "substance": "Opium"}),
            scores: HashMap::new(),
            fail_summaries: false,
            prompts: Mutex::new(Vec::new()),
        };
        let search = Arc::new(MockSearch::new(HashMap::new()));
        let task = HistoricalCasesTask::new(
            definition(6),
            Arc::new(model),
            Some(search.clone()),
            RetryPolicy::no_retry(),
            GenerationConfig::default(),
        );

        let update = task.run(&input()).await.unwrap();
        assert_eq!(update["historical_cases"], json!([]));
        assert_eq!(search.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_judgment_fetch_is_retried() {
        let model = Arc::new(MockModel {
            plan: json!({"search_query": "ganja bail", "keywords": ["BAIL"], "substance": ""}),
            scores: HashMap::new(),
            fail_summaries: false,
            prompts: Mutex::new(Vec::new()),
        });
        let mut search = MockSearch::new(HashMap::from([(
            "ganja bail".to_string(),
            vec![hit("7", "Case G")],
        )]));
        search
            .documents
            .insert("7".into(), "full judgment: bail granted under section 37".into());
        search.fetch_failures.store(1, Ordering::SeqCst);
        let search = Arc::new(search);
        let task = HistoricalCasesTask::new(
            definition(6),
            model.clone(),
            Some(search.clone()),
            RetryPolicy::new(3, Duration::from_secs(60)),
            GenerationConfig::default(),
        );

        let update = task.run(&input()).await.unwrap();
        assert_eq!(update["historical_cases"][0]["relevancy_score"], json!(1));
        assert_eq!(search.fetches.load(Ordering::SeqCst), 2);
        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("full judgment: bail granted under section 37"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_judgment_fetch_falls_back_to_snippet() {
        let model = Arc::new(MockModel {
            plan: json!({"search_query": "ganja bail", "keywords": ["BAIL"], "substance": ""}),
            scores: HashMap::new(),
            fail_summaries: false,
            prompts: Mutex::new(Vec::new()),
        });
        let search = MockSearch::new(HashMap::from([(
            "ganja bail".to_string(),
            vec![hit("7", "Case G")],
        )]));
        search.fetch_failures.store(10, Ordering::SeqCst);
        let search = Arc::new(search);
        let task = HistoricalCasesTask::new(
            definition(6),
            model.clone(),
            Some(search.clone()),
            RetryPolicy::new(2, Duration::from_secs(60)),
            GenerationConfig::default(),
        );

        task.run(&input()).await.unwrap();
        assert_eq!(search.fetches.load(Ordering::SeqCst), 2);
        assert!(model.prompts.lock().unwrap()[0].contains("snippet of Case G"));
    }

    #[test]
    fn test_relevancy_score_is_lenient() {
        let parse = |score: Value| {
            CaseSummary::from_reply(json!({"summary": "s", "year": "2021", "relevancy_score": score}))
                .unwrap()
                .relevancy_score
        };
        assert_eq!(parse(json!(7.5)), 8);
        assert_eq!(parse(json!("8")), 8);
        assert_eq!(parse(json!(14)), 10);
        assert_eq!(parse(json!(-2)), 0);
        assert_eq!(parse(json!("high")), 0);

        let missing = CaseSummary::from_reply(json!({"summary": "s", "year": "2021"})).unwrap();
        assert_eq!(missing.relevancy_score, 0);
    }

    #[tokio::test]
    async fn test_missing_search_backend() {
        let task = HistoricalCasesTask::new(
            definition(6),
            Arc::new(MockModel {
                plan: json!({}),
                scores: HashMap::new(),
                fail_summaries: false,
                prompts: Mutex::new(Vec::new()),
            }),
            None,
            RetryPolicy::no_retry(),
            GenerationConfig::default(),
        );
        let err = task.run(&input()).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::Backend(BackendError::ApiKeyMissing(_))
        ));
    }
}
