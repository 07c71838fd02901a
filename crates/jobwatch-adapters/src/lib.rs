//! Extraction strategies, the fallback chain, and per-source adapters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use jobwatch_core::{
    normalize, resolve_id, Job, KeyProbes, LinkRules, RawRecord, StrategyOutcome, TitleFilter,
};
use jobwatch_storage::{SnapshotStore, Transport};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "jobwatch-adapters";

/// Everything the chain needs to know about one provider: where to ask,
/// what the raw records look like, and how to build links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub source_id: String,
    pub display_name: String,
    /// Structured JSON endpoint, when the provider exposes one.
    pub endpoint_url: Option<String>,
    /// Query parameters for the endpoint, echoed onto the listing URL for
    /// the page-based strategies.
    pub query: Vec<(String, String)>,
    /// Listing page used by the capture, DOM and script-mining strategies.
    pub listing_url: String,
    /// URL substrings that mark a background response as a search payload.
    pub capture_needles: Vec<String>,
    /// Candidate card selectors, most specific first.
    pub card_selectors: Vec<String>,
    pub card_rules: CardRules,
    pub probes: KeyProbes,
    pub links: LinkRules,
    #[serde(default)]
    pub title_filter: TitleFilter,
}

impl SourceSpec {
    /// Listing URL with the query string appended. Values are interpolated
    /// the way the provider UIs accept them, spaces as `+`.
    pub fn listing_url_with_query(&self) -> String {
        if self.query.is_empty() {
            return self.listing_url.clone();
        }
        let qs = self
            .query
            .iter()
            .map(|(key, value)| format!("{key}={}", value.replace(' ', "+")))
            .collect::<Vec<_>>()
            .join("&");
        format!("{}?{}", self.listing_url, qs)
    }
}

/// How to read one DOM card fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardRules {
    /// Tried in order for the card title.
    pub title_selectors: Vec<String>,
    pub link_selector: String,
    /// Zero-based index into the card's non-empty text lines where the
    /// location usually sits (the title is typically line zero).
    pub location_line: usize,
}

impl Default for CardRules {
    fn default() -> Self {
        Self {
            title_selectors: vec!["h3".to_string(), "h2".to_string()],
            link_selector: "a".to_string(),
            location_line: 1,
        }
    }
}

/// One rung of the fallback ladder. Implementations must never panic and
/// must express every failure as [`StrategyOutcome::Failed`].
#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn extract(&self, transport: &dyn Transport, spec: &SourceSpec) -> StrategyOutcome;
}

/// Strategy 1: ask the provider's structured JSON endpoint directly.
pub struct EndpointQuery;

#[async_trait]
impl ExtractionStrategy for EndpointQuery {
    fn name(&self) -> &'static str {
        "endpoint"
    }

    async fn extract(&self, transport: &dyn Transport, spec: &SourceSpec) -> StrategyOutcome {
        let Some(endpoint) = &spec.endpoint_url else {
            return StrategyOutcome::Failed("source has no structured endpoint".to_string());
        };
        match transport.fetch_json(endpoint, &spec.query).await {
            Ok(payload) => {
                let records = dedup_by_id(records_from_payload(&payload), &spec.probes);
                if records.is_empty() {
                    StrategyOutcome::Empty
                } else {
                    StrategyOutcome::Records(records)
                }
            }
            Err(err) => StrategyOutcome::Failed(err.to_string()),
        }
    }
}

/// Strategy 2: load the listing page and read the background search
/// payloads it triggers.
pub struct CapturedResponses;

#[async_trait]
impl ExtractionStrategy for CapturedResponses {
    fn name(&self) -> &'static str {
        "capture"
    }

    async fn extract(&self, transport: &dyn Transport, spec: &SourceSpec) -> StrategyOutcome {
        let url = spec.listing_url_with_query();
        match transport.capture_responses(&url, &spec.capture_needles).await {
            Ok(payloads) => {
                let records: Vec<RawRecord> = payloads
                    .iter()
                    .flat_map(records_from_payload)
                    .collect();
                let records = dedup_by_id(records, &spec.probes);
                if records.is_empty() {
                    StrategyOutcome::Empty
                } else {
                    StrategyOutcome::Records(records)
                }
            }
            Err(err) => StrategyOutcome::Failed(err.to_string()),
        }
    }
}

/// Strategy 3: scrape job cards out of the listing DOM.
pub struct DomScrape;

#[async_trait]
impl ExtractionStrategy for DomScrape {
    fn name(&self) -> &'static str {
        "dom"
    }

    async fn extract(&self, transport: &dyn Transport, spec: &SourceSpec) -> StrategyOutcome {
        let url = spec.listing_url_with_query();
        match transport.select_fragments(&url, &spec.card_selectors).await {
            Ok(fragments) => {
                let records: Vec<RawRecord> = fragments
                    .iter()
                    .filter_map(|fragment| {
                        card_to_record(fragment, &spec.card_rules, &spec.links)
                    })
                    .collect();
                let records = dedup_by_id(records, &spec.probes);
                if records.is_empty() {
                    StrategyOutcome::Empty
                } else {
                    StrategyOutcome::Records(records)
                }
            }
            Err(err) => StrategyOutcome::Failed(err.to_string()),
        }
    }
}

/// Strategy 4: mine JSON object literals out of the page's script tags.
pub struct ScriptMine;

#[async_trait]
impl ExtractionStrategy for ScriptMine {
    fn name(&self) -> &'static str {
        "script-mine"
    }

    async fn extract(&self, transport: &dyn Transport, spec: &SourceSpec) -> StrategyOutcome {
        let url = spec.listing_url_with_query();
        let script_selector = vec!["script".to_string()];
        match transport.select_fragments(&url, &script_selector).await {
            Ok(fragments) => {
                let mut records: Vec<RawRecord> = Vec::new();
                for fragment in &fragments {
                    for value in mine_json_objects(fragment) {
                        let from_payload = records_from_payload(&value);
                        if !from_payload.is_empty() {
                            records.extend(from_payload);
                        } else if let Some(map) = value.as_object() {
                            if looks_like_job(map, &spec.probes) {
                                records.push(map.clone());
                            }
                        }
                    }
                }
                let records = dedup_by_id(records, &spec.probes);
                if records.is_empty() {
                    StrategyOutcome::Empty
                } else {
                    StrategyOutcome::Records(records)
                }
            }
            Err(err) => StrategyOutcome::Failed(err.to_string()),
        }
    }
}

/// Result of a full chain pass: the normalized jobs plus the raw records
/// behind them, kept so the caller can archive the winning payload.
pub struct ChainResult {
    pub jobs: Vec<Job>,
    pub winning_strategy: Option<&'static str>,
    pub raw_records: Vec<RawRecord>,
}

/// Ordered fallback chain over extraction strategies.
///
/// Strategies run strictly in order and the chain stops at the first one
/// whose records normalize to at least one job. Failures and empty results
/// fall through silently; a chain where every rung misses yields an empty
/// result, which is a valid "no jobs this run".
pub struct StrategyChain {
    strategies: Vec<Box<dyn ExtractionStrategy>>,
}

impl StrategyChain {
    pub fn new(strategies: Vec<Box<dyn ExtractionStrategy>>) -> Self {
        Self { strategies }
    }

    /// Cheapest-and-most-reliable first: endpoint, captured responses, DOM
    /// cards, script mining.
    pub fn standard() -> Self {
        Self::new(vec![
            Box::new(EndpointQuery),
            Box::new(CapturedResponses),
            Box::new(DomScrape),
            Box::new(ScriptMine),
        ])
    }

    pub async fn run(&self, transport: &dyn Transport, spec: &SourceSpec) -> ChainResult {
        for strategy in &self.strategies {
            match strategy.extract(transport, spec).await {
                StrategyOutcome::Failed(reason) => {
                    warn!(
                        source_id = spec.source_id.as_str(),
                        strategy = strategy.name(),
                        reason,
                        "strategy failed, falling through"
                    );
                }
                StrategyOutcome::Empty => {
                    debug!(
                        source_id = spec.source_id.as_str(),
                        strategy = strategy.name(),
                        "strategy found nothing, falling through"
                    );
                }
                StrategyOutcome::Records(records) => {
                    let jobs: Vec<Job> = records
                        .iter()
                        .filter_map(|record| normalize(record, &spec.probes, &spec.links))
                        .collect();
                    if jobs.is_empty() {
                        debug!(
                            source_id = spec.source_id.as_str(),
                            strategy = strategy.name(),
                            records = records.len(),
                            "records did not normalize, falling through"
                        );
                        continue;
                    }
                    debug!(
                        source_id = spec.source_id.as_str(),
                        strategy = strategy.name(),
                        jobs = jobs.len(),
                        "strategy produced jobs"
                    );
                    return ChainResult {
                        jobs,
                        winning_strategy: Some(strategy.name()),
                        raw_records: records,
                    };
                }
            }
        }
        ChainResult {
            jobs: Vec::new(),
            winning_strategy: None,
            raw_records: Vec::new(),
        }
    }
}

/// A source of canonical jobs. One implementation per provider plus fakes
/// in tests; calls are idempotent and never fail, a source that cannot
/// produce anything this run returns an empty list.
#[async_trait]
pub trait JobSource: Send + Sync {
    fn source_id(&self) -> &str;
    fn display_name(&self) -> &str;
    async fn fetch(&self) -> Vec<Job>;
}

/// Binds a [`SourceSpec`] to the strategy chain and a transport.
pub struct SourceAdapter {
    spec: SourceSpec,
    chain: StrategyChain,
    transport: Arc<dyn Transport>,
    snapshots: Option<SnapshotStore>,
}

impl SourceAdapter {
    pub fn new(spec: SourceSpec, transport: Arc<dyn Transport>) -> Self {
        Self {
            spec,
            chain: StrategyChain::standard(),
            transport,
            snapshots: None,
        }
    }

    pub fn with_chain(mut self, chain: StrategyChain) -> Self {
        self.chain = chain;
        self
    }

    /// Archive the winning raw payload of each fetch for post-mortems.
    pub fn with_snapshots(mut self, store: SnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    pub fn spec(&self) -> &SourceSpec {
        &self.spec
    }
}

#[async_trait]
impl JobSource for SourceAdapter {
    fn source_id(&self) -> &str {
        &self.spec.source_id
    }

    fn display_name(&self) -> &str {
        &self.spec.display_name
    }

    async fn fetch(&self) -> Vec<Job> {
        let result = self.chain.run(self.transport.as_ref(), &self.spec).await;

        if let (Some(strategy), Some(store)) = (result.winning_strategy, &self.snapshots) {
            match serde_json::to_vec_pretty(&result.raw_records) {
                Ok(bytes) => {
                    if let Err(err) = store
                        .archive(Utc::now(), &self.spec.source_id, strategy, &bytes)
                        .await
                    {
                        warn!(
                            source_id = self.spec.source_id.as_str(),
                            %err,
                            "failed to archive raw payload"
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        source_id = self.spec.source_id.as_str(),
                        %err,
                        "failed to serialize raw payload for archive"
                    );
                }
            }
        }

        let mut jobs = result.jobs;
        if !self.spec.title_filter.is_noop() {
            let before = jobs.len();
            jobs.retain(|job| self.spec.title_filter.admits(&job.title));
            debug!(
                source_id = self.spec.source_id.as_str(),
                kept = jobs.len(),
                dropped = before - jobs.len(),
                "applied title relevance filter"
            );
        }
        dedup_jobs_last_wins(jobs)
    }
}

/// Walks the payload shapes providers actually return and pulls out the
/// record list: `jobs`/`results`/`positions` at the top level, the same
/// keys nested under `search_results`/`searchResults`/`data`, and
/// search-engine style `hits.hits[]._source`.
pub fn records_from_payload(payload: &Value) -> Vec<RawRecord> {
    let Some(map) = payload.as_object() else {
        return Vec::new();
    };

    for key in ["jobs", "results", "positions"] {
        if let Some(Value::Array(items)) = map.get(key) {
            return object_items(items);
        }
    }

    for wrapper in ["search_results", "searchResults", "data"] {
        if let Some(Value::Object(inner)) = map.get(wrapper) {
            for key in ["jobs", "results", "positions"] {
                if let Some(Value::Array(items)) = inner.get(key) {
                    return object_items(items);
                }
            }
        }
    }

    if let Some(Value::Object(hits)) = map.get("hits") {
        if let Some(Value::Array(items)) = hits.get("hits") {
            return items
                .iter()
                .filter_map(|hit| hit.get("_source"))
                .filter_map(|source| source.as_object().cloned())
                .collect();
        }
    }

    Vec::new()
}

fn object_items(items: &[Value]) -> Vec<RawRecord> {
    items
        .iter()
        .filter_map(|item| item.as_object().cloned())
        .collect()
}

/// First occurrence wins within one strategy's candidate set. Records with
/// no resolvable id pass through; normalization drops them later.
fn dedup_by_id(records: Vec<RawRecord>, probes: &KeyProbes) -> Vec<RawRecord> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        match resolve_id(&record, probes) {
            Some(id) => {
                if seen.insert(id) {
                    out.push(record);
                }
            }
            None => out.push(record),
        }
    }
    out
}

/// Adapter-level uniqueness guarantee: the slot keeps its first position,
/// the value is the last one seen for that id.
fn dedup_jobs_last_wins(jobs: Vec<Job>) -> Vec<Job> {
    let mut slot_by_id: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Job> = Vec::new();
    for job in jobs {
        match slot_by_id.get(&job.id) {
            Some(&slot) => out[slot] = job,
            None => {
                slot_by_id.insert(job.id.clone(), out.len());
                out.push(job);
            }
        }
    }
    out
}

/// Builds a raw record out of one card fragment. The id is recovered from
/// the link's last path segment; a card with no link yields no id and is
/// dropped by normalization rather than tracked under a placeholder.
fn card_to_record(fragment: &str, rules: &CardRules, links: &LinkRules) -> Option<RawRecord> {
    let card = Html::parse_fragment(fragment);

    let title = rules
        .title_selectors
        .iter()
        .find_map(|selector| first_text(&card, selector));
    let link = first_attr(&card, &rules.link_selector, "href")
        .map(|href| links.absolutize(&href));
    let id = link.as_deref().and_then(id_from_link);
    let location = nth_text_line(&card, rules.location_line);

    let mut record = RawRecord::new();
    if let Some(id) = id {
        record.insert("id".to_string(), Value::String(id));
    }
    if let Some(title) = title {
        record.insert("title".to_string(), Value::String(title));
    }
    if let Some(location) = location {
        record.insert("location".to_string(), Value::String(location));
    }
    if let Some(link) = link {
        record.insert("url".to_string(), Value::String(link));
    }
    if record.is_empty() {
        None
    } else {
        Some(record)
    }
}

fn first_text(html: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    html.select(&sel)
        .next()
        .and_then(|el| clean_text(el.text().collect::<String>()))
}

fn first_attr(html: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    html.select(&sel)
        .next()
        .and_then(|el| el.value().attr(attr))
        .and_then(|value| clean_text(value.to_string()))
}

fn clean_text(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

/// Nth non-empty text line of the card. Relies on the source markup's own
/// line breaks between card fields, which is how these listing pages are
/// emitted in practice.
fn nth_text_line(card: &Html, line_index: usize) -> Option<String> {
    let text = card.root_element().text().collect::<String>();
    text.lines()
        .filter_map(|line| clean_text(line.to_string()))
        .nth(line_index)
}

/// Last path segment of a link, without query or fragment.
fn id_from_link(link: &str) -> Option<String> {
    let trimmed = link.trim_end_matches('/');
    let candidate = trimmed.rsplit('/').next()?;
    let candidate = match candidate.find(['?', '#']) {
        Some(cut) => &candidate[..cut],
        None => candidate,
    };
    if candidate.is_empty() || candidate.starts_with("http") {
        None
    } else {
        Some(candidate.to_string())
    }
}

/// Candidate filter for mined objects: must carry at least one id probe
/// key and one title probe key to count as a job record.
fn looks_like_job(map: &RawRecord, probes: &KeyProbes) -> bool {
    probes.id.iter().any(|key| map.contains_key(key))
        && probes.title.iter().any(|key| map.contains_key(key))
}

/// Scans text for balanced `{...}` blocks and keeps the ones that parse as
/// JSON. Brace tracking skips string contents and escapes; a block that
/// fails to parse is re-scanned from its next byte so records embedded in
/// non-JSON script state still surface.
pub fn mine_json_objects(text: &str) -> Vec<Value> {
    let bytes = text.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        match balanced_end(bytes, i) {
            Some(end) => {
                if let Ok(value) = serde_json::from_slice::<Value>(&bytes[i..=end]) {
                    out.push(value);
                    i = end + 1;
                } else {
                    i += 1;
                }
            }
            None => i += 1,
        }
    }
    out
}

fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Query parameters for the Amazon Jobs search endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmazonSearchParams {
    pub base_query: String,
    pub sort: String,
    pub offset: String,
    pub result_limit: String,
}

impl Default for AmazonSearchParams {
    fn default() -> Self {
        Self {
            base_query: "Software Engineer".to_string(),
            sort: "recent".to_string(),
            offset: "0".to_string(),
            result_limit: "50".to_string(),
        }
    }
}

pub fn amazon_jobs_spec(params: &AmazonSearchParams) -> SourceSpec {
    SourceSpec {
        source_id: "amazon-jobs".to_string(),
        display_name: "Amazon Jobs".to_string(),
        endpoint_url: Some("https://www.amazon.jobs/en/search.json".to_string()),
        query: vec![
            ("base_query".to_string(), params.base_query.clone()),
            ("sort".to_string(), params.sort.clone()),
            ("offset".to_string(), params.offset.clone()),
            ("result_limit".to_string(), params.result_limit.clone()),
        ],
        listing_url: "https://www.amazon.jobs/en/search".to_string(),
        capture_needles: vec!["search".to_string(), "/api/".to_string()],
        card_selectors: vec![
            "div.job-tile".to_string(),
            "div[role='listitem']".to_string(),
            "li.job".to_string(),
        ],
        card_rules: CardRules::default(),
        probes: KeyProbes::default(),
        links: LinkRules {
            base_url: "https://www.amazon.jobs".to_string(),
            job_url_template: "https://www.amazon.jobs/en/jobs/{id}".to_string(),
        },
        title_filter: TitleFilter::default(),
    }
}

pub fn microsoft_careers_spec(query: &str) -> SourceSpec {
    SourceSpec {
        source_id: "microsoft-careers".to_string(),
        display_name: "Microsoft Careers".to_string(),
        endpoint_url: None,
        query: vec![
            ("query".to_string(), query.to_string()),
            ("start".to_string(), "0".to_string()),
            ("location".to_string(), "United States".to_string()),
            ("sort_by".to_string(), "timestamp".to_string()),
            ("filter_include_remote".to_string(), "1".to_string()),
        ],
        listing_url: "https://apply.careers.microsoft.com/careers".to_string(),
        capture_needles: vec!["search".to_string(), "/api/".to_string()],
        card_selectors: vec![
            "div[role='listitem']".to_string(),
            "li.job-card".to_string(),
        ],
        card_rules: CardRules::default(),
        probes: KeyProbes::default(),
        links: LinkRules {
            base_url: "https://apply.careers.microsoft.com".to_string(),
            job_url_template: "https://apply.careers.microsoft.com/careers/job/{id}".to_string(),
        },
        title_filter: TitleFilter::default(),
    }
}

/// Built-in spec registry, keyed the way `sources.yaml` names sources.
pub fn spec_for_source(source_id: &str) -> Option<SourceSpec> {
    match source_id {
        "amazon-jobs" => Some(amazon_jobs_spec(&AmazonSearchParams::default())),
        "microsoft-careers" => Some(microsoft_careers_spec("Software engineer")),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobwatch_storage::TransportError;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeTransport {
        endpoint_payload: Option<Value>,
        endpoint_fails: bool,
        captured: Vec<Value>,
        fragments: Vec<String>,
        endpoint_calls: AtomicUsize,
        capture_calls: AtomicUsize,
        select_calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn fetch_json(
            &self,
            url: &str,
            _query: &[(String, String)],
        ) -> Result<Value, TransportError> {
            self.endpoint_calls.fetch_add(1, Ordering::SeqCst);
            if self.endpoint_fails {
                return Err(TransportError::HttpStatus {
                    status: 503,
                    url: url.to_string(),
                });
            }
            match &self.endpoint_payload {
                Some(payload) => Ok(payload.clone()),
                None => Err(TransportError::HttpStatus {
                    status: 404,
                    url: url.to_string(),
                }),
            }
        }

        async fn capture_responses(
            &self,
            _page_url: &str,
            _needles: &[String],
        ) -> Result<Vec<Value>, TransportError> {
            self.capture_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.captured.clone())
        }

        async fn select_fragments(
            &self,
            _page_url: &str,
            _selectors: &[String],
        ) -> Result<Vec<String>, TransportError> {
            self.select_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.fragments.clone())
        }
    }

    fn spec() -> SourceSpec {
        amazon_jobs_spec(&AmazonSearchParams::default())
    }

    fn jobs_payload(ids: &[&str]) -> Value {
        let jobs: Vec<Value> = ids
            .iter()
            .map(|id| json!({ "id_icims": id, "title": format!("Engineer {id}") }))
            .collect();
        json!({ "jobs": jobs })
    }

    #[tokio::test]
    async fn endpoint_win_short_circuits_later_strategies() {
        let transport = FakeTransport {
            endpoint_payload: Some(jobs_payload(&["1", "2"])),
            ..Default::default()
        };
        let chain = StrategyChain::standard();
        let result = chain.run(&transport, &spec()).await;

        assert_eq!(result.jobs.len(), 2);
        assert_eq!(result.winning_strategy, Some("endpoint"));
        assert_eq!(transport.endpoint_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.capture_calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.select_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_endpoint_falls_through_to_capture() {
        let transport = FakeTransport {
            endpoint_payload: Some(json!({ "jobs": [] })),
            captured: vec![jobs_payload(&["7"])],
            ..Default::default()
        };
        let result = StrategyChain::standard().run(&transport, &spec()).await;

        assert_eq!(result.winning_strategy, Some("capture"));
        assert_eq!(result.jobs.len(), 1);
        assert_eq!(transport.endpoint_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.capture_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_endpoint_falls_through_silently() {
        let transport = FakeTransport {
            endpoint_fails: true,
            captured: vec![jobs_payload(&["9"])],
            ..Default::default()
        };
        let result = StrategyChain::standard().run(&transport, &spec()).await;
        assert_eq!(result.winning_strategy, Some("capture"));
        assert_eq!(result.jobs[0].id, "9");
    }

    #[tokio::test]
    async fn unnormalizable_records_count_as_empty() {
        // Records with no resolvable id normalize to nothing; the chain must
        // keep falling through instead of returning an empty win.
        let transport = FakeTransport {
            endpoint_payload: Some(json!({ "jobs": [{ "title": "No Id Here" }] })),
            captured: vec![jobs_payload(&["11"])],
            ..Default::default()
        };
        let result = StrategyChain::standard().run(&transport, &spec()).await;
        assert_eq!(result.winning_strategy, Some("capture"));
        assert_eq!(result.jobs.len(), 1);
    }

    #[tokio::test]
    async fn exhausted_chain_yields_valid_empty_result() {
        let transport = FakeTransport::default();
        let result = StrategyChain::standard().run(&transport, &spec()).await;
        assert!(result.jobs.is_empty());
        assert_eq!(result.winning_strategy, None);
        assert_eq!(transport.endpoint_calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.capture_calls.load(Ordering::SeqCst), 1);
        // DOM cards and script mining share the selector operation.
        assert_eq!(transport.select_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn strategy_output_is_deduplicated_by_id() {
        let transport = FakeTransport {
            endpoint_payload: Some(jobs_payload(&["5", "5", "6"])),
            ..Default::default()
        };
        let result = StrategyChain::standard().run(&transport, &spec()).await;
        let ids: Vec<&str> = result.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["5", "6"]);
    }

    #[test]
    fn payload_walker_handles_every_documented_shape() {
        let record = json!({ "id": "1", "title": "T" });

        for payload in [
            json!({ "jobs": [record.clone()] }),
            json!({ "results": [record.clone()] }),
            json!({ "positions": [record.clone()] }),
            json!({ "search_results": { "jobs": [record.clone()] } }),
            json!({ "searchResults": { "results": [record.clone()] } }),
            json!({ "data": { "positions": [record.clone()] } }),
            json!({ "hits": { "hits": [{ "_source": record.clone() }] } }),
        ] {
            let records = records_from_payload(&payload);
            assert_eq!(records.len(), 1, "payload {payload}");
            assert_eq!(records[0].get("id"), Some(&json!("1")));
        }
    }

    #[test]
    fn payload_walker_rejects_unrecognized_shapes() {
        assert!(records_from_payload(&json!([1, 2, 3])).is_empty());
        assert!(records_from_payload(&json!({ "unrelated": true })).is_empty());
        assert!(records_from_payload(&json!({ "jobs": "not a list" })).is_empty());
        assert!(records_from_payload(&json!(null)).is_empty());
    }

    #[tokio::test]
    async fn dom_cards_yield_title_link_location_and_id() {
        let transport = FakeTransport {
            fragments: vec![
                "<div role=\"listitem\">\n<h3>Software Engineer II</h3>\nRedmond, WA\n<a href=\"/careers/job/1970393556752185\">view</a>\n</div>"
                    .to_string(),
            ],
            ..Default::default()
        };
        let ms = microsoft_careers_spec("Software engineer");
        let chain = StrategyChain::new(vec![Box::new(DomScrape)]);
        let result = chain.run(&transport, &ms).await;

        assert_eq!(result.winning_strategy, Some("dom"));
        let job = &result.jobs[0];
        assert_eq!(job.id, "1970393556752185");
        assert_eq!(job.title, "Software Engineer II");
        assert_eq!(job.location, "Redmond, WA");
        assert_eq!(
            job.link,
            "https://apply.careers.microsoft.com/careers/job/1970393556752185"
        );
    }

    #[tokio::test]
    async fn cards_without_links_are_dropped_not_placeholdered() {
        let transport = FakeTransport {
            fragments: vec!["<div role=\"listitem\"><h3>Linkless</h3></div>".to_string()],
            ..Default::default()
        };
        let ms = microsoft_careers_spec("Software engineer");
        let chain = StrategyChain::new(vec![Box::new(DomScrape)]);
        let result = chain.run(&transport, &ms).await;
        assert!(result.jobs.is_empty());
    }

    #[tokio::test]
    async fn script_mining_recovers_embedded_records() {
        let script = r#"<script>
            window.__STATE__ = mount({"jobs":[{"job_id":"J-1","title":"Backend Engineer"}]});
            var noise = { unquoted: keys };
            var single = {"requisitionId":"R-2","jobTitle":"Data Engineer","location":"Remote"};
        </script>"#;
        let transport = FakeTransport {
            fragments: vec![script.to_string()],
            ..Default::default()
        };
        let chain = StrategyChain::new(vec![Box::new(ScriptMine)]);
        let result = chain.run(&transport, &spec()).await;

        let ids: Vec<&str> = result.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["J-1", "R-2"]);
    }

    #[test]
    fn mining_skips_malformed_and_handles_braces_in_strings() {
        let mined = mine_json_objects(
            r#"junk {"a": "value with } brace"} more {broken json} {"b": 2}"#,
        );
        assert_eq!(mined.len(), 2);
        assert_eq!(mined[0], json!({ "a": "value with } brace" }));
        assert_eq!(mined[1], json!({ "b": 2 }));
    }

    #[test]
    fn mining_recovers_nested_objects_inside_js_assignments() {
        let mined = mine_json_objects(r#"var s = {jobs: [{"id":"1","title":"T"}]};"#);
        assert_eq!(mined, vec![json!({ "id": "1", "title": "T" })]);
    }

    #[tokio::test]
    async fn title_filter_applies_after_normalization() {
        let transport = FakeTransport {
            endpoint_payload: Some(json!({ "jobs": [
                { "id": "1", "title": "Software Engineer" },
                { "id": "2", "title": "Staff Software Engineer" },
                { "id": "3", "title": "Solutions Architect" },
                { "title": "Staff Software Engineer" },
            ]})),
            ..Default::default()
        };
        let mut filtered = spec();
        filtered.title_filter = TitleFilter {
            include: vec!["engineer".to_string()],
            exclude: vec!["staff".to_string()],
        };
        let adapter = SourceAdapter::new(filtered, Arc::new(transport));
        let jobs = adapter.fetch().await;

        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, "1");
    }

    #[tokio::test]
    async fn adapter_returns_unique_ids() {
        let transport = FakeTransport {
            endpoint_payload: Some(jobs_payload(&["a", "b", "a", "c", "b"])),
            ..Default::default()
        };
        let adapter = SourceAdapter::new(spec(), Arc::new(transport));
        let jobs = adapter.fetch().await;
        let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn listing_url_interpolates_query_with_plus_encoding() {
        let url = spec().listing_url_with_query();
        assert_eq!(
            url,
            "https://www.amazon.jobs/en/search?base_query=Software+Engineer&sort=recent&offset=0&result_limit=50"
        );
    }

    #[test]
    fn link_tail_id_ignores_query_and_trailing_slash() {
        assert_eq!(
            id_from_link("https://x/careers/job/123?ref=feed").as_deref(),
            Some("123")
        );
        assert_eq!(id_from_link("https://x/careers/job/123/").as_deref(), Some("123"));
        assert_eq!(id_from_link(""), None);
    }

    #[test]
    fn builtin_spec_registry_knows_both_sources() {
        assert!(spec_for_source("amazon-jobs").is_some());
        assert!(spec_for_source("microsoft-careers").is_some());
        assert!(spec_for_source("nowhere").is_none());
    }
}
