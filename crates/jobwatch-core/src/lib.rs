//! Canonical job model and field normalization for jobwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "jobwatch-core";

/// Hard cap, in characters, applied to normalized title and location values.
pub const FIELD_MAX_CHARS: usize = 100;

/// Sentinel title for records that carried no usable title field.
pub const UNKNOWN_TITLE: &str = "Unknown Position";

/// Sentinel location for records that carried no usable location field.
pub const UNKNOWN_LOCATION: &str = "N/A";

/// Raw provider record as captured by an extraction strategy, before
/// normalization. Providers disagree on key names and value shapes, so this
/// stays an untyped JSON object until [`normalize`] runs.
pub type RawRecord = Map<String, Value>;

/// Canonical job posting.
///
/// `id` is the sole identity key within a source: a record whose title or
/// location drifted between runs is still the same posting as long as the
/// provider id matches. Values are immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub title: String,
    pub location: String,
    pub link: String,
    pub found_at: DateTime<Utc>,
}

/// Ordered key-name probes for one provider's raw record shape.
///
/// Each list is walked front to back and the first key holding a usable
/// value wins, so more specific provider keys go before generic ones
/// (`id_icims` carries the URL-friendly posting id while `id` is often an
/// opaque UUID).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyProbes {
    pub id: Vec<String>,
    pub title: Vec<String>,
    pub location: Vec<String>,
    pub path: Vec<String>,
    pub url: Vec<String>,
}

impl Default for KeyProbes {
    fn default() -> Self {
        Self {
            id: strings(&[
                "id_icims",
                "idIcims",
                "requisitionId",
                "requisition_id",
                "jobId",
                "job_id",
                "postingId",
                "posting_id",
                "id",
            ]),
            title: strings(&["title", "jobTitle", "job_title", "name", "positionTitle"]),
            location: strings(&[
                "location",
                "normalized_location",
                "primaryLocation",
                "primary_location",
            ]),
            path: strings(&["job_path", "jobPath"]),
            url: strings(&["url", "jobDetailUrl", "job_detail_url"]),
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Rules for turning probed path/url fragments into an absolute posting link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRules {
    /// Scheme-and-host prefix applied to source-relative hrefs.
    pub base_url: String,
    /// Template with an `{id}` placeholder, used when neither a path nor a
    /// url field survives probing.
    pub job_url_template: String,
}

impl LinkRules {
    /// Absolute links pass through untouched; anything else is treated as a
    /// source-relative href and prefixed with the base URL.
    pub fn absolutize(&self, href: &str) -> String {
        if href.starts_with("http") {
            href.to_string()
        } else if href.starts_with('/') {
            format!("{}{}", self.base_url, href)
        } else {
            format!("{}/{}", self.base_url, href)
        }
    }

    pub fn from_id(&self, id: &str) -> String {
        self.job_url_template.replace("{id}", id)
    }
}

/// Case-insensitive substring filter applied to normalized titles before a
/// result set leaves its source adapter. An empty include list admits every
/// title; any exclusion match rejects, and exclusion wins over inclusion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TitleFilter {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TitleFilter {
    pub fn admits(&self, title: &str) -> bool {
        let lowered = title.to_lowercase();
        if self
            .exclude
            .iter()
            .any(|pat| lowered.contains(&pat.to_lowercase()))
        {
            return false;
        }
        self.include.is_empty()
            || self
                .include
                .iter()
                .any(|pat| lowered.contains(&pat.to_lowercase()))
    }

    pub fn is_noop(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

/// Outcome of one extraction strategy attempt against a source.
///
/// `Failed` carries a short reason for the log line; the chain treats it the
/// same as `Empty` and falls through to the next strategy.
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyOutcome {
    /// Candidate raw records, already de-duplicated by resolved id.
    Records(Vec<RawRecord>),
    /// The strategy ran cleanly but found nothing to extract.
    Empty,
    /// The strategy could not run to completion.
    Failed(String),
}

/// Normalizes one raw provider record into a canonical [`Job`].
///
/// Total over arbitrary JSON input. Returns `None` only when no id can be
/// resolved; a record without an id is untrackable and is dropped rather
/// than stored under a placeholder. Missing title and location fall back to
/// their sentinels, and the link is built from the best available of
/// relative path, explicit url, or the per-job URL template.
pub fn normalize(raw: &RawRecord, probes: &KeyProbes, links: &LinkRules) -> Option<Job> {
    let id = first_nonempty(raw, &probes.id)?;

    let title = truncate(&first_nonempty(raw, &probes.title).unwrap_or_default());
    let location = truncate(&normalize_location(first_present(raw, &probes.location)));
    let link = build_link(raw, probes, links, &id);

    Some(Job {
        id,
        title: if title.is_empty() {
            UNKNOWN_TITLE.to_string()
        } else {
            title
        },
        location: if location.is_empty() {
            UNKNOWN_LOCATION.to_string()
        } else {
            location
        },
        link,
        found_at: Utc::now(),
    })
}

/// Resolves the identity of a raw record without full normalization.
/// Strategies use this to de-duplicate their candidate sets.
pub fn resolve_id(raw: &RawRecord, probes: &KeyProbes) -> Option<String> {
    first_nonempty(raw, &probes.id)
}

/// Collapses the location shapes providers actually emit into one string:
/// a plain string is trimmed, a mapping is probed for `name`/`location`/
/// `value`, and a list keeps its first two non-empty components joined with
/// `", "`. Anything unrecognized normalizes to empty.
pub fn normalize_location(raw: Option<&Value>) -> String {
    match raw {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Object(map)) => ["name", "location", "value"]
            .iter()
            .filter_map(|key| map.get(*key))
            .map(string_of)
            .find(|s| !s.is_empty())
            .unwrap_or_default(),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .iter()
                .take(2)
                .map(|item| normalize_location(Some(item)))
                .filter(|part| !part.is_empty())
                .collect();
            parts.join(", ")
        }
        Some(other) => string_of(other),
    }
}

/// Character-boundary-safe truncation to [`FIELD_MAX_CHARS`].
pub fn truncate(input: &str) -> String {
    input.chars().take(FIELD_MAX_CHARS).collect()
}

fn build_link(raw: &RawRecord, probes: &KeyProbes, links: &LinkRules, id: &str) -> String {
    if let Some(path) = first_nonempty(raw, &probes.path) {
        return links.absolutize(&path);
    }
    if let Some(url) = first_nonempty(raw, &probes.url) {
        return links.absolutize(&url);
    }
    links.from_id(id)
}

/// First key whose value stringifies to a non-empty scalar.
fn first_nonempty(raw: &RawRecord, keys: &[String]) -> Option<String> {
    keys.iter()
        .filter_map(|key| raw.get(key))
        .map(string_of)
        .find(|s| !s.is_empty())
}

/// First key holding a non-blank value of any shape. Used for location,
/// where the winning value may be a mapping or list that still needs its
/// own normalization pass.
fn first_present<'a>(raw: &'a RawRecord, keys: &[String]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| raw.get(key))
        .find(|value| !is_blank(value))
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Scalar stringification with trim. Mappings and lists stringify to empty
/// so that probing skips past them instead of embedding debug output.
fn string_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> RawRecord {
        match value {
            Value::Object(map) => map,
            other => panic!("test record must be an object, got {other}"),
        }
    }

    fn amazon_links() -> LinkRules {
        LinkRules {
            base_url: "https://www.amazon.jobs".to_string(),
            job_url_template: "https://www.amazon.jobs/en/jobs/{id}".to_string(),
        }
    }

    #[test]
    fn id_probe_prefers_url_friendly_id_over_uuid() {
        let raw = record(json!({
            "id": "9e3b1c2a-uuid",
            "id_icims": 3179205,
            "title": "Software Dev Engineer"
        }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(job.id, "3179205");
    }

    #[test]
    fn record_without_any_id_is_dropped() {
        let raw = record(json!({ "title": "Ghost Posting", "location": "Nowhere" }));
        assert!(normalize(&raw, &KeyProbes::default(), &amazon_links()).is_none());
    }

    #[test]
    fn whitespace_only_id_is_dropped() {
        let raw = record(json!({ "id": "   " }));
        assert!(normalize(&raw, &KeyProbes::default(), &amazon_links()).is_none());
    }

    #[test]
    fn missing_title_and_location_use_sentinels() {
        let raw = record(json!({ "id": "42" }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(job.title, UNKNOWN_TITLE);
        assert_eq!(job.location, UNKNOWN_LOCATION);
        assert_eq!(job.link, "https://www.amazon.jobs/en/jobs/42");
    }

    #[test]
    fn title_and_location_are_hard_capped() {
        let long = "x".repeat(500);
        let raw = record(json!({ "id": "1", "title": long, "location": long.clone() }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(job.title.chars().count(), FIELD_MAX_CHARS);
        assert_eq!(job.location.chars().count(), FIELD_MAX_CHARS);
    }

    #[test]
    fn truncation_respects_multibyte_boundaries() {
        let title: String = "日本語".repeat(40);
        let raw = record(json!({ "id": "1", "title": title }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(job.title.chars().count(), FIELD_MAX_CHARS);
    }

    #[test]
    fn location_mapping_probes_name_then_location_then_value() {
        assert_eq!(
            normalize_location(Some(&json!({ "name": "Seattle, WA" }))),
            "Seattle, WA"
        );
        assert_eq!(
            normalize_location(Some(&json!({ "value": "Berlin" }))),
            "Berlin"
        );
    }

    #[test]
    fn location_list_keeps_first_two_components() {
        let raw = json!([{ "name": "Seattle" }, { "name": "Remote" }, { "name": "Austin" }]);
        assert_eq!(normalize_location(Some(&raw)), "Seattle, Remote");
    }

    #[test]
    fn location_list_skips_empty_components() {
        let raw = json!(["", { "name": "Dublin" }]);
        assert_eq!(normalize_location(Some(&raw)), "Dublin");
    }

    #[test]
    fn relative_job_path_gets_base_prefix() {
        let raw = record(json!({
            "id_icims": "3179205",
            "job_path": "/en/jobs/3179205/software-dev-engineer"
        }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(
            job.link,
            "https://www.amazon.jobs/en/jobs/3179205/software-dev-engineer"
        );
    }

    #[test]
    fn absolute_url_field_passes_through() {
        let raw = record(json!({
            "id": "7",
            "url": "https://elsewhere.example/postings/7"
        }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(job.link, "https://elsewhere.example/postings/7");
    }

    #[test]
    fn relative_url_field_gets_base_prefix() {
        let raw = record(json!({ "id": "7", "url": "/postings/7" }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(job.link, "https://www.amazon.jobs/postings/7");
    }

    #[test]
    fn numeric_fields_stringify_without_decoration() {
        let raw = record(json!({ "job_id": 98765, "title": "Engineer II" }));
        let job = normalize(&raw, &KeyProbes::default(), &amazon_links()).unwrap();
        assert_eq!(job.id, "98765");
    }

    #[test]
    fn same_id_means_same_posting_despite_field_drift() {
        let probes = KeyProbes::default();
        let links = amazon_links();
        let a = normalize(
            &record(json!({ "id": "55", "title": "SDE" })),
            &probes,
            &links,
        )
        .unwrap();
        let b = normalize(
            &record(json!({ "id": "55", "title": "Software Development Engineer" })),
            &probes,
            &links,
        )
        .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn title_filter_excludes_win_over_includes() {
        let filter = TitleFilter {
            include: vec!["engineer".to_string()],
            exclude: vec!["staff".to_string()],
        };
        assert!(filter.admits("Software Engineer II"));
        assert!(!filter.admits("Staff Software Engineer"));
        assert!(!filter.admits("Product Manager"));
    }

    #[test]
    fn empty_title_filter_admits_everything() {
        let filter = TitleFilter::default();
        assert!(filter.is_noop());
        assert!(filter.admits("Anything At All"));
    }

    #[test]
    fn title_filter_is_case_insensitive() {
        let filter = TitleFilter {
            include: vec!["ENGINEER".to_string()],
            exclude: vec![],
        };
        assert!(filter.admits("software engineer"));
    }

    #[test]
    fn resolve_id_matches_normalize_identity() {
        let raw = record(json!({ "requisitionId": "R-100", "id": "uuid-junk" }));
        let probes = KeyProbes::default();
        assert_eq!(resolve_id(&raw, &probes).as_deref(), Some("R-100"));
    }
}
