//! Pure constructors for search-query documents.
//!
//! Every builder returns the same document for the same inputs. Date ranges
//! are half-open (`gte` / `lt`) and formatted as `YYYY-MM-DD`. Repository
//! scoping is always an OR (`should` + `minimum_should_match: 1`); an empty
//! repository list therefore yields a query that matches nothing.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::date_util::format_day;
use crate::query::metric::{Aggregation, SortOrder};
use crate::window::TimeWindow;

pub const DEFAULT_DATE_FIELD: &str = "grimoire_creation_date";
pub const ORIGIN_FIELD: &str = "origin";
pub const TAG_FIELD: &str = "tag";
pub const PROJECT_FIELD: &str = "project";
pub const STATE_FIELD: &str = "state";
pub const CLOSED_AT_FIELD: &str = "closed_at";
pub const UPDATED_ON_FIELD: &str = "metadata__updated_on";
pub const AUTHOR_DOMAIN_FIELD: &str = "author_domain";
pub const AUTHOR_IDENTITY_FIELD: &str = "author_uuid";
pub const AUTHOR_FALLBACK_FIELD: &str = "author_name";

pub const UUID_AGG: &str = "count_of_uuid";
pub const CONTRIBUTORS_AGG: &str = "count_of_contributors";

/// Issue states that are not yet closed.
pub const OPEN_STATES: [&str; 2] = ["open", "progressing"];

fn range_filter(field: &str, window: &TimeWindow) -> Value {
    json!({
        "range": {
            field: {
                "gte": format_day(&window.from_date()),
                "lt": format_day(&window.to_date()),
            }
        }
    })
}

fn prefix_clauses(values: &[String], field: &str) -> Vec<Value> {
    values
        .iter()
        .map(|v| {
            json!({
                "simple_query_string": {
                    "query": format!("{v}*"),
                    "fields": [field],
                }
            })
        })
        .collect()
}

fn exact_clauses(values: &[String], field: &str) -> Vec<Value> {
    values
        .iter()
        .map(|v| {
            json!({
                "simple_query_string": {
                    "query": v,
                    "fields": [field],
                }
            })
        })
        .collect()
}

fn any_of(clauses: Vec<Value>) -> Value {
    json!({
        "bool": {
            "should": clauses,
            "minimum_should_match": 1,
        }
    })
}

fn aggregation(name: &str, operator: Aggregation, field: &str) -> Value {
    json!({ name: { operator.as_str(): { "field": field } } })
}

/// Count (or otherwise aggregate) documents whose origin starts with any of `repos`.
pub fn uuid_count_query(
    operator: Aggregation,
    repos: &[String],
    field: &str,
    date_field: Option<&str>,
    window: &TimeWindow,
) -> Value {
    json!({
        "size": 0,
        "track_total_hits": true,
        "aggs": aggregation(UUID_AGG, operator, field),
        "query": {
            "bool": {
                "should": prefix_clauses(repos, ORIGIN_FIELD),
                "minimum_should_match": 1,
                "filter": range_filter(date_field.unwrap_or(DEFAULT_DATE_FIELD), window),
            }
        }
    })
}

/// Painless expression used as the contributor identity: the identity field,
/// or the author name when the identity is missing or empty.
pub fn contributor_identity_script() -> String {
    format!(
        "if (doc['{AUTHOR_IDENTITY_FIELD}'].size() > 0 && doc['{AUTHOR_IDENTITY_FIELD}'].value != '') \
         {{ return doc['{AUTHOR_IDENTITY_FIELD}'].value }} \
         else {{ return doc['{AUTHOR_FALLBACK_FIELD}'].value }}"
    )
}

/// Distinct contributors across `projects`, optionally only those whose
/// author domain starts with one of `companies`.
pub fn contributor_count_query(
    projects: &[String],
    companies: &[String],
    date_field: Option<&str>,
    window: &TimeWindow,
) -> Value {
    let mut query = json!({
        "size": 0,
        "aggs": {
            CONTRIBUTORS_AGG: {
                "cardinality": {
                    "script": {
                        "source": contributor_identity_script(),
                        "lang": "painless",
                    }
                }
            }
        },
        "query": {
            "bool": {
                "should": exact_clauses(projects, PROJECT_FIELD),
                "minimum_should_match": 1,
                "filter": range_filter(date_field.unwrap_or(DEFAULT_DATE_FIELD), window),
            }
        }
    });

    if !companies.is_empty() {
        query["query"]["bool"]["must"] =
            json!([any_of(prefix_clauses(companies, AUTHOR_DOMAIN_FIELD))]);
    }
    query
}

/// Raw hits tagged with any of `repos` (as `<repo>.git`), ordered by creation date.
pub fn created_since_query(repos: &[String], order: SortOrder) -> Value {
    let clauses: Vec<Value> = repos
        .iter()
        .map(|r| json!({ "match_phrase": { TAG_FIELD: format!("{r}.git") } }))
        .collect();
    json!({
        "query": any_of(clauses),
        "sort": [{ DEFAULT_DATE_FIELD: { "order": order.as_str() } }],
    })
}

/// Documents from the given repository URL(s) last updated before `before`,
/// newest first.
///
/// One URL becomes a `term` filter; any other count becomes `terms`, which
/// matches nothing when the list is empty.
pub fn updated_since_query(repository_urls: &[String], before: &DateTime<Utc>) -> Value {
    let origin = match repository_urls {
        [url] => json!({ "term": { ORIGIN_FIELD: url } }),
        urls => json!({ "terms": { ORIGIN_FIELD: urls } }),
    };
    json!({
        "track_total_hits": true,
        "query": {
            "bool": {
                "filter": [
                    origin,
                    { "range": { UPDATED_ON_FIELD: { "lt": format_day(before) } } },
                ]
            }
        },
        "sort": [{ UPDATED_ON_FIELD: { "order": SortOrder::Desc.as_str() } }],
    })
}

/// Issues closed within `window` in any of `repos`, excluding open/progressing ones.
pub fn issue_closed_count_query(
    operator: Aggregation,
    repos: &[String],
    field: &str,
    window: &TimeWindow,
) -> Value {
    let excluded: Vec<Value> = OPEN_STATES
        .iter()
        .map(|s| json!({ "term": { STATE_FIELD: s } }))
        .collect();
    json!({
        "size": 0,
        "track_total_hits": true,
        "aggs": aggregation(UUID_AGG, operator, field),
        "query": {
            "bool": {
                "must": [any_of(prefix_clauses(repos, TAG_FIELD))],
                "must_not": excluded,
                "filter": range_filter(CLOSED_AT_FIELD, window),
            }
        }
    })
}

/// Issues created within `window` in any of `repos` that are still open or progressing.
pub fn issue_open_count_query(
    operator: Aggregation,
    repos: &[String],
    field: &str,
    date_field: Option<&str>,
    window: &TimeWindow,
) -> Value {
    json!({
        "size": 0,
        "track_total_hits": true,
        "aggs": aggregation(UUID_AGG, operator, field),
        "query": {
            "bool": {
                "must": [any_of(prefix_clauses(repos, TAG_FIELD))],
                "filter": [
                    range_filter(date_field.unwrap_or(DEFAULT_DATE_FIELD), window),
                    { "terms": { STATE_FIELD: OPEN_STATES } },
                ],
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repos(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn week() -> TimeWindow {
        TimeWindow::parse("2022-01-03", "2022-01-10").unwrap()
    }

    #[test]
    fn test_uuid_count_query_shape() {
        let q = uuid_count_query(
            Aggregation::Cardinality,
            &repos(&["https://gitee.com/acme/a", "https://gitee.com/acme/b"]),
            "uuid",
            None,
            &week(),
        );
        assert_eq!(q["size"], 0);
        assert_eq!(q["track_total_hits"], true);
        assert_eq!(q["aggs"][UUID_AGG]["cardinality"]["field"], "uuid");
        let bool_q = &q["query"]["bool"];
        assert_eq!(bool_q["minimum_should_match"], 1);
        assert_eq!(bool_q["should"].as_array().unwrap().len(), 2);
        assert_eq!(
            bool_q["should"][0]["simple_query_string"]["query"],
            "https://gitee.com/acme/a*"
        );
        assert_eq!(
            bool_q["should"][0]["simple_query_string"]["fields"],
            json!(["origin"])
        );
        assert_eq!(
            bool_q["filter"]["range"][DEFAULT_DATE_FIELD],
            json!({"gte": "2022-01-03", "lt": "2022-01-10"})
        );
    }

    #[test]
    fn test_uuid_count_query_custom_date_field() {
        let q = uuid_count_query(
            Aggregation::Count,
            &repos(&["a"]),
            "hash",
            Some("commit_date"),
            &week(),
        );
        assert_eq!(q["aggs"][UUID_AGG]["value_count"]["field"], "hash");
        assert!(q["query"]["bool"]["filter"]["range"]["commit_date"].is_object());
    }

    fn render_all(r: &[String], companies: &[String], w: &TimeWindow) -> Vec<String> {
        let before = w.to_date();
        [
            uuid_count_query(Aggregation::Count, r, "uuid", None, w),
            contributor_count_query(r, companies, None, w),
            created_since_query(r, SortOrder::Asc),
            updated_since_query(r, &before),
            issue_closed_count_query(Aggregation::Cardinality, r, "uuid", w),
            issue_open_count_query(Aggregation::Count, r, "uuid", None, w),
        ]
        .iter()
        .map(|q| serde_json::to_string(q).unwrap())
        .collect()
    }

    #[test]
    fn test_builders_are_pure() {
        let r = repos(&["a", "b", "c"]);
        let companies = repos(&["huawei"]);
        let first = render_all(&r, &companies, &week());
        let second = render_all(&r, &companies, &week());
        assert_eq!(first.len(), 6);
        assert_eq!(first, second);

        // caller's lists are untouched
        assert_eq!(r, repos(&["a", "b", "c"]));
        assert_eq!(companies, repos(&["huawei"]));
    }

    #[test]
    fn test_empty_scope_has_empty_should() {
        let q = uuid_count_query(Aggregation::Count, &[], "uuid", None, &week());
        assert_eq!(q["query"]["bool"]["should"], json!([]));
        assert_eq!(q["query"]["bool"]["minimum_should_match"], 1);

        let q = issue_closed_count_query(Aggregation::Count, &[], "uuid", &week());
        assert_eq!(q["query"]["bool"]["must"][0]["bool"]["should"], json!([]));
    }

    #[test]
    fn test_contributor_query_without_company() {
        let q = contributor_count_query(&repos(&["acme"]), &[], None, &week());
        let bool_q = &q["query"]["bool"];
        assert!(bool_q.get("must").is_none());
        assert_eq!(
            bool_q["filter"]["range"][DEFAULT_DATE_FIELD],
            json!({"gte": "2022-01-03", "lt": "2022-01-10"})
        );
        assert_eq!(bool_q["should"][0]["simple_query_string"]["query"], "acme");
        assert_eq!(
            bool_q["should"][0]["simple_query_string"]["fields"],
            json!(["project"])
        );
        let script = q["aggs"][CONTRIBUTORS_AGG]["cardinality"]["script"]["source"]
            .as_str()
            .unwrap();
        assert!(script.contains("doc['author_uuid'].size() > 0"));
        assert!(script.contains("doc['author_uuid'].value != ''"));
        assert!(script.contains("doc['author_name']"));
    }

    #[test]
    fn test_contributor_query_custom_date_field() {
        let q = contributor_count_query(&repos(&["acme"]), &[], Some("commit_date"), &week());
        let range = &q["query"]["bool"]["filter"]["range"];
        assert_eq!(
            range["commit_date"],
            json!({"gte": "2022-01-03", "lt": "2022-01-10"})
        );
        assert!(range.get(DEFAULT_DATE_FIELD).is_none());
    }

    #[test]
    fn test_contributor_query_with_company() {
        let q = contributor_count_query(
            &repos(&["acme"]),
            &repos(&["huawei", "intel"]),
            None,
            &week(),
        );
        let must = &q["query"]["bool"]["must"];
        assert_eq!(must.as_array().unwrap().len(), 1);
        let inner = &must[0]["bool"];
        assert_eq!(inner["minimum_should_match"], 1);
        assert_eq!(inner["should"][1]["simple_query_string"]["query"], "intel*");
        assert_eq!(
            inner["should"][1]["simple_query_string"]["fields"],
            json!(["author_domain"])
        );
    }

    #[test]
    fn test_created_since_query() {
        let q = created_since_query(&repos(&["https://gitee.com/acme/a"]), SortOrder::Asc);
        assert_eq!(
            q["query"]["bool"]["should"][0]["match_phrase"]["tag"],
            "https://gitee.com/acme/a.git"
        );
        assert_eq!(q["sort"][0][DEFAULT_DATE_FIELD]["order"], "asc");
        assert!(q.get("aggs").is_none());

        let q = created_since_query(&repos(&["a"]), SortOrder::Desc);
        assert_eq!(q["sort"][0][DEFAULT_DATE_FIELD]["order"], "desc");
    }

    #[test]
    fn test_updated_since_query_is_structured() {
        let before = crate::date_util::parse_datetime("2022-01-10").unwrap();
        // quotes in the URL stay inside a JSON string
        let url = r#"https://gitee.com/acme/a"}},{"match_all":{}}"#.to_string();
        let q = updated_since_query(std::slice::from_ref(&url), &before);
        assert_eq!(q["track_total_hits"], true);
        assert_eq!(q["query"]["bool"]["filter"][0]["term"]["origin"], url.as_str());
        assert_eq!(
            q["query"]["bool"]["filter"][1]["range"][UPDATED_ON_FIELD]["lt"],
            "2022-01-10"
        );
        assert_eq!(q["sort"][0][UPDATED_ON_FIELD]["order"], "desc");

        let q = updated_since_query(&[], &before);
        assert_eq!(q["query"]["bool"]["filter"][0]["terms"]["origin"], json!([]));
    }

    #[test]
    fn test_issue_closed_query_excludes_open_states() {
        let q = issue_closed_count_query(Aggregation::Cardinality, &repos(&["a"]), "uuid", &week());
        let bool_q = &q["query"]["bool"];
        assert_eq!(
            bool_q["must_not"],
            json!([{"term": {"state": "open"}}, {"term": {"state": "progressing"}}])
        );
        assert_eq!(
            bool_q["must"][0]["bool"]["should"][0]["simple_query_string"]["fields"],
            json!(["tag"])
        );
        assert_eq!(
            bool_q["filter"]["range"]["closed_at"],
            json!({"gte": "2022-01-03", "lt": "2022-01-10"})
        );
    }

    #[test]
    fn test_issue_open_query_restricts_states() {
        let q = issue_open_count_query(Aggregation::Count, &repos(&["a"]), "uuid", None, &week());
        let filter = &q["query"]["bool"]["filter"];
        assert_eq!(filter[1]["terms"]["state"], json!(["open", "progressing"]));
        assert!(filter[0]["range"][DEFAULT_DATE_FIELD].is_object());
    }
}
