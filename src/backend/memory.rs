use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{LazyLock, Mutex, PoisonError};

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::backend::{MetricSink, SearchBackend};
use crate::date_util::parse_datetime;
use crate::error::{Error, Result};
use crate::metrics::MetricRecord;

static SCRIPT_VALUE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:return )?doc\['([^']+)'\]\.value$").unwrap());
static SCRIPT_FALLBACK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^if \((.+)\) \{ return doc\['([^']+)'\]\.value \} else \{ return doc\['([^']+)'\]\.value \}$",
    )
    .unwrap()
});
static SCRIPT_CONDITION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^doc\['([^']+)'\]\.(size\(\) > 0|value != '')$").unwrap());

const DEFAULT_SIZE: usize = 10;

/// In-process backend over fixture documents.
///
/// Evaluates the subset of the query language the metric queries use:
/// `bool` (must, should, minimum_should_match, filter, must_not),
/// `simple_query_string` (exact, or prefix with a trailing `*`), `match_phrase`,
/// `term`, `terms`, `range`, `match_all`, `sort`, `size` and the metric
/// aggregations. Scripts are limited to `doc['f'].value` and an
/// `if (..) { return doc['a'].value } else { return doc['b'].value }` whose
/// condition joins `size() > 0` and `value != ''` tests with `&&`. Date
/// strings compare as instants. Also acts as a sink, storing written records
/// as documents.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    indices: Mutex<HashMap<String, Vec<Value>>>,
    queries: Mutex<Vec<(String, Value)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixture documents as `{"<index>": [doc, ...], ...}`.
    pub fn from_json(text: &str) -> Result<Self> {
        let parsed: HashMap<String, Vec<Value>> = serde_json::from_str(text)
            .map_err(|e| Error::Config(format!("invalid fixture document: {e}")))?;
        Ok(Self {
            indices: Mutex::new(parsed),
            queries: Mutex::default(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read fixture {}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn insert(&self, index: &str, doc: Value) {
        self.indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(index.to_string())
            .or_default()
            .push(doc);
    }

    pub fn documents(&self, index: &str) -> Vec<Value> {
        self.indices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Every (index, query) received so far, in arrival order.
    pub fn queries(&self) -> Vec<(String, Value)> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Evaluate `query` against the documents of `index`.
    pub fn execute(&self, index: &str, query: &Value) -> Result<Value> {
        self.queries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((index.to_string(), query.clone()));

        let docs = self.documents(index);
        let mut matched = Vec::new();
        for doc in docs {
            let keep = match query.get("query") {
                Some(clause) => matches(&doc, clause)?,
                None => true,
            };
            if keep {
                matched.push(doc);
            }
        }

        if let Some(sort) = query.get("sort") {
            sort_docs(&mut matched, sort)?;
        }

        let mut response = json!({
            "took": 0,
            "timed_out": false,
            "hits": {
                "total": { "value": matched.len(), "relation": "eq" },
                "hits": [],
            }
        });

        if let Some(aggs) = query.get("aggs").and_then(Value::as_object) {
            let mut results = Map::new();
            for (name, spec) in aggs {
                results.insert(name.clone(), json!({ "value": aggregate(&matched, spec)? }));
            }
            response["aggregations"] = Value::Object(results);
        }

        let size = query
            .get("size")
            .and_then(Value::as_u64)
            .map(|s| s as usize)
            .unwrap_or(DEFAULT_SIZE);
        response["hits"]["hits"] = matched
            .into_iter()
            .take(size)
            .map(|doc| json!({ "_index": index, "_source": doc }))
            .collect();
        Ok(response)
    }
}

fn unsupported(what: &str) -> Error {
    Error::BackendRejected {
        status: 400,
        message: format!("unsupported query: {what}"),
    }
}

/// A clause given either as one object or as a list of objects.
fn clause_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

/// Values stored under `field`, flattening arrays.
fn field_values<'a>(doc: &'a Value, field: &str) -> Vec<&'a Value> {
    match doc.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().filter(|v| !v.is_null()).collect(),
        Some(v) => vec![v],
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (as_text(a), as_text(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a.partial_cmp(&b);
    }
    if let (Some(a), Some(b)) = (a.as_str(), b.as_str()) {
        if let (Ok(a), Ok(b)) = (parse_datetime(a), parse_datetime(b)) {
            return Some(a.cmp(&b));
        }
    }
    Some(as_text(a)?.cmp(&as_text(b)?))
}

/// The single `{field: body}` pair of a leaf clause.
fn single_field<'a>(clause: &'a Value, kind: &str) -> Result<(&'a str, &'a Value)> {
    clause
        .as_object()
        .filter(|o| o.len() == 1)
        .and_then(|o| o.iter().next())
        .map(|(k, v)| (k.as_str(), v))
        .ok_or_else(|| unsupported(&format!("{kind} must name exactly one field")))
}

fn matches(doc: &Value, clause: &Value) -> Result<bool> {
    let (kind, body) = single_field(clause, "clause")?;
    match kind {
        "match_all" => Ok(true),
        "bool" => bool_matches(doc, body),
        "simple_query_string" => {
            let query = body
                .get("query")
                .and_then(Value::as_str)
                .ok_or_else(|| unsupported("simple_query_string without query"))?;
            let fields = body
                .get("fields")
                .and_then(Value::as_array)
                .ok_or_else(|| unsupported("simple_query_string without fields"))?;
            let (needle, prefix) = match query.strip_suffix('*') {
                Some(stem) => (stem, true),
                None => (query, false),
            };
            Ok(fields.iter().filter_map(Value::as_str).any(|field| {
                field_values(doc, field)
                    .into_iter()
                    .filter_map(as_text)
                    .any(|v| if prefix { v.starts_with(needle) } else { v == needle })
            }))
        }
        "match_phrase" | "term" => {
            let (field, expected) = single_field(body, kind)?;
            let expected = expected.get("value").unwrap_or(expected);
            Ok(field_values(doc, field)
                .into_iter()
                .any(|v| same_value(v, expected)))
        }
        "terms" => {
            let (field, expected) = single_field(body, kind)?;
            let expected = expected
                .as_array()
                .ok_or_else(|| unsupported("terms expects a list"))?;
            Ok(field_values(doc, field)
                .into_iter()
                .any(|v| expected.iter().any(|e| same_value(v, e))))
        }
        "range" => {
            let (field, bounds) = single_field(body, kind)?;
            let bounds = bounds
                .as_object()
                .ok_or_else(|| unsupported("range expects bounds"))?;
            Ok(field_values(doc, field).into_iter().any(|v| {
                bounds.iter().all(|(op, bound)| {
                    let ord = compare(v, bound);
                    match op.as_str() {
                        "gte" => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
                        "gt" => ord == Some(Ordering::Greater),
                        "lte" => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
                        "lt" => ord == Some(Ordering::Less),
                        _ => true,
                    }
                })
            }))
        }
        other => Err(unsupported(other)),
    }
}

fn bool_matches(doc: &Value, body: &Value) -> Result<bool> {
    for key in ["must", "filter"] {
        if let Some(clauses) = body.get(key) {
            for clause in clause_list(clauses) {
                if !matches(doc, clause)? {
                    return Ok(false);
                }
            }
        }
    }
    if let Some(clauses) = body.get("must_not") {
        for clause in clause_list(clauses) {
            if matches(doc, clause)? {
                return Ok(false);
            }
        }
    }
    if let Some(clauses) = body.get("should") {
        let clauses = clause_list(clauses);
        let has_required = body.get("must").is_some() || body.get("filter").is_some();
        let default_minimum = if has_required || clauses.is_empty() { 0 } else { 1 };
        let minimum = body
            .get("minimum_should_match")
            .and_then(Value::as_u64)
            .unwrap_or(default_minimum);
        let mut hits = 0u64;
        for clause in clauses {
            if matches(doc, clause)? {
                hits += 1;
            }
        }
        if hits < minimum {
            return Ok(false);
        }
    }
    Ok(true)
}

fn sort_docs(docs: &mut [Value], sort: &Value) -> Result<()> {
    let mut keys = Vec::new();
    for entry in clause_list(sort) {
        let (field, spec) = single_field(entry, "sort")?;
        let descending = spec.get("order").and_then(Value::as_str) == Some("desc");
        keys.push((field.to_string(), descending));
    }
    docs.sort_by(|a, b| {
        for (field, descending) in &keys {
            let ord = match (
                field_values(a, field).first(),
                field_values(b, field).first(),
            ) {
                (Some(x), Some(y)) => {
                    let ord = compare(x, y).unwrap_or(Ordering::Equal);
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                }
                // missing values sort last either way
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(())
}

fn first_value(doc: &Value, field: &str) -> Option<Value> {
    field_values(doc, field).first().map(|v| (*v).clone())
}

fn script_condition(doc: &Value, condition: &str) -> Result<bool> {
    for test in condition.split("&&").map(str::trim) {
        let caps = SCRIPT_CONDITION_RE
            .captures(test)
            .ok_or_else(|| unsupported(&format!("script condition `{test}`")))?;
        let value = first_value(doc, &caps[1]);
        let holds = match &caps[2] {
            "size() > 0" => value.is_some(),
            _ => value.is_some_and(|v| v.as_str() != Some("")),
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn script_value(doc: &Value, source: &str) -> Result<Option<Value>> {
    let source = source.split_whitespace().collect::<Vec<_>>().join(" ");
    if let Some(caps) = SCRIPT_VALUE_RE.captures(&source) {
        return Ok(first_value(doc, &caps[1]));
    }
    let caps = SCRIPT_FALLBACK_RE
        .captures(&source)
        .ok_or_else(|| unsupported(&format!("script `{source}`")))?;
    let field = if script_condition(doc, &caps[1])? {
        &caps[2]
    } else {
        &caps[3]
    };
    Ok(first_value(doc, field))
}

/// Per-document value an aggregation reads, from a field or a script.
fn aggregation_input(doc: &Value, params: &Value) -> Result<Option<Value>> {
    if let Some(field) = params.get("field").and_then(Value::as_str) {
        return Ok(first_value(doc, field));
    }
    let source = params
        .get("script")
        .and_then(|s| s.get("source").or(Some(s)))
        .and_then(Value::as_str)
        .ok_or_else(|| unsupported("aggregation needs a field or script"))?;
    script_value(doc, source)
}

fn aggregate(docs: &[Value], spec: &Value) -> Result<Value> {
    let (operator, params) = single_field(spec, "aggregation")?;
    let mut inputs = Vec::new();
    for doc in docs {
        if let Some(v) = aggregation_input(doc, params)? {
            inputs.push(v);
        }
    }
    let numbers = || inputs.iter().filter_map(Value::as_f64);
    Ok(match operator {
        "value_count" => json!(inputs.len()),
        "cardinality" => {
            let distinct: HashSet<String> = inputs.iter().filter_map(as_text).collect();
            json!(distinct.len())
        }
        "sum" => json!(numbers().sum::<f64>()),
        "avg" => {
            let values: Vec<f64> = numbers().collect();
            if values.is_empty() {
                Value::Null
            } else {
                json!(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        "min" => numbers().reduce(f64::min).map_or(Value::Null, |v| json!(v)),
        "max" => numbers().reduce(f64::max).map_or(Value::Null, |v| json!(v)),
        other => return Err(unsupported(other)),
    })
}

impl SearchBackend for MemoryBackend {
    async fn search(&self, index: &str, query: &Value) -> Result<Value> {
        self.execute(index, query)
    }
}

impl MetricSink for MemoryBackend {
    async fn write_batch(&self, index: &str, records: &[MetricRecord]) -> Result<()> {
        let mut docs = Vec::with_capacity(records.len());
        for record in records {
            docs.push(
                serde_json::to_value(record)
                    .map_err(|e| Error::SinkWrite(format!("cannot serialize {}: {e}", record.uuid)))?,
            );
        }
        let mut indices = self.indices.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = indices.entry(index.to_string()).or_default();
        for doc in docs {
            // keyed by uuid: a rewrite replaces the earlier document
            match stored.iter_mut().find(|d| d.get("uuid") == doc.get("uuid")) {
                Some(existing) => *existing = doc,
                None => stored.push(doc),
            }
        }
        Ok(())
    }
}
