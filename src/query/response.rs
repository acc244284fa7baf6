use serde_json::Value;

use crate::error::{Error, Result};

/// Value of the named aggregation; `None` when the backend reports null
/// (e.g. an average over no documents).
pub fn aggregation_value(response: &Value, name: &str) -> Result<Option<f64>> {
    let value = response
        .get("aggregations")
        .and_then(|aggs| aggs.get(name))
        .and_then(|agg| agg.get("value"))
        .ok_or_else(|| Error::MalformedResponse(format!("missing aggregations.{name}.value")))?;
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| Error::MalformedResponse(format!("aggregation {name} is not finite"))),
        other => Err(Error::MalformedResponse(format!(
            "aggregation {name} has non-numeric value {other}"
        ))),
    }
}

/// `hits.total`, accepting both the object form and the legacy integer form.
pub fn total_hits(response: &Value) -> Result<u64> {
    let total = response
        .get("hits")
        .and_then(|h| h.get("total"))
        .ok_or_else(|| Error::MalformedResponse("missing hits.total".into()))?;
    total
        .as_u64()
        .or_else(|| total.get("value").and_then(Value::as_u64))
        .ok_or_else(|| Error::MalformedResponse(format!("unexpected hits.total {total}")))
}

pub fn hits(response: &Value) -> Result<&Vec<Value>> {
    response
        .get("hits")
        .and_then(|h| h.get("hits"))
        .and_then(Value::as_array)
        .ok_or_else(|| Error::MalformedResponse("missing hits.hits".into()))
}

/// String field from the first hit's `_source`; `None` when there are no hits
/// or the field is absent.
pub fn first_hit_field(response: &Value, field: &str) -> Result<Option<String>> {
    let Some(first) = hits(response)?.first() else {
        return Ok(None);
    };
    let source = first
        .get("_source")
        .ok_or_else(|| Error::MalformedResponse("hit without _source".into()))?;
    Ok(source.get(field).and_then(Value::as_str).map(str::to_string))
}
