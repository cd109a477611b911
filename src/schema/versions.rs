//! One pure transform per version gap. Each takes the whole stored value and
//! returns the next version's shape.

use chrono::DateTime;
use serde_json::{json, Map, Value};

use super::MigrationError;

pub(super) type Transform = fn(Value) -> Result<Value, MigrationError>;

/// `(from_major, transform)` in ascending order.
pub(super) const CHAIN: [(u32, Transform); 2] = [(1, v1_to_v2), (2, v2_to_v3)];

/// v1 kept discoveries in an object keyed by id, with ISO-8601 timestamps,
/// and counted visits as `visits`.
fn v1_to_v2(value: Value) -> Result<Value, MigrationError> {
    let mut obj = into_object(value, 1)?;

    let mut discoveries = Vec::new();
    match obj.remove("discoveries") {
        Some(Value::Object(map)) => {
            for (id, entry) in map {
                let entry = entry.as_object().cloned().unwrap_or_default();
                discoveries.push(json!({
                    "id": id,
                    "label": string_field(&entry, "label"),
                    "message": string_field(&entry, "message"),
                    "timestamp": epoch_ms(entry.get("timestamp")),
                }));
            }
        }
        Some(Value::Null) | None => {}
        Some(other) => {
            return Err(MigrationError::Malformed {
                version: 1,
                reason: format!("discoveries is {}, expected an object", type_name(&other)),
            })
        }
    }
    discoveries.sort_by(|a, b| {
        let at = |v: &Value| v["timestamp"].as_i64().unwrap_or(0);
        at(a).cmp(&at(b))
            .then_with(|| a["id"].as_str().cmp(&b["id"].as_str()))
    });

    Ok(json!({
        "version": "2.0",
        "discoveries": discoveries,
        "visitCount": obj.get("visits").and_then(Value::as_u64).unwrap_or(0),
        "firstVisit": epoch_ms(obj.get("firstVisit")),
        "lastVisit": epoch_ms(obj.get("lastVisit")),
        "totalTimeSpent": obj.get("timeSpent").and_then(Value::as_u64).unwrap_or(0),
    }))
}

/// v2 used epoch-ms timestamps but second-granularity time and no visit
/// number per discovery.
fn v2_to_v3(value: Value) -> Result<Value, MigrationError> {
    let obj = into_object(value, 2)?;

    let raw = match obj.get("discoveries") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            return Err(MigrationError::Malformed {
                version: 2,
                reason: format!("discoveries is {}, expected an array", type_name(other)),
            })
        }
    };

    let mut seen = std::collections::HashSet::new();
    let mut discoveries = Vec::with_capacity(raw.len());
    for item in raw {
        let entry = item.as_object().cloned().unwrap_or_default();
        let id = string_field(&entry, "id");
        if id.is_empty() {
            return Err(MigrationError::Malformed {
                version: 2,
                reason: "discovery without an id".into(),
            });
        }
        if !seen.insert(id.clone()) {
            continue;
        }
        discoveries.push(json!({
            "id": id,
            "label": string_field(&entry, "label"),
            "message": string_field(&entry, "message"),
            "atEpochMs": epoch_ms(entry.get("timestamp")),
            "visitNumberAtDiscovery": 0,
        }));
    }

    let first = epoch_ms(obj.get("firstVisit"));
    let last = epoch_ms(obj.get("lastVisit")).max(first);
    let seconds = obj.get("totalTimeSpent").and_then(Value::as_u64).unwrap_or(0);

    Ok(json!({
        "schemaVersion": "3.0",
        "discoveries": discoveries,
        "visitCount": obj.get("visitCount").and_then(Value::as_u64).unwrap_or(0),
        "firstVisitEpochMs": first,
        "lastVisitEpochMs": last,
        "totalActiveMs": seconds.saturating_mul(1_000),
    }))
}

fn into_object(value: Value, version: u32) -> Result<Map<String, Value>, MigrationError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(MigrationError::Malformed {
            version,
            reason: format!("record is {}, expected an object", type_name(&other)),
        }),
    }
}

fn string_field(obj: &Map<String, Value>, name: &str) -> String {
    obj.get(name)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Accepts epoch milliseconds or an RFC 3339 string; anything else is 0.
fn epoch_ms(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .unwrap_or(0),
        _ => 0,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a bool",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v1_discoveries_become_an_ordered_array() {
        let v1 = json!({
            "discoveries": {
                "zebra": {"label": "Z", "message": "z", "timestamp": "2024-01-01T00:00:00Z"},
                "apple": {"label": "A", "message": "a", "timestamp": "2024-02-01T00:00:00Z"}
            },
            "visits": 4,
            "firstVisit": "2023-12-31T00:00:00Z",
            "lastVisit": "2024-02-02T00:00:00Z",
            "timeSpent": 90
        });
        let v2 = v1_to_v2(v1).expect("migrates");
        let ids: Vec<_> = v2["discoveries"]
            .as_array()
            .expect("array")
            .iter()
            .map(|d| d["id"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ids, vec!["zebra", "apple"]);
        assert_eq!(v2["visitCount"], 4);
        assert_eq!(v2["discoveries"][0]["timestamp"], 1_704_067_200_000i64);
    }

    #[test]
    fn v2_duplicates_collapse_to_first() {
        let v2 = json!({
            "version": "2.0",
            "discoveries": [
                {"id": "owl", "label": "first", "message": "", "timestamp": 5},
                {"id": "owl", "label": "second", "message": "", "timestamp": 9}
            ],
            "visitCount": 1,
            "firstVisit": 1,
            "lastVisit": 10,
            "totalTimeSpent": 3
        });
        let v3 = v2_to_v3(v2).expect("migrates");
        assert_eq!(v3["discoveries"].as_array().map(Vec::len), Some(1));
        assert_eq!(v3["discoveries"][0]["label"], "first");
        assert_eq!(v3["totalActiveMs"], 3_000);
    }

    #[test]
    fn non_object_is_malformed() {
        assert!(matches!(
            v2_to_v3(json!([1, 2])),
            Err(MigrationError::Malformed { version: 2, .. })
        ));
    }
}
