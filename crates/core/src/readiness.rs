//! Readiness checks evaluated against live downstream state.
//!
//! Checks come from `eno.azure.io/readiness[-<name>]` annotations. The
//! grammar is a dotted path with an optional comparison, plus a shortcut for
//! the ubiquitous status-conditions convention:
//!
//!   condition:Available          a conditions[] entry of that type is True
//!   status.readyReplicas         path exists and is truthy
//!   status.phase=Running         path equals the literal
//!   status.phase!=Pending        path differs from the literal
//!
//! All checks of a resource must pass; the latest timestamp wins so that the
//! resource's ready time reflects the final transition.

use chrono::{DateTime, Utc};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Condition(String),
    Exists(String),
    Eq(String, String),
    Ne(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessCheck {
    pub name: String,
    expr: Expr,
}

impl ReadinessCheck {
    pub fn parse(name: &str, raw: &str) -> Self {
        let raw = raw.trim();
        let expr = if let Some(cond) = raw.strip_prefix("condition:") {
            Expr::Condition(cond.trim().to_string())
        } else if let Some((path, lit)) = raw.split_once("!=") {
            Expr::Ne(path.trim().to_string(), unquote(lit))
        } else if let Some((path, lit)) = raw.split_once('=') {
            Expr::Eq(path.trim().to_string(), unquote(lit))
        } else {
            Expr::Exists(raw.to_string())
        };
        Self { name: name.to_string(), expr }
    }

    /// Returns the ready time when the check passes against `current`.
    fn eval(&self, current: &Value) -> Option<DateTime<Utc>> {
        match &self.expr {
            Expr::Condition(cond_type) => {
                let conditions = extract_path(current, "status.conditions")?.as_array()?;
                let cond = conditions.iter().find(|c| {
                    c.get("type").and_then(|t| t.as_str()) == Some(cond_type.as_str())
                })?;
                if cond.get("status").and_then(|s| s.as_str()) != Some("True") {
                    return None;
                }
                let transition = cond
                    .get("lastTransitionTime")
                    .and_then(|t| t.as_str())
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc));
                Some(transition.unwrap_or_else(Utc::now))
            }
            Expr::Exists(path) => {
                let v = extract_path(current, path)?;
                truthy(v).then(Utc::now)
            }
            Expr::Eq(path, lit) => {
                let v = extract_path(current, path)?;
                (scalar_string(v)?.as_str() == lit).then(Utc::now)
            }
            Expr::Ne(path, lit) => {
                // A missing path trivially differs from the literal.
                match extract_path(current, path).and_then(scalar_string) {
                    Some(s) if s == *lit => None,
                    _ => Some(Utc::now()),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadinessChecks(Vec<ReadinessCheck>);

impl ReadinessChecks {
    pub fn from_annotations(annotations: Option<&serde_json::Map<String, Value>>) -> Self {
        let Some(annotations) = annotations else {
            return Self::default();
        };
        let mut checks = Vec::new();
        for (key, value) in annotations {
            let Some(raw) = value.as_str() else { continue };
            if key.as_str() == super::resource::READINESS_ANNOTATION {
                checks.push(ReadinessCheck::parse("default", raw));
                continue;
            }
            let Some(name) = key.strip_prefix("eno.azure.io/readiness-") else {
                continue;
            };
            // readiness-group is ordering metadata, not a check
            if name == "group" {
                continue;
            }
            checks.push(ReadinessCheck::parse(name, raw));
        }
        checks.sort_by(|a, b| a.name.cmp(&b.name));
        Self(checks)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate all checks. Readiness defaults to true when no checks are
    /// configured. When several checks pass the latest timestamp wins.
    pub fn eval(&self, current: Option<&Value>) -> Option<DateTime<Utc>> {
        if self.0.is_empty() {
            return Some(Utc::now());
        }
        let current = current?;
        let mut latest: Option<DateTime<Utc>> = None;
        for check in &self.0 {
            let ready = check.eval(current)?;
            latest = Some(match latest {
                Some(t) if t > ready => t,
                _ => ready,
            });
        }
        latest
    }
}

fn unquote(raw: &str) -> String {
    let raw = raw.trim();
    raw.trim_matches('\'').trim_matches('"').to_string()
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

fn scalar_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Minimal json-path-like extraction: dot fields with optional `[index]`.
fn extract_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() {
            return None;
        }
        let (key, idx) = match seg.find('[') {
            Some(open) => {
                let close = seg.get(open + 1..)?.find(']')? + open + 1;
                (&seg[..open], Some(seg[open + 1..close].parse::<usize>().ok()?))
            }
            None => (seg, None),
        };
        cur = cur.as_object()?.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checks(pairs: &[(&str, &str)]) -> ReadinessChecks {
        let mut map = serde_json::Map::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), Value::String(v.to_string()));
        }
        ReadinessChecks::from_annotations(Some(&map))
    }

    #[test]
    fn empty_checks_default_to_ready() {
        let c = ReadinessChecks::default();
        assert!(c.eval(None).is_some());
        assert!(c.eval(Some(&json!({}))).is_some());
    }

    #[test]
    fn condition_check_uses_transition_time() {
        let c = checks(&[("eno.azure.io/readiness", "condition:Available")]);
        let obj = json!({
            "status": {"conditions": [
                {"type": "Progressing", "status": "True"},
                {
                    "type": "Available",
                    "status": "True",
                    "lastTransitionTime": "2023-05-01T10:00:00Z"
                }
            ]}
        });
        let ready = c.eval(Some(&obj)).unwrap();
        assert_eq!(ready.to_rfc3339(), "2023-05-01T10:00:00+00:00");

        let not_ready = json!({
            "status": {"conditions": [{"type": "Available", "status": "False"}]}
        });
        assert!(c.eval(Some(&not_ready)).is_none());
    }

    #[test]
    fn path_comparisons() {
        let eq = checks(&[("eno.azure.io/readiness", "status.phase=Running")]);
        assert!(eq.eval(Some(&json!({"status": {"phase": "Running"}}))).is_some());
        assert!(eq.eval(Some(&json!({"status": {"phase": "Pending"}}))).is_none());
        assert!(eq.eval(Some(&json!({}))).is_none());

        let ne = checks(&[("eno.azure.io/readiness", "status.phase!=Pending")]);
        assert!(ne.eval(Some(&json!({"status": {"phase": "Running"}}))).is_some());
        assert!(ne.eval(Some(&json!({"status": {"phase": "Pending"}}))).is_none());
        // Missing path counts as "not equal".
        assert!(ne.eval(Some(&json!({}))).is_some());
    }

    #[test]
    fn existence_check_requires_truthy_value() {
        let c = checks(&[("eno.azure.io/readiness", "status.readyReplicas")]);
        assert!(c.eval(Some(&json!({"status": {"readyReplicas": 2}}))).is_some());
        assert!(c.eval(Some(&json!({"status": {"readyReplicas": false}}))).is_none());
        assert!(c.eval(Some(&json!({"status": {}}))).is_none());
    }

    #[test]
    fn all_named_checks_must_pass_and_latest_wins() {
        let c = checks(&[
            ("eno.azure.io/readiness", "condition:Available"),
            ("eno.azure.io/readiness-replicas", "status.readyReplicas=2"),
        ]);
        let passing = json!({
            "status": {
                "readyReplicas": 2,
                "conditions": [{
                    "type": "Available",
                    "status": "True",
                    "lastTransitionTime": "2023-05-01T10:00:00Z"
                }]
            }
        });
        let ready = c.eval(Some(&passing)).unwrap();
        // The literal comparison stamps "now", which is later than the
        // recorded condition transition.
        assert!(ready.to_rfc3339() > "2023-05-01T10:00:00+00:00".to_string());

        let partial = json!({
            "status": {
                "readyReplicas": 1,
                "conditions": [{"type": "Available", "status": "True"}]
            }
        });
        assert!(c.eval(Some(&partial)).is_none());
    }

    #[test]
    fn readiness_group_annotation_is_not_a_check() {
        let c = checks(&[("eno.azure.io/readiness-group", "4")]);
        assert!(c.is_empty());
    }

    #[test]
    fn indexed_path_extraction() {
        let c = checks(&[("eno.azure.io/readiness", "status.ingress[0].ip")]);
        let obj = json!({"status": {"ingress": [{"ip": "10.0.0.1"}]}});
        assert!(c.eval(Some(&obj)).is_some());
        assert!(c.eval(Some(&json!({"status": {"ingress": []}}))).is_none());
    }
}
