//! Declarative representation of one runbook step.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::book::runners::RunnerKind;
use crate::error::ConfigError;

pub const IF_KEY: &str = "if";
pub const DESC_KEY: &str = "desc";
pub const LOOP_KEY: &str = "loop";
pub const DEPRECATED_RETRY_KEY: &str = "retry";
pub const TEST_KEY: &str = "test";
pub const DUMP_KEY: &str = "dump";
pub const BIND_KEY: &str = "bind";
pub const INCLUDE_KEY: &str = "include";
pub const EXEC_KEY: &str = "exec";

/// One parsed step. Immutable after parse.
#[derive(Debug, Clone)]
pub struct Step {
    pub key: String,
    pub desc: Option<String>,
    pub cond: Option<String>,
    pub loop_spec: Option<LoopSpec>,
    pub test_cond: Option<String>,
    pub dump: Option<DumpRequest>,
    /// Bind targets in declaration order.
    pub bind: Vec<(String, String)>,
    pub kind: StepKind,
}

/// The step's primary runner reference with its opaque request mapping.
#[derive(Debug, Clone)]
pub enum StepKind {
    Http { runner: String, request: Map<String, Value> },
    Db { runner: String, query: Map<String, Value> },
    Grpc { runner: String, request: Map<String, Value> },
    Cdp { runner: String, actions: Map<String, Value> },
    Exec { command: Map<String, Value> },
    Include(IncludeConfig),
    /// Side-runner-only step (bind / dump / test without a primary).
    None,
}

impl StepKind {
    pub fn label(&self) -> &'static str {
        match self {
            StepKind::Http { .. } => "http request",
            StepKind::Db { .. } => "db query",
            StepKind::Grpc { .. } => "grpc request",
            StepKind::Cdp { .. } => "cdp actions",
            StepKind::Exec { .. } => "exec command",
            StepKind::Include(_) => "include",
            StepKind::None => "step",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DumpRequest {
    pub expr: String,
    pub out: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IncludeConfig {
    pub path: PathBuf,
    pub vars: Map<String, Value>,
    pub skip_test: bool,
}

/// Bounded loop configuration: `loop: 3`, or a mapping with `count`,
/// `until` and an interval policy.
#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub count: CountSpec,
    pub until: Option<String>,
    pub interval: IntervalSpec,
}

#[derive(Debug, Clone)]
pub enum CountSpec {
    Fixed(usize),
    Expr(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntervalSpec {
    Fixed(Duration),
    /// Doubling schedule from `min`, capped at `max`.
    Range { min: Duration, max: Duration },
}

impl Default for IntervalSpec {
    fn default() -> Self {
        IntervalSpec::Fixed(Duration::ZERO)
    }
}

/// Parse one step mapping. The section keys are extracted (and removed) in a
/// fixed order; the single remaining key selects the primary runner.
pub fn parse_step(
    key: &str,
    raw: &Map<String, Value>,
    runner_kinds: &BTreeMap<String, RunnerKind>,
) -> Result<Step, ConfigError> {
    let mut m = raw.clone();
    let mut step = Step {
        key: key.to_string(),
        desc: None,
        cond: None,
        loop_spec: None,
        test_cond: None,
        dump: None,
        bind: Vec::new(),
        kind: StepKind::None,
    };

    if let Some(v) = m.remove(IF_KEY) {
        step.cond = Some(section_str(key, "if", &v)?);
    }
    if let Some(v) = m.remove(DESC_KEY) {
        step.desc = Some(section_str(key, "desc", &v)?);
    }
    if let Some(v) = m.remove(LOOP_KEY) {
        step.loop_spec = Some(parse_loop(key, &v)?);
    }
    if let Some(v) = m.remove(DEPRECATED_RETRY_KEY) {
        step.loop_spec = Some(parse_loop(key, &v)?);
    }
    if let Some(v) = m.remove(TEST_KEY) {
        step.test_cond = Some(match v {
            Value::Bool(b) => b.to_string(),
            Value::String(s) => s,
            other => {
                return Err(invalid_section(key, "test", &format!("invalid condition: {other}")))
            }
        });
    }
    if let Some(v) = m.remove(DUMP_KEY) {
        step.dump = Some(parse_dump(key, &v)?);
    }
    if let Some(v) = m.remove(BIND_KEY) {
        let Value::Object(map) = v else {
            return Err(invalid_section(key, "bind", "must be a mapping"));
        };
        for (name, expr) in map {
            let Value::String(expr) = expr else {
                return Err(invalid_section(key, "bind", "values must be expression strings"));
            };
            step.bind.push((name, expr));
        }
    }

    let mut remaining = m.into_iter();
    if let Some((runner_key, v)) = remaining.next() {
        if let Some((extra, _)) = remaining.next() {
            return Err(invalid_section(
                key,
                "step",
                &format!("more than one runner section ({runner_key}, {extra})"),
            ));
        }
        step.kind = parse_primary(key, &runner_key, v, runner_kinds)?;
    } else if step.test_cond.is_none() && step.dump.is_none() && step.bind.is_empty() {
        return Err(invalid_section(key, "step", "step declares no runner"));
    }
    Ok(step)
}

fn parse_primary(
    step_key: &str,
    runner_key: &str,
    v: Value,
    runner_kinds: &BTreeMap<String, RunnerKind>,
) -> Result<StepKind, ConfigError> {
    if runner_key == INCLUDE_KEY {
        return parse_include(step_key, v);
    }
    if runner_key == EXEC_KEY {
        let command = section_map(step_key, EXEC_KEY, v)?;
        return Ok(StepKind::Exec { command });
    }
    let Some(kind) = runner_kinds.get(runner_key) else {
        return Err(ConfigError::UnknownRunnerKey {
            step: step_key.to_string(),
            key: runner_key.to_string(),
        });
    };
    let request = section_map(step_key, "request", v)?;
    let runner = runner_key.to_string();
    Ok(match kind {
        RunnerKind::Http => StepKind::Http { runner, request },
        RunnerKind::Db => StepKind::Db { runner, query: request },
        RunnerKind::Grpc => StepKind::Grpc { runner, request },
        RunnerKind::Cdp => StepKind::Cdp { runner, actions: request },
    })
}

fn parse_include(step_key: &str, v: Value) -> Result<StepKind, ConfigError> {
    match v {
        Value::String(path) => Ok(StepKind::Include(IncludeConfig {
            path: PathBuf::from(path),
            vars: Map::new(),
            skip_test: false,
        })),
        Value::Object(m) => {
            let path = m
                .get("path")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid_section(step_key, "include", "missing path"))?;
            let vars = match m.get("vars") {
                Some(Value::Object(vars)) => vars.clone(),
                Some(other) => {
                    return Err(invalid_section(
                        step_key,
                        "include",
                        &format!("vars must be a mapping, got {other}"),
                    ))
                }
                None => Map::new(),
            };
            let skip_test = m.get("skipTest").and_then(Value::as_bool).unwrap_or(false);
            Ok(StepKind::Include(IncludeConfig {
                path: PathBuf::from(path),
                vars,
                skip_test,
            }))
        }
        other => Err(invalid_section(
            step_key,
            "include",
            &format!("must be a path or mapping, got {other}"),
        )),
    }
}

fn parse_dump(step_key: &str, v: &Value) -> Result<DumpRequest, ConfigError> {
    match v {
        Value::String(expr) => Ok(DumpRequest {
            expr: expr.clone(),
            out: None,
        }),
        Value::Object(m) => {
            let expr = m
                .get("expr")
                .and_then(Value::as_str)
                .ok_or_else(|| invalid_section(step_key, "dump", "missing expr"))?;
            let out = match m.get("out") {
                Some(Value::String(out)) => Some(out.clone()),
                Some(other) => {
                    return Err(invalid_section(
                        step_key,
                        "dump",
                        &format!("out must be a string, got {other}"),
                    ))
                }
                None => None,
            };
            Ok(DumpRequest {
                expr: expr.to_string(),
                out,
            })
        }
        other => Err(invalid_section(
            step_key,
            "dump",
            &format!("must be an expression or mapping, got {other}"),
        )),
    }
}

fn parse_loop(step_key: &str, v: &Value) -> Result<LoopSpec, ConfigError> {
    match v {
        Value::Number(_) | Value::String(_) => Ok(LoopSpec {
            count: parse_count(step_key, v)?,
            until: None,
            interval: IntervalSpec::default(),
        }),
        Value::Object(m) => {
            let count = m
                .get("count")
                .map(|c| parse_count(step_key, c))
                .transpose()?
                .ok_or_else(|| invalid_section(step_key, "loop", "missing count"))?;
            let until = match m.get("until") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => {
                    return Err(invalid_section(
                        step_key,
                        "loop",
                        &format!("until must be an expression string, got {other}"),
                    ))
                }
                None => None,
            };
            let interval = match (m.get("interval"), m.get("minInterval"), m.get("maxInterval")) {
                (Some(d), None, None) => IntervalSpec::Fixed(parse_duration(d)?),
                (None, Some(min), Some(max)) => IntervalSpec::Range {
                    min: parse_duration(min)?,
                    max: parse_duration(max)?,
                },
                (None, None, None) => IntervalSpec::default(),
                _ => {
                    return Err(invalid_section(
                        step_key,
                        "loop",
                        "use either interval or minInterval+maxInterval",
                    ))
                }
            };
            Ok(LoopSpec {
                count,
                until,
                interval,
            })
        }
        other => Err(invalid_section(
            step_key,
            "loop",
            &format!("must be a count or mapping, got {other}"),
        )),
    }
}

fn parse_count(step_key: &str, v: &Value) -> Result<CountSpec, ConfigError> {
    match v {
        Value::Number(n) => n
            .as_u64()
            .map(|u| CountSpec::Fixed(u as usize))
            .ok_or_else(|| invalid_section(step_key, "loop", "count must be a non-negative integer")),
        Value::String(s) => Ok(CountSpec::Expr(s.clone())),
        other => Err(invalid_section(
            step_key,
            "loop",
            &format!("count must be a number or expression, got {other}"),
        )),
    }
}

/// Accepts a bare number of seconds or a `ms`/`s`/`m`/`h` suffixed string.
pub fn parse_duration(v: &Value) -> Result<Duration, ConfigError> {
    match v {
        Value::Number(n) => {
            let secs = n
                .as_f64()
                .filter(|f| *f >= 0.0)
                .ok_or_else(|| ConfigError::InvalidDuration(v.to_string()))?;
            Ok(Duration::from_secs_f64(secs))
        }
        Value::String(s) => parse_duration_str(s),
        other => Err(ConfigError::InvalidDuration(other.to_string())),
    }
}

fn parse_duration_str(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| c.is_ascii_alphabetic()) {
        Some(at) => (&s[..at], &s[at..]),
        None => (s, "s"),
    };
    let n: f64 = num
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidDuration(s.to_string()))?;
    if n < 0.0 {
        return Err(ConfigError::InvalidDuration(s.to_string()));
    }
    let secs = match unit {
        "ms" => n / 1000.0,
        "s" => n,
        "m" => n * 60.0,
        "h" => n * 3600.0,
        _ => return Err(ConfigError::InvalidDuration(s.to_string())),
    };
    Ok(Duration::from_secs_f64(secs))
}

fn section_str(step_key: &str, section: &'static str, v: &Value) -> Result<String, ConfigError> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid_section(step_key, section, "must be a string"))
}

fn section_map(
    step_key: &str,
    section: &'static str,
    v: Value,
) -> Result<Map<String, Value>, ConfigError> {
    match v {
        Value::Object(m) => Ok(m),
        other => Err(invalid_section(
            step_key,
            section,
            &format!("must be a mapping, got {other}"),
        )),
    }
}

fn invalid_section(step_key: &str, section: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidSection {
        step: step_key.to_string(),
        section,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn kinds() -> BTreeMap<String, RunnerKind> {
        let mut m = BTreeMap::new();
        m.insert("req".to_string(), RunnerKind::Http);
        m.insert("db".to_string(), RunnerKind::Db);
        m.insert("greq".to_string(), RunnerKind::Grpc);
        m
    }

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn extracts_sections_and_primary() {
        let raw = obj(json!({
            "if": "vars.enabled",
            "desc": "fetch users",
            "loop": {"count": 3, "until": "current.res.status == 0"},
            "test": "current.res.status == 0",
            "bind": {"token": "current.res.body.token"},
            "req": {"path": "/users", "method": "GET"},
        }));
        let step = parse_step("0", &raw, &kinds()).unwrap();
        assert_eq!(step.cond.as_deref(), Some("vars.enabled"));
        assert_eq!(step.desc.as_deref(), Some("fetch users"));
        assert!(step.loop_spec.is_some());
        assert_eq!(step.bind.len(), 1);
        assert!(matches!(step.kind, StepKind::Http { ref runner, .. } if runner == "req"));
    }

    #[test]
    fn legacy_retry_maps_to_loop() {
        let raw = obj(json!({"retry": 2, "exec": {"command": "true"}}));
        let step = parse_step("0", &raw, &kinds()).unwrap();
        match step.loop_spec.unwrap().count {
            CountSpec::Fixed(n) => assert_eq!(n, 2),
            other => panic!("unexpected count: {other:?}"),
        }
    }

    #[test]
    fn side_runner_only_step_has_no_primary() {
        let raw = obj(json!({"test": "steps[0].run"}));
        let step = parse_step("1", &raw, &kinds()).unwrap();
        assert!(matches!(step.kind, StepKind::None));
        assert_eq!(step.test_cond.as_deref(), Some("steps[0].run"));
    }

    #[test]
    fn unknown_runner_key_is_rejected() {
        let raw = obj(json!({"nosuch": {}}));
        assert!(matches!(
            parse_step("2", &raw, &kinds()),
            Err(ConfigError::UnknownRunnerKey { .. })
        ));
    }

    #[test]
    fn two_primary_sections_are_rejected() {
        let raw = obj(json!({"req": {"path": "/"}, "db": {"stmt": "SELECT 1"}}));
        assert!(parse_step("3", &raw, &kinds()).is_err());
    }

    #[test]
    fn loop_requires_count() {
        let raw = obj(json!({"loop": {"until": "true"}, "exec": {"command": "true"}}));
        assert!(parse_step("4", &raw, &kinds()).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration(&json!(1.5)).unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration(&json!("500ms")).unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration(&json!("2m")).unwrap(), Duration::from_secs(120));
        assert!(parse_duration(&json!("-1s")).is_err());
        assert!(parse_duration(&json!("1 fortnight")).is_err());
    }
}
