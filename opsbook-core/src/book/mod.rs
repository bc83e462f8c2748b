//! Runbook loading: YAML or JSON in, a typed [`Book`] out.

pub mod runners;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::{Map, Value};

use crate::error::{ConfigError, ParseError};
use crate::step::{parse_duration, parse_step, Step};

pub use runners::{CdpConfig, DbConfig, GrpcConfig, HttpConfig, RunnerConfig, RunnerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookFormat {
    Json,
    Yaml,
    Auto,
}

/// A parsed runbook: the declarative input one operator executes.
#[derive(Debug, Clone)]
pub struct Book {
    pub desc: String,
    pub vars: Map<String, Value>,
    pub runners: BTreeMap<String, RunnerConfig>,
    pub cond: Option<String>,
    pub debug: bool,
    pub interval: Duration,
    pub skip_test: bool,
    pub fail_fast: bool,
    /// `steps:` was a mapping rather than a sequence.
    pub use_map: bool,
    pub steps: Vec<Step>,
    pub path: Option<PathBuf>,
}

impl Book {
    pub fn runner_kinds(&self) -> BTreeMap<String, RunnerKind> {
        self.runners
            .iter()
            .map(|(k, v)| (k.clone(), v.kind()))
            .collect()
    }

    /// Directory that relative paths inside the book resolve against.
    pub fn root(&self) -> PathBuf {
        self.path
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

pub fn load_book(path: &Path) -> Result<Book, BookError> {
    let text = std::fs::read_to_string(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut book = parse_book_str(&text, BookFormat::Auto)?;
    book.path = Some(path.to_path_buf());
    Ok(book)
}

pub fn parse_book_str(input: &str, format: BookFormat) -> Result<Book, BookError> {
    let value = match format {
        BookFormat::Json => serde_json::from_str::<Value>(input).map_err(ParseError::Json)?,
        BookFormat::Yaml => yaml_value(input)?,
        BookFormat::Auto => auto_value(input)?,
    };
    Ok(book_from_value(value)?)
}

#[derive(Debug, thiserror::Error)]
pub enum BookError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn yaml_value(input: &str) -> Result<Value, ParseError> {
    let yaml: serde_yaml::Value = serde_yaml::from_str(input)?;
    // Going through serde keeps mapping order and rejects non-string keys.
    serde_json::to_value(yaml).map_err(ParseError::Json)
}

fn auto_value(input: &str) -> Result<Value, ParseError> {
    // JSON starts with `{` or `[` after trimming; everything else is YAML.
    let trimmed = input.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        match serde_json::from_str::<Value>(input) {
            Ok(v) => return Ok(v),
            Err(json_err) => {
                return yaml_value(input).map_err(|_| ParseError::Json(json_err));
            }
        }
    }
    match yaml_value(input) {
        Ok(v) => Ok(v),
        Err(yaml_err) => {
            if let Ok(v) = serde_json::from_str::<Value>(input) {
                return Ok(v);
            }
            Err(yaml_err)
        }
    }
}

fn book_from_value(value: Value) -> Result<Book, BookError> {
    let Value::Object(doc) = value else {
        return Err(ConfigError::InvalidBook("book must be a mapping".to_string()).into());
    };

    let desc = doc
        .get("desc")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let vars = match doc.get("vars") {
        Some(Value::Object(m)) => m.clone(),
        Some(other) => {
            return Err(
                ConfigError::InvalidBook(format!("vars must be a mapping, got {other}")).into(),
            )
        }
        None => Map::new(),
    };

    let mut runner_cfgs = BTreeMap::new();
    if let Some(v) = doc.get("runners") {
        let Value::Object(m) = v else {
            return Err(
                ConfigError::InvalidBook(format!("runners must be a mapping, got {v}")).into(),
            );
        };
        for (name, decl) in m {
            // Runner names share the step namespace with the section
            // keywords.
            if matches!(
                name.as_str(),
                "if" | "desc" | "loop" | "retry" | "test" | "dump" | "bind" | "include" | "exec"
            ) {
                return Err(ConfigError::InvalidRunnerDecl {
                    name: name.clone(),
                    reason: "name collides with a step keyword".to_string(),
                }
                .into());
            }
            let cfg = runners::parse_runner_decl(name, decl)?;
            runner_cfgs.insert(name.clone(), cfg);
        }
    }

    let cond = match doc.get("if") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            return Err(
                ConfigError::InvalidBook(format!("if must be a string, got {other}")).into(),
            )
        }
        None => None,
    };

    let debug = doc.get("debug").and_then(Value::as_bool).unwrap_or(false);
    let skip_test = doc.get("skipTest").and_then(Value::as_bool).unwrap_or(false);
    let fail_fast = doc.get("failFast").and_then(Value::as_bool).unwrap_or(false);
    let interval = match doc.get("interval") {
        Some(v) => parse_duration(v)?,
        None => Duration::ZERO,
    };

    let runner_kinds: BTreeMap<String, RunnerKind> = runner_cfgs
        .iter()
        .map(|(k, v)| (k.clone(), v.kind()))
        .collect();

    let mut steps = Vec::new();
    let mut use_map = false;
    match doc.get("steps") {
        Some(Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                let Value::Object(raw) = item else {
                    return Err(ConfigError::InvalidBook(format!(
                        "steps[{i}] must be a mapping, got {item}"
                    ))
                    .into());
                };
                steps.push(parse_step(&i.to_string(), raw, &runner_kinds)?);
            }
        }
        Some(Value::Object(items)) => {
            use_map = true;
            for (key, item) in items {
                let Value::Object(raw) = item else {
                    return Err(ConfigError::InvalidBook(format!(
                        "steps.{key} must be a mapping, got {item}"
                    ))
                    .into());
                };
                steps.push(parse_step(key, raw, &runner_kinds)?);
            }
        }
        Some(other) => {
            return Err(ConfigError::InvalidBook(format!(
                "steps must be a sequence or mapping, got {other}"
            ))
            .into())
        }
        None => {}
    }

    Ok(Book {
        desc,
        vars,
        runners: runner_cfgs,
        cond,
        debug,
        interval,
        skip_test,
        fail_fast,
        use_map,
        steps,
        path: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::StepKind;

    const BOOK: &str = r#"
desc: login and fetch
runners:
  req: https://api.example.com
  db: "sqlite::memory:"
vars:
  username: alice
interval: 10ms
steps:
  - req:
      path: /login
      method: POST
      body:
        username: "{{ vars.username }}"
  - test: steps[0].res.status == 200
"#;

    #[test]
    fn parses_yaml_list_book() {
        let book = parse_book_str(BOOK, BookFormat::Auto).unwrap();
        assert_eq!(book.desc, "login and fetch");
        assert!(!book.use_map);
        assert_eq!(book.steps.len(), 2);
        assert_eq!(book.interval, Duration::from_millis(10));
        assert!(matches!(book.steps[0].kind, StepKind::Http { .. }));
        assert_eq!(book.steps[1].test_cond.as_deref(), Some("steps[0].res.status == 200"));
    }

    #[test]
    fn parses_map_steps_in_declared_order() {
        let src = r#"
desc: mapped
steps:
  first:
    exec:
      command: echo one
  second:
    exec:
      command: echo two
"#;
        let book = parse_book_str(src, BookFormat::Auto).unwrap();
        assert!(book.use_map);
        let keys: Vec<_> = book.steps.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[test]
    fn auto_detects_json() {
        let src = r#"{"desc": "json book", "steps": [{"exec": {"command": "true"}}]}"#;
        let book = parse_book_str(src, BookFormat::Auto).unwrap();
        assert_eq!(book.desc, "json book");
    }

    #[test]
    fn rejects_unknown_step_runner() {
        let src = "steps:\n  - nosuch:\n      path: /\n";
        assert!(parse_book_str(src, BookFormat::Auto).is_err());
    }
}
