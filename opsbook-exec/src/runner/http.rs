use opsbook_core::book::HttpConfig;
use opsbook_core::error::ConfigError;
use serde_json::{Map, Value};

use crate::capture::CaptureEvent;

use super::{headers_to_value, RunnerError, StepHandle};

pub struct HttpRunner {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub path: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl HttpRunner {
    pub fn new(name: &str, cfg: &HttpConfig) -> Result<Self, ConfigError> {
        // Redirects stay in the book's hands: a 3xx is a recordable result,
        // not something the client follows silently.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("opsbook/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConfigError::InvalidRunnerDecl {
                name: name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            name: name.to_string(),
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            client,
        })
    }

    pub async fn run(
        &self,
        h: &mut StepHandle<'_>,
        req: HttpRequest,
    ) -> Result<(), RunnerError> {
        let url = format!("{}{}", self.endpoint, req.path);
        let method: reqwest::Method = req
            .method
            .to_uppercase()
            .parse()
            .map_err(|_| RunnerError::invalid("http", format!("bad method {:?}", req.method)))?;

        h.capturers
            .capture(CaptureEvent::HttpRequest {
                runner: self.name.clone(),
                method: method.to_string(),
                url: url.clone(),
            })
            .await;

        let mut rb = self.client.request(method, &url);
        for (k, v) in &req.headers {
            rb = rb.header(k, v);
        }
        if !req.query.is_empty() {
            rb = rb.query(&req.query);
        }
        if let Some(body) = &req.body {
            rb = rb.json(body);
        }

        let resp = rb.send().await.map_err(map_reqwest_error)?;
        let status = resp.status().as_u16();
        let headers = headers_to_value(
            resp.headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str(), v.to_string()))),
        );
        let is_json = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("json"))
            .unwrap_or(false);
        let raw = resp.bytes().await.map_err(map_reqwest_error)?;
        let body = if is_json {
            serde_json::from_slice(&raw).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&raw).into_owned())
            })
        } else if raw.is_empty() {
            Value::Null
        } else {
            Value::String(String::from_utf8_lossy(&raw).into_owned())
        };

        h.capturers
            .capture(CaptureEvent::HttpResponse {
                runner: self.name.clone(),
                status,
            })
            .await;

        let mut res = Map::new();
        res.insert("status".to_string(), Value::from(status));
        res.insert("headers".to_string(), headers);
        res.insert("body".to_string(), body);
        let mut record = Map::new();
        record.insert("res".to_string(), Value::Object(res));
        h.store.record(record);
        Ok(())
    }
}

fn map_reqwest_error(e: reqwest::Error) -> RunnerError {
    if e.is_timeout() {
        return RunnerError::Transport("timeout".to_string());
    }
    if e.is_connect() {
        return RunnerError::Connect(e.to_string());
    }
    RunnerError::Transport(e.to_string())
}

/// Parse an already-expanded request mapping:
/// `{path, method, headers, query, body}`.
pub fn parse_http_request(m: &Map<String, Value>) -> Result<HttpRequest, RunnerError> {
    let path = m
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or("/")
        .to_string();
    if !path.starts_with('/') {
        return Err(RunnerError::invalid(
            "http",
            format!("path must start with '/': {path:?}"),
        ));
    }
    let method = m
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or("GET")
        .to_string();
    let headers = string_pairs(m.get("headers"), "headers")?;
    let query = string_pairs(m.get("query"), "query")?;
    let body = m.get("body").cloned();
    for key in m.keys() {
        if !matches!(key.as_str(), "path" | "method" | "headers" | "query" | "body") {
            return Err(RunnerError::invalid("http", format!("unknown field {key:?}")));
        }
    }
    Ok(HttpRequest {
        path,
        method,
        headers,
        query,
        body,
    })
}

fn string_pairs(
    v: Option<&Value>,
    field: &str,
) -> Result<Vec<(String, String)>, RunnerError> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };
    let Value::Object(m) = v else {
        return Err(RunnerError::invalid(
            "http",
            format!("{field} must be a mapping"),
        ));
    };
    let mut out = Vec::with_capacity(m.len());
    for (k, v) in m {
        let s = match v {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(RunnerError::invalid(
                    "http",
                    format!("{field}.{k} must be a scalar, got {other}"),
                ))
            }
        };
        out.push((k.clone(), s));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn obj(v: Value) -> Map<String, Value> {
        match v {
            Value::Object(m) => m,
            _ => unreachable!(),
        }
    }

    #[test]
    fn parses_request_with_defaults() {
        let req = parse_http_request(&obj(json!({"path": "/users"}))).unwrap();
        assert_eq!(req.method, "GET");
        assert!(req.body.is_none());
    }

    #[test]
    fn rejects_unknown_fields_and_bad_paths() {
        assert!(parse_http_request(&obj(json!({"path": "users"}))).is_err());
        assert!(parse_http_request(&obj(json!({"path": "/", "extra": 1}))).is_err());
    }
}
