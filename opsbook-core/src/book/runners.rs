use std::path::PathBuf;

use serde_json::Value;

use crate::error::ConfigError;

/// Which protocol a declared runner speaks. Step parsing uses this to tag
/// the primary section of each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    Http,
    Db,
    Grpc,
    Cdp,
}

#[derive(Debug, Clone)]
pub enum RunnerConfig {
    Http(HttpConfig),
    Db(DbConfig),
    Grpc(GrpcConfig),
    Cdp(CdpConfig),
}

impl RunnerConfig {
    pub fn kind(&self) -> RunnerKind {
        match self {
            RunnerConfig::Http(_) => RunnerKind::Http,
            RunnerConfig::Db(_) => RunnerKind::Db,
            RunnerConfig::Grpc(_) => RunnerKind::Grpc,
            RunnerConfig::Cdp(_) => RunnerKind::Cdp,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub dsn: String,
}

#[derive(Debug, Clone, Default)]
pub struct GrpcConfig {
    pub target: String,
    /// TLS is on by default; explicitly disabled here or implicitly for
    /// `:80` targets.
    pub tls: Option<bool>,
    pub cacert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub skip_verify: bool,
    pub import_paths: Vec<PathBuf>,
    pub protos: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CdpConfig {
    pub remote: String,
}

/// Parse one `runners:` entry. A bare string is sniffed by scheme; a mapping
/// declares the protocol through its fields (`endpoint`, `dsn`, `addr`,
/// `remote`).
pub fn parse_runner_decl(name: &str, v: &Value) -> Result<RunnerConfig, ConfigError> {
    match v {
        Value::String(s) => parse_runner_target(name, s),
        Value::Object(m) => {
            if let Some(dsn) = m.get("dsn") {
                let dsn = as_str(name, "dsn", dsn)?;
                Ok(RunnerConfig::Db(DbConfig { dsn }))
            } else if let Some(endpoint) = m.get("endpoint") {
                let endpoint = as_str(name, "endpoint", endpoint)?;
                Ok(RunnerConfig::Http(HttpConfig { endpoint }))
            } else if let Some(remote) = m.get("remote") {
                let remote = as_str(name, "remote", remote)?;
                Ok(RunnerConfig::Cdp(CdpConfig { remote }))
            } else if let Some(addr) = m.get("addr") {
                let target = strip_grpc_scheme(&as_str(name, "addr", addr)?).to_string();
                let mut cfg = GrpcConfig {
                    target,
                    ..GrpcConfig::default()
                };
                if let Some(tls) = m.get("tls") {
                    cfg.tls = Some(tls.as_bool().ok_or_else(|| invalid(name, "tls must be a boolean"))?);
                }
                if let Some(v) = m.get("skipVerify") {
                    cfg.skip_verify = v
                        .as_bool()
                        .ok_or_else(|| invalid(name, "skipVerify must be a boolean"))?;
                }
                if let Some(v) = m.get("cacert") {
                    cfg.cacert = Some(PathBuf::from(as_str(name, "cacert", v)?));
                }
                if let Some(v) = m.get("cert") {
                    cfg.cert = Some(PathBuf::from(as_str(name, "cert", v)?));
                }
                if let Some(v) = m.get("key") {
                    cfg.key = Some(PathBuf::from(as_str(name, "key", v)?));
                }
                if let Some(v) = m.get("importPaths") {
                    cfg.import_paths = as_path_list(name, "importPaths", v)?;
                }
                if let Some(v) = m.get("protos") {
                    cfg.protos = as_path_list(name, "protos", v)?;
                }
                if cfg.cert.is_some() != cfg.key.is_some() {
                    return Err(invalid(name, "cert and key must be configured together"));
                }
                Ok(RunnerConfig::Grpc(cfg))
            } else {
                Err(invalid(
                    name,
                    "mapping must declare one of dsn, endpoint, addr, remote",
                ))
            }
        }
        other => Err(invalid(name, &format!("unsupported declaration: {other}"))),
    }
}

fn parse_runner_target(name: &str, target: &str) -> Result<RunnerConfig, ConfigError> {
    if target.starts_with("http://") || target.starts_with("https://") {
        return Ok(RunnerConfig::Http(HttpConfig {
            endpoint: target.to_string(),
        }));
    }
    if target.starts_with("grpc://") || target.starts_with("grpcs://") {
        return Ok(RunnerConfig::Grpc(GrpcConfig {
            target: strip_grpc_scheme(target).to_string(),
            tls: if target.starts_with("grpc://") {
                Some(false)
            } else {
                None
            },
            ..GrpcConfig::default()
        }));
    }
    if target.starts_with("cdp://") || target.starts_with("chrome://") {
        return Ok(RunnerConfig::Cdp(CdpConfig {
            remote: target.to_string(),
        }));
    }
    if target.contains("://") || target.starts_with("sqlite:") {
        return Ok(RunnerConfig::Db(DbConfig {
            dsn: target.to_string(),
        }));
    }
    Err(invalid(
        name,
        &format!("cannot detect runner protocol from {target:?}"),
    ))
}

fn strip_grpc_scheme(target: &str) -> &str {
    target
        .strip_prefix("grpcs://")
        .or_else(|| target.strip_prefix("grpc://"))
        .unwrap_or(target)
}

fn as_str(name: &str, field: &str, v: &Value) -> Result<String, ConfigError> {
    v.as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(name, &format!("{field} must be a string")))
}

fn as_path_list(name: &str, field: &str, v: &Value) -> Result<Vec<PathBuf>, ConfigError> {
    let items = v
        .as_array()
        .ok_or_else(|| invalid(name, &format!("{field} must be a list")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(PathBuf::from)
                .ok_or_else(|| invalid(name, &format!("{field} entries must be strings")))
        })
        .collect()
}

fn invalid(name: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidRunnerDecl {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sniffs_protocol_from_bare_targets() {
        let http = parse_runner_decl("req", &json!("https://api.example.com")).unwrap();
        assert_eq!(http.kind(), RunnerKind::Http);
        let grpc = parse_runner_decl("greq", &json!("grpc://127.0.0.1:80")).unwrap();
        match grpc {
            RunnerConfig::Grpc(cfg) => {
                assert_eq!(cfg.target, "127.0.0.1:80");
                assert_eq!(cfg.tls, Some(false));
            }
            other => panic!("unexpected: {other:?}"),
        }
        let db = parse_runner_decl("db", &json!("sqlite::memory:")).unwrap();
        assert_eq!(db.kind(), RunnerKind::Db);
        assert!(parse_runner_decl("x", &json!("plainhost")).is_err());
    }

    #[test]
    fn parses_detailed_grpc_mapping() {
        let v = json!({
            "addr": "greeter.example.com:443",
            "skipVerify": true,
            "importPaths": ["proto"],
            "protos": ["proto/greeter.proto"],
        });
        match parse_runner_decl("greq", &v).unwrap() {
            RunnerConfig::Grpc(cfg) => {
                assert_eq!(cfg.target, "greeter.example.com:443");
                assert!(cfg.skip_verify);
                assert_eq!(cfg.protos, vec![PathBuf::from("proto/greeter.proto")]);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cert_requires_key() {
        let v = json!({"addr": "h:443", "cert": "c.pem"});
        assert!(parse_runner_decl("g", &v).is_err());
    }
}
