//! gRPC runner: resolves methods dynamically (compiled protos or server
//! reflection) and drives unary plus all three streaming shapes.
//!
//! A non-OK status is a recorded result, never an error; errors are
//! reserved for transport and resolution failures.

mod codec;
mod reflect;
mod registry;
mod tls;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use http::uri::PathAndQuery;
use opsbook_core::book::GrpcConfig;
use opsbook_core::expr::eval_expand;
use opsbook_core::step::parse_duration;
use prost_reflect::{DynamicMessage, MessageDescriptor, MethodDescriptor, SerializeOptions};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::client::Grpc;
use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataValue};
use tonic::transport::Channel;
use tonic::{Request, Status, Streaming};
use tracing::debug;

use crate::capture::CaptureEvent;

use super::{headers_to_value, RunnerError, StepHandle};

use codec::DynamicCodec;

/// Number of files in the process-wide descriptor registry (observability
/// for registration idempotence).
pub fn registered_file_count() -> usize {
    registry::file_count()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcMode {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl fmt::Display for GrpcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GrpcMode::Unary => "unary",
            GrpcMode::ServerStreaming => "server",
            GrpcMode::ClientStreaming => "client",
            GrpcMode::BidiStreaming => "bidi",
        })
    }
}

pub fn mode_of(md: &MethodDescriptor) -> GrpcMode {
    match (md.is_server_streaming(), md.is_client_streaming()) {
        (false, false) => GrpcMode::Unary,
        (true, false) => GrpcMode::ServerStreaming,
        (false, true) => GrpcMode::ClientStreaming,
        (true, true) => GrpcMode::BidiStreaming,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcOp {
    Message,
    Receive,
    Close,
}

#[derive(Debug, Clone)]
pub struct GrpcMessage {
    pub op: GrpcOp,
    /// Raw params; expanded lazily right before each send so values bound
    /// by earlier messages stay visible.
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct GrpcRequest {
    pub service: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub messages: Vec<GrpcMessage>,
    pub timeout: Option<Duration>,
}

pub fn parse_grpc_request(raw: &Map<String, Value>) -> Result<GrpcRequest, RunnerError> {
    let service = raw
        .get("service")
        .and_then(Value::as_str)
        .ok_or_else(|| RunnerError::invalid("grpc", "missing service"))?
        .to_string();
    let method = raw
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| RunnerError::invalid("grpc", "missing method"))?
        .to_string();

    let mut headers = Vec::new();
    if let Some(v) = raw.get("headers") {
        let Value::Object(m) = v else {
            return Err(RunnerError::invalid("grpc", "headers must be a mapping"));
        };
        for (k, v) in m {
            let Some(s) = v.as_str() else {
                return Err(RunnerError::invalid(
                    "grpc",
                    format!("header {k} must be a string"),
                ));
            };
            headers.push((k.clone(), s.to_string()));
        }
    }

    let timeout = raw
        .get("timeout")
        .map(|v| parse_duration(v).map_err(|e| RunnerError::invalid("grpc", e.to_string())))
        .transpose()?;

    let mut messages = Vec::new();
    match (raw.get("messages"), raw.get("message")) {
        (Some(_), Some(_)) => {
            return Err(RunnerError::invalid(
                "grpc",
                "use either message or messages, not both",
            ))
        }
        (Some(Value::Array(items)), None) => {
            for item in items {
                messages.push(parse_message_op(item)?);
            }
        }
        (Some(other), None) => {
            return Err(RunnerError::invalid(
                "grpc",
                format!("messages must be a list, got {other}"),
            ))
        }
        (None, Some(Value::Object(params))) => messages.push(GrpcMessage {
            op: GrpcOp::Message,
            params: params.clone(),
        }),
        (None, Some(other)) => {
            return Err(RunnerError::invalid(
                "grpc",
                format!("message must be a mapping, got {other}"),
            ))
        }
        (None, None) => {}
    }

    for key in raw.keys() {
        if !matches!(
            key.as_str(),
            "service" | "method" | "headers" | "timeout" | "message" | "messages"
        ) {
            return Err(RunnerError::invalid("grpc", format!("unknown field {key:?}")));
        }
    }

    Ok(GrpcRequest {
        service,
        method,
        headers,
        messages,
        timeout,
    })
}

fn parse_message_op(item: &Value) -> Result<GrpcMessage, RunnerError> {
    let Value::Object(m) = item else {
        return Err(RunnerError::invalid(
            "grpc",
            format!("message entry must be a mapping, got {item}"),
        ));
    };
    if m.len() == 1 {
        let (key, v) = match m.iter().next() {
            Some(kv) => kv,
            None => return Err(RunnerError::invalid("grpc", "empty message entry")),
        };
        let op = match key.as_str() {
            "message" => Some(GrpcOp::Message),
            "receive" => Some(GrpcOp::Receive),
            "close" => Some(GrpcOp::Close),
            _ => None,
        };
        if let Some(op) = op {
            let params = match v {
                Value::Object(params) => params.clone(),
                Value::Null => Map::new(),
                other => {
                    return Err(RunnerError::invalid(
                        "grpc",
                        format!("{key} must be a mapping, got {other}"),
                    ))
                }
            };
            return Ok(GrpcMessage { op, params });
        }
    }
    // A plain mapping is shorthand for a send.
    Ok(GrpcMessage {
        op: GrpcOp::Message,
        params: m.clone(),
    })
}

pub struct GrpcRunner {
    name: String,
    cfg: GrpcConfig,
    channel: Option<Channel>,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl GrpcRunner {
    pub fn new(name: &str, cfg: &GrpcConfig) -> Self {
        Self {
            name: name.to_string(),
            cfg: cfg.clone(),
            channel: None,
            methods: BTreeMap::new(),
        }
    }

    /// Idempotent teardown; the next run redials.
    pub fn close(&mut self) {
        self.channel = None;
    }

    pub fn has_connection(&self) -> bool {
        self.channel.is_some()
    }

    pub async fn run(&mut self, h: &mut StepHandle<'_>, r: GrpcRequest) -> Result<(), RunnerError> {
        if self.channel.is_none() {
            debug!(endpoint = %self.cfg.target, "dialing gRPC endpoint");
            self.channel = Some(tls::dial(&self.cfg).await?);
        }
        if self.methods.is_empty() {
            if !self.cfg.import_paths.is_empty() || !self.cfg.protos.is_empty() {
                self.resolve_methods_using_protos()?;
            } else if let Some(channel) = self.channel.clone() {
                reflect::resolve_methods(channel, &mut self.methods).await?;
            }
        }

        let key = format!("{}/{}", r.service, r.method);
        let md = self
            .methods
            .get(&key)
            .cloned()
            .ok_or(RunnerError::MethodNotFound(key))?;
        let mode = mode_of(&md);

        h.capturers
            .capture(CaptureEvent::GrpcStart {
                runner: self.name.clone(),
                mode,
                service: r.service.clone(),
                method: r.method.clone(),
            })
            .await;
        let result = match mode {
            GrpcMode::Unary => self.invoke_unary(&md, &r, h).await,
            GrpcMode::ServerStreaming => self.invoke_server_streaming(&md, &r, h).await,
            GrpcMode::ClientStreaming => self.invoke_client_streaming(&md, &r, h).await,
            GrpcMode::BidiStreaming => self.invoke_bidi_streaming(&md, &r, h).await,
        };
        h.capturers
            .capture(CaptureEvent::GrpcEnd {
                runner: self.name.clone(),
                mode,
                service: r.service,
                method: r.method,
            })
            .await;
        result
    }

    /// Method descriptors resolved so far, keyed `"<service>/<method>"`.
    pub fn methods(&self) -> &BTreeMap<String, MethodDescriptor> {
        &self.methods
    }

    /// Compile the declared proto sources, register them into the
    /// process-wide pool, and index every service method. Works without a
    /// connection; the run path calls this when the table is empty.
    pub fn resolve_methods_using_protos(&mut self) -> Result<(), RunnerError> {
        let includes = if self.cfg.import_paths.is_empty() {
            vec![std::path::PathBuf::from(".")]
        } else {
            self.cfg.import_paths.clone()
        };
        let set = protox::compile(&self.cfg.protos, &includes)
            .map_err(|e| RunnerError::Resolve(e.to_string()))?;
        registry::register_files(&set).map_err(RunnerError::Resolve)?;
        for fd in &set.file {
            let pkg = fd.package();
            for svc in &fd.service {
                let full = if pkg.is_empty() {
                    svc.name().to_string()
                } else {
                    format!("{pkg}.{}", svc.name())
                };
                let Some(sd) = registry::service_by_name(&full) else {
                    continue;
                };
                for method in sd.methods() {
                    let key = format!("{}/{}", sd.full_name(), method.name());
                    self.methods.insert(key, method);
                }
            }
        }
        Ok(())
    }

    async fn invoke_unary(
        &mut self,
        md: &MethodDescriptor,
        r: &GrpcRequest,
        h: &mut StepHandle<'_>,
    ) -> Result<(), RunnerError> {
        if r.messages.len() != 1 || r.messages[0].op != GrpcOp::Message {
            return Err(RunnerError::invalid(
                "grpc",
                "unary RPC takes exactly one message",
            ));
        }
        let deadline = r.timeout.map(|d| Instant::now() + d);
        h.capturers
            .capture(CaptureEvent::GrpcRequestHeaders(pairs_to_value(&r.headers)))
            .await;

        let msg = build_message(h, md.input(), &r.messages[0].params).await?;
        let mut grpc = self.client().await?;
        let mut request = Request::new(msg);
        apply_headers(&mut request, &r.headers)?;

        let outcome = with_deadline(
            deadline,
            grpc.unary(request, method_path(md)?, DynamicCodec::new(md.output())),
        )
        .await;

        let mut res = GrpcResult::default();
        match outcome {
            Ok(resp) => {
                res.status = 0;
                res.headers = metadata_to_value(resp.metadata());
                h.capturers.capture(CaptureEvent::GrpcResponseStatus(0)).await;
                h.capturers
                    .capture(CaptureEvent::GrpcResponseHeaders(res.headers.clone()))
                    .await;
                let m = message_to_json(&resp.into_inner())?;
                h.capturers
                    .capture(CaptureEvent::GrpcResponseMessage(m.clone()))
                    .await;
                res.message = m.clone();
                res.messages.push(m);
            }
            Err(status) => {
                res.set_status(h, &status).await;
                res.trailers = metadata_to_value(status.metadata());
            }
        }
        h.capturers
            .capture(CaptureEvent::GrpcResponseTrailers(res.trailers.clone()))
            .await;
        res.record(h);
        Ok(())
    }

    async fn invoke_server_streaming(
        &mut self,
        md: &MethodDescriptor,
        r: &GrpcRequest,
        h: &mut StepHandle<'_>,
    ) -> Result<(), RunnerError> {
        if r.messages.len() != 1 || r.messages[0].op != GrpcOp::Message {
            return Err(RunnerError::invalid(
                "grpc",
                "server streaming RPC takes exactly one message",
            ));
        }
        let deadline = r.timeout.map(|d| Instant::now() + d);
        h.capturers
            .capture(CaptureEvent::GrpcRequestHeaders(pairs_to_value(&r.headers)))
            .await;

        let msg = build_message(h, md.input(), &r.messages[0].params).await?;
        let mut grpc = self.client().await?;
        let mut request = Request::new(msg);
        apply_headers(&mut request, &r.headers)?;

        let outcome = with_deadline(
            deadline,
            grpc.server_streaming(request, method_path(md)?, DynamicCodec::new(md.output())),
        )
        .await;

        let mut res = GrpcResult::default();
        let mut inbound = match outcome {
            Ok(resp) => {
                res.headers = metadata_to_value(resp.metadata());
                h.capturers
                    .capture(CaptureEvent::GrpcResponseHeaders(res.headers.clone()))
                    .await;
                resp.into_inner()
            }
            Err(status) => {
                res.set_status(h, &status).await;
                res.trailers = metadata_to_value(status.metadata());
                res.record(h);
                return Ok(());
            }
        };

        loop {
            match recv_message(&mut inbound, deadline).await {
                Recv::Message(m) => {
                    res.status = 0;
                    let m = message_to_json(&m)?;
                    h.capturers.capture(CaptureEvent::GrpcResponseStatus(0)).await;
                    h.capturers
                        .capture(CaptureEvent::GrpcResponseMessage(m.clone()))
                        .await;
                    res.message = m.clone();
                    res.messages.push(m);
                }
                Recv::Eof | Recv::TimedOut => break,
                Recv::Failed(status) => {
                    res.set_status(h, &status).await;
                    break;
                }
            }
        }

        if let Ok(Some(trailers)) = inbound.trailers().await {
            res.trailers = metadata_to_value(&trailers);
        }
        h.capturers
            .capture(CaptureEvent::GrpcResponseTrailers(res.trailers.clone()))
            .await;
        res.record(h);
        Ok(())
    }

    async fn invoke_client_streaming(
        &mut self,
        md: &MethodDescriptor,
        r: &GrpcRequest,
        h: &mut StepHandle<'_>,
    ) -> Result<(), RunnerError> {
        let deadline = r.timeout.map(|d| Instant::now() + d);
        h.capturers
            .capture(CaptureEvent::GrpcRequestHeaders(pairs_to_value(&r.headers)))
            .await;

        let mut msgs = Vec::new();
        for m in &r.messages {
            match m.op {
                GrpcOp::Message => msgs.push(build_message(h, md.input(), &m.params).await?),
                // Accepted but ignored: the stream always closes after the
                // send loop.
                GrpcOp::Close => {}
                GrpcOp::Receive => {
                    return Err(RunnerError::invalid(
                        "grpc",
                        "receive is not supported in client streaming",
                    ))
                }
            }
        }

        let mut grpc = self.client().await?;
        let mut request = Request::new(tokio_stream::iter(msgs));
        apply_headers(&mut request, &r.headers)?;

        let outcome = with_deadline(
            deadline,
            grpc.client_streaming(request, method_path(md)?, DynamicCodec::new(md.output())),
        )
        .await;

        let mut res = GrpcResult::default();
        match outcome {
            Ok(resp) => {
                res.status = 0;
                res.headers = metadata_to_value(resp.metadata());
                h.capturers.capture(CaptureEvent::GrpcResponseStatus(0)).await;
                h.capturers
                    .capture(CaptureEvent::GrpcResponseHeaders(res.headers.clone()))
                    .await;
                let m = message_to_json(&resp.into_inner())?;
                h.capturers
                    .capture(CaptureEvent::GrpcResponseMessage(m.clone()))
                    .await;
                res.message = m.clone();
                res.messages.push(m);
            }
            Err(status) => {
                res.set_status(h, &status).await;
                res.trailers = metadata_to_value(status.metadata());
            }
        }
        h.capturers
            .capture(CaptureEvent::GrpcResponseTrailers(res.trailers.clone()))
            .await;
        res.record(h);
        Ok(())
    }

    async fn invoke_bidi_streaming(
        &mut self,
        md: &MethodDescriptor,
        r: &GrpcRequest,
        h: &mut StepHandle<'_>,
    ) -> Result<(), RunnerError> {
        if r.timeout.is_some() {
            return Err(RunnerError::invalid(
                "grpc",
                "timeout is not supported for bidirectional streaming",
            ));
        }
        h.capturers
            .capture(CaptureEvent::GrpcRequestHeaders(pairs_to_value(&r.headers)))
            .await;

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<DynamicMessage>();
        let mut grpc = self.client().await?;
        let mut request = Request::new(UnboundedReceiverStream::new(rx));
        apply_headers(&mut request, &r.headers)?;

        let mut res = GrpcResult::default();
        let mut inbound = match grpc
            .streaming(request, method_path(md)?, DynamicCodec::new(md.output()))
            .await
        {
            Ok(resp) => {
                res.headers = metadata_to_value(resp.metadata());
                h.capturers
                    .capture(CaptureEvent::GrpcResponseHeaders(res.headers.clone()))
                    .await;
                resp.into_inner()
            }
            Err(status) => {
                res.set_status(h, &status).await;
                res.trailers = metadata_to_value(status.metadata());
                self.channel = None;
                res.record(h);
                return Ok(());
            }
        };

        // Ops run in declared order: send, blocking receive, client close.
        let mut tx = Some(tx);
        let mut client_closed = false;
        let mut send_failed = false;
        'ops: for m in &r.messages {
            match m.op {
                GrpcOp::Message => {
                    let msg = build_message(h, md.input(), &m.params).await?;
                    match &tx {
                        Some(sender) => {
                            if sender.send(msg).is_err() {
                                send_failed = true;
                                break 'ops;
                            }
                        }
                        None => break 'ops,
                    }
                }
                GrpcOp::Receive => match inbound.message().await {
                    Ok(Some(m)) => {
                        res.status = 0;
                        let m = message_to_json(&m)?;
                        h.capturers.capture(CaptureEvent::GrpcResponseStatus(0)).await;
                        h.capturers
                            .capture(CaptureEvent::GrpcResponseMessage(m.clone()))
                            .await;
                        res.message = m.clone();
                        res.messages.push(m);
                    }
                    Ok(None) => break 'ops,
                    Err(status) => {
                        res.set_status(h, &status).await;
                    }
                },
                GrpcOp::Close => {
                    // Dropping the sender half-closes the stream; dropping
                    // is inherently idempotent, unlike an explicit close.
                    tx = None;
                    client_closed = true;
                    h.capturers.capture(CaptureEvent::GrpcClientClose).await;
                    break 'ops;
                }
            }
        }

        if client_closed {
            // Drain to EOF. Recv failures here collapse into termination.
            loop {
                match inbound.message().await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        } else if !send_failed {
            // Send side stays open while the server finishes talking.
            loop {
                match inbound.message().await {
                    Ok(Some(m)) => {
                        res.status = 0;
                        let m = message_to_json(&m)?;
                        h.capturers.capture(CaptureEvent::GrpcResponseStatus(0)).await;
                        h.capturers
                            .capture(CaptureEvent::GrpcResponseMessage(m.clone()))
                            .await;
                        res.message = m.clone();
                        res.messages.push(m);
                    }
                    Ok(None) => break,
                    Err(status) => {
                        res.set_status(h, &status).await;
                        break;
                    }
                }
            }
        }
        drop(tx);

        // Tearing the connection down before reading trailers avoids a race
        // between stream teardown and trailer delivery; the next step on
        // this runner redials.
        self.channel = None;
        if let Ok(Some(trailers)) = inbound.trailers().await {
            res.trailers = metadata_to_value(&trailers);
        }
        h.capturers
            .capture(CaptureEvent::GrpcResponseTrailers(res.trailers.clone()))
            .await;
        res.record(h);
        Ok(())
    }

    async fn client(&self) -> Result<Grpc<Channel>, RunnerError> {
        let channel = self
            .channel
            .clone()
            .ok_or_else(|| RunnerError::Connect("connection is not established".to_string()))?;
        let mut grpc = Grpc::new(channel);
        grpc.ready()
            .await
            .map_err(|e| RunnerError::Transport(e.to_string()))?;
        Ok(grpc)
    }
}

/// The single result mapping every mode records under `res`.
#[derive(Debug, Default)]
struct GrpcResult {
    status: i32,
    headers: Value,
    trailers: Value,
    message: Value,
    messages: Vec<Value>,
}

impl GrpcResult {
    async fn set_status(&mut self, h: &mut StepHandle<'_>, status: &Status) {
        self.status = status.code() as i32;
        self.message = Value::String(status.message().to_string());
        h.capturers
            .capture(CaptureEvent::GrpcResponseStatus(self.status))
            .await;
    }

    fn record(self, h: &mut StepHandle<'_>) {
        let mut res = Map::new();
        res.insert("status".to_string(), Value::from(self.status));
        res.insert(
            "headers".to_string(),
            ensure_object(self.headers),
        );
        res.insert(
            "trailers".to_string(),
            ensure_object(self.trailers),
        );
        res.insert("message".to_string(), self.message);
        res.insert("messages".to_string(), Value::Array(self.messages));
        let mut record = Map::new();
        record.insert("res".to_string(), Value::Object(res));
        h.store.record(record);
    }
}

fn ensure_object(v: Value) -> Value {
    match v {
        Value::Object(_) => v,
        _ => Value::Object(Map::new()),
    }
}

enum Recv {
    Message(DynamicMessage),
    Eof,
    Failed(Status),
    TimedOut,
}

async fn recv_message(inbound: &mut Streaming<DynamicMessage>, deadline: Option<Instant>) -> Recv {
    let next = match deadline {
        Some(d) => match tokio::time::timeout_at(d, inbound.message()).await {
            Ok(r) => r,
            Err(_) => return Recv::TimedOut,
        },
        None => inbound.message().await,
    };
    match next {
        Ok(Some(m)) => Recv::Message(m),
        Ok(None) => Recv::Eof,
        Err(status) => Recv::Failed(status),
    }
}

async fn with_deadline<T>(
    deadline: Option<Instant>,
    fut: impl std::future::Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    match deadline {
        Some(d) => match tokio::time::timeout_at(d, fut).await {
            Ok(r) => r,
            Err(_) => Err(Status::deadline_exceeded("request timed out")),
        },
        None => fut.await,
    }
}

/// Expand the params against the current snapshot and shape them into the
/// request message through the canonical proto-JSON form.
async fn build_message(
    h: &mut StepHandle<'_>,
    input: MessageDescriptor,
    params: &Map<String, Value>,
) -> Result<DynamicMessage, RunnerError> {
    let snapshot = h.store.to_map();
    let env = h.store.env(&snapshot);
    let expanded = eval_expand(&Value::Object(params.clone()), &env)?;
    h.capturers
        .capture(CaptureEvent::GrpcRequestMessage(expanded.clone()))
        .await;
    DynamicMessage::deserialize(input, expanded)
        .map_err(|e| RunnerError::invalid("grpc", format!("incompatible message shape: {e}")))
}

/// Proto to JSON with proto names, enum numbers, and unpopulated fields
/// emitted.
fn message_to_json(msg: &DynamicMessage) -> Result<Value, RunnerError> {
    let options = SerializeOptions::new()
        .use_proto_field_name(true)
        .use_enum_numbers(true)
        .skip_default_fields(false);
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::new(&mut buf);
    msg.serialize_with_options(&mut ser, &options)
        .map_err(|e| RunnerError::Transport(e.to_string()))?;
    serde_json::from_slice(&buf).map_err(|e| RunnerError::Transport(e.to_string()))
}

fn method_path(md: &MethodDescriptor) -> Result<PathAndQuery, RunnerError> {
    let service = md.parent_service().full_name().to_string();
    format!("/{service}/{}", md.name())
        .parse::<PathAndQuery>()
        .map_err(|e| RunnerError::invalid("grpc", e.to_string()))
}

fn apply_headers<T>(request: &mut Request<T>, headers: &[(String, String)]) -> Result<(), RunnerError> {
    for (k, v) in headers {
        let key: MetadataKey<Ascii> = MetadataKey::from_bytes(k.as_bytes())
            .map_err(|e| RunnerError::invalid("grpc", format!("bad header name {k:?}: {e}")))?;
        let value: MetadataValue<Ascii> = v
            .parse()
            .map_err(|_| RunnerError::invalid("grpc", format!("bad header value for {k:?}")))?;
        request.metadata_mut().append(key, value);
    }
    Ok(())
}

fn pairs_to_value(pairs: &[(String, String)]) -> Value {
    headers_to_value(pairs.iter().map(|(k, v)| (k.as_str(), v.clone())))
}

fn metadata_to_value(md: &tonic::metadata::MetadataMap) -> Value {
    headers_to_value(md.iter().filter_map(|kv| match kv {
        KeyAndValueRef::Ascii(k, v) => v.to_str().ok().map(|s| (k.as_str(), s.to_string())),
        KeyAndValueRef::Binary(..) => None,
    }))
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
    fn parses_ordered_message_ops() {
        let raw = obj(json!({
            "service": "pkg.Svc",
            "method": "Chat",
            "messages": [
                {"message": {"text": "hello"}},
                {"receive": {}},
                {"close": {}},
            ],
        }));
        let r = parse_grpc_request(&raw).unwrap();
        let ops: Vec<GrpcOp> = r.messages.iter().map(|m| m.op).collect();
        assert_eq!(ops, vec![GrpcOp::Message, GrpcOp::Receive, GrpcOp::Close]);
    }

    #[test]
    fn bare_mapping_is_a_send() {
        let raw = obj(json!({
            "service": "pkg.Svc",
            "method": "Echo",
            "message": {"msg": "hi"},
        }));
        let r = parse_grpc_request(&raw).unwrap();
        assert_eq!(r.messages.len(), 1);
        assert_eq!(r.messages[0].op, GrpcOp::Message);
        assert_eq!(r.messages[0].params["msg"], json!("hi"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = obj(json!({"service": "s", "method": "m", "nope": 1}));
        assert!(parse_grpc_request(&raw).is_err());
    }

    #[test]
    fn result_shape_matches_recording_contract() {
        let res = GrpcResult {
            status: 0,
            headers: json!({"ct": ["grpc"]}),
            trailers: Value::Null,
            message: json!({"msg": "hi"}),
            messages: vec![json!({"msg": "hi"})],
        };
        let mut record = Map::new();
        record.insert("res".to_string(), {
            let mut m = Map::new();
            m.insert("status".to_string(), Value::from(res.status));
            m.insert("headers".to_string(), ensure_object(res.headers));
            m.insert("trailers".to_string(), ensure_object(res.trailers));
            m.insert("message".to_string(), res.message);
            m.insert("messages".to_string(), Value::Array(res.messages));
            Value::Object(m)
        });
        let v = Value::Object(record);
        assert_eq!(v["res"]["status"], json!(0));
        assert_eq!(v["res"]["message"], json!({"msg": "hi"}));
        assert_eq!(v["res"]["messages"], json!([{"msg": "hi"}]));
        assert_eq!(v["res"]["trailers"], json!({}));
    }
}
