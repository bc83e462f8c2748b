//! Method resolution through the server reflection service.

use std::collections::BTreeMap;

use prost::Message;
use prost_reflect::MethodDescriptor;
use prost_types::{FileDescriptorProto, FileDescriptorSet};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::transport::Channel;
use tonic_reflection::pb::v1::server_reflection_client::ServerReflectionClient;
use tonic_reflection::pb::v1::server_reflection_request::MessageRequest;
use tonic_reflection::pb::v1::server_reflection_response::MessageResponse;
use tonic_reflection::pb::v1::ServerReflectionRequest;

use super::registry;
use crate::runner::RunnerError;

/// Discover every service the endpoint advertises and fill `methods` keyed
/// by `"<service full name>/<method>"`. Known services resolve from the
/// process-wide registry first; unknown ones go through
/// `FileContainingSymbol`, get registered, and are looked up again.
pub(crate) async fn resolve_methods(
    channel: Channel,
    methods: &mut BTreeMap<String, MethodDescriptor>,
) -> Result<(), RunnerError> {
    let mut client = ServerReflectionClient::new(channel);
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let mut inbound = client
        .server_reflection_info(UnboundedReceiverStream::new(rx))
        .await
        .map_err(|s| RunnerError::Resolve(s.to_string()))?
        .into_inner();

    send(&tx, MessageRequest::ListServices(String::new()))?;
    let services = match receive(&mut inbound).await? {
        MessageResponse::ListServicesResponse(list) => {
            list.service.into_iter().map(|s| s.name).collect::<Vec<_>>()
        }
        other => {
            return Err(RunnerError::Resolve(format!(
                "unexpected reflection response: {other:?}"
            )))
        }
    };

    for service in services {
        let sd = match registry::service_by_name(&service) {
            Some(sd) => sd,
            None => {
                send(&tx, MessageRequest::FileContainingSymbol(service.clone()))?;
                let files = match receive(&mut inbound).await? {
                    MessageResponse::FileDescriptorResponse(r) => r.file_descriptor_proto,
                    other => {
                        return Err(RunnerError::Resolve(format!(
                            "unexpected reflection response: {other:?}"
                        )))
                    }
                };
                let mut set = FileDescriptorSet::default();
                for buf in files {
                    let fd = FileDescriptorProto::decode(buf.as_slice())
                        .map_err(|e| RunnerError::Resolve(e.to_string()))?;
                    set.file.push(fd);
                }
                registry::register_files(&set).map_err(RunnerError::Resolve)?;
                registry::service_by_name(&service).ok_or_else(|| {
                    RunnerError::Resolve(format!("cannot find service: {service}"))
                })?
            }
        };
        for method in sd.methods() {
            let key = format!("{}/{}", sd.full_name(), method.name());
            methods.insert(key, method);
        }
    }
    Ok(())
}

fn send(
    tx: &tokio::sync::mpsc::UnboundedSender<ServerReflectionRequest>,
    req: MessageRequest,
) -> Result<(), RunnerError> {
    tx.send(ServerReflectionRequest {
        host: String::new(),
        message_request: Some(req),
    })
    .map_err(|_| RunnerError::Resolve("reflection stream closed".to_string()))
}

async fn receive(
    inbound: &mut tonic::Streaming<tonic_reflection::pb::v1::ServerReflectionResponse>,
) -> Result<MessageResponse, RunnerError> {
    let msg = inbound
        .message()
        .await
        .map_err(|s| RunnerError::Resolve(s.to_string()))?
        .ok_or_else(|| RunnerError::Resolve("reflection stream ended early".to_string()))?;
    msg.message_response
        .ok_or_else(|| RunnerError::Resolve("empty reflection response".to_string()))
}
