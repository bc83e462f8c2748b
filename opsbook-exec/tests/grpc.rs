use opsbook_core::book::GrpcConfig;
use opsbook_exec::runner::grpc::{mode_of, registered_file_count, GrpcMode, GrpcRunner};

const GREETER_PROTO: &str = r#"
syntax = "proto3";

package opsbook.test;

message Ping {
  string msg = 1;
}

message Pong {
  string msg = 1;
  int32 n = 2;
}

service Greeter {
  rpc Echo(Ping) returns (Pong);
  rpc Watch(Ping) returns (stream Pong);
  rpc Collect(stream Ping) returns (Pong);
  rpc Chat(stream Ping) returns (stream Pong);
}
"#;

fn runner_with_proto(dir: &std::path::Path) -> GrpcRunner {
    std::fs::write(dir.join("greeter.proto"), GREETER_PROTO).unwrap();
    let cfg = GrpcConfig {
        target: "127.0.0.1:50051".to_string(),
        import_paths: vec![dir.to_path_buf()],
        protos: vec![dir.join("greeter.proto")],
        ..GrpcConfig::default()
    };
    GrpcRunner::new("greq", &cfg)
}

#[test]
fn resolves_all_methods_from_proto_sources() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner_with_proto(dir.path());
    runner.resolve_methods_using_protos().unwrap();
    let keys: Vec<&str> = runner.methods().keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        vec![
            "opsbook.test.Greeter/Chat",
            "opsbook.test.Greeter/Collect",
            "opsbook.test.Greeter/Echo",
            "opsbook.test.Greeter/Watch",
        ]
    );
}

#[test]
fn dispatch_mode_follows_the_streaming_flags() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner_with_proto(dir.path());
    runner.resolve_methods_using_protos().unwrap();
    let mode = |name: &str| mode_of(&runner.methods()[&format!("opsbook.test.Greeter/{name}")]);
    assert_eq!(mode("Echo"), GrpcMode::Unary);
    assert_eq!(mode("Watch"), GrpcMode::ServerStreaming);
    assert_eq!(mode("Collect"), GrpcMode::ClientStreaming);
    assert_eq!(mode("Chat"), GrpcMode::BidiStreaming);
}

#[test]
fn registration_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner_with_proto(dir.path());
    runner.resolve_methods_using_protos().unwrap();
    let first_keys: Vec<String> = runner.methods().keys().cloned().collect();
    let files_after_first = registered_file_count();

    // Same sources again, on a fresh runner: same table, unchanged registry.
    let mut again = runner_with_proto(dir.path());
    again.resolve_methods_using_protos().unwrap();
    let second_keys: Vec<String> = again.methods().keys().cloned().collect();
    assert_eq!(first_keys, second_keys);
    assert_eq!(registered_file_count(), files_after_first);
}

#[test]
fn close_is_idempotent_and_leaves_no_connection() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner_with_proto(dir.path());
    assert!(!runner.has_connection());
    runner.close();
    runner.close();
    assert!(!runner.has_connection());
}

#[test]
fn colliding_top_level_symbols_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut runner = runner_with_proto(dir.path());
    runner.resolve_methods_using_protos().unwrap();

    // A different file redefining the same service would collide; it is
    // skipped, and the original descriptors stay authoritative.
    let other = tempfile::tempdir().unwrap();
    std::fs::write(other.path().join("collide.proto"), GREETER_PROTO).unwrap();
    let cfg = GrpcConfig {
        target: "127.0.0.1:50051".to_string(),
        import_paths: vec![other.path().to_path_buf()],
        protos: vec![other.path().join("collide.proto")],
        ..GrpcConfig::default()
    };
    let before = registered_file_count();
    let mut colliding = GrpcRunner::new("greq2", &cfg);
    colliding.resolve_methods_using_protos().unwrap();
    assert_eq!(registered_file_count(), before);
    assert!(colliding
        .methods()
        .contains_key("opsbook.test.Greeter/Echo"));
}
