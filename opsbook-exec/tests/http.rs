use opsbook_core::{parse_book_str, BookFormat};
use opsbook_exec::{Operator, Options};
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn run(src: String) -> Operator {
    let book = parse_book_str(&src, BookFormat::Auto).expect("book should parse");
    let mut op = Operator::new(book, &Options::default()).expect("operator should build");
    op.run().await.expect("run should succeed");
    op
}

#[tokio::test]
async fn get_records_status_headers_and_json_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"username": "alice", "age": 20})),
        )
        .mount(&server)
        .await;

    let op = run(format!(
        r#"
desc: fetch user
runners:
  req: {}
steps:
  - req:
      path: /users/1
  - test: steps[0].res.status == 200 && steps[0].res.body.username == 'alice'
"#,
        server.uri()
    ))
    .await;
    assert_eq!(op.store().steps()[0]["res"]["status"], json!(200));
    assert_eq!(op.store().steps()[0]["res"]["body"]["age"], json!(20));
}

#[tokio::test]
async fn post_sends_expanded_body_headers_and_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(header("x-trace", "t-1"))
        .and(query_param("source", "cli"))
        .and(body_json(json!({"username": "alice"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"token": "abc"})))
        .mount(&server)
        .await;

    let op = run(format!(
        r#"
desc: login
runners:
  req: {}
vars:
  username: alice
steps:
  - req:
      path: /login
      method: POST
      headers:
        x-trace: t-1
      query:
        source: cli
      body:
        username: "{{{{ vars.username }}}}"
  - bind:
      token: steps[0].res.body.token
  - test: token == 'abc'
"#,
        server.uri()
    ))
    .await;
    assert_eq!(op.store().steps()[0]["res"]["status"], json!(201));
}

#[tokio::test]
async fn non_2xx_statuses_are_results_not_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let op = run(format!(
        r#"
desc: not found is fine
runners:
  req: {}
steps:
  - req:
      path: /missing
  - test: steps[0].res.status == 404
"#,
        server.uri()
    ))
    .await;
    assert_eq!(op.store().steps()[0]["res"]["status"], json!(404));
}
