use opsbook_core::{parse_book_str, BookFormat};
use opsbook_exec::{Operator, Options};
use serde_json::json;

async fn run(src: &str) -> Operator {
    let book = parse_book_str(src, BookFormat::Auto).expect("book should parse");
    let mut op = Operator::new(book, &Options::default()).expect("operator should build");
    op.run().await.expect("run should succeed");
    op
}

#[tokio::test]
async fn insert_records_last_insert_id_and_rows_affected() {
    let op = run(r#"
desc: insert
runners:
  db: "sqlite::memory:"
steps:
  - db:
      stmt: |
        CREATE TABLE users (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          username TEXT UNIQUE NOT NULL
        );
        INSERT INTO users (username) VALUES ('alice');
"#)
    .await;
    assert_eq!(
        op.store().steps()[0],
        json!({"last_insert_id": 1, "rows_affected": 1, "run": true})
    );
}

#[tokio::test]
async fn select_records_rows_from_the_last_statement() {
    let op = run(r#"
desc: select
runners:
  db: "sqlite::memory:"
steps:
  - db:
      stmt: |
        CREATE TABLE users (
          id INTEGER PRIMARY KEY AUTOINCREMENT,
          username TEXT UNIQUE NOT NULL
        );
        INSERT INTO users (username) VALUES ('alice');
        SELECT COUNT(*) AS count FROM users;
  - test: steps[0].rows[0].count == 1
"#)
    .await;
    assert_eq!(op.store().steps()[0]["rows"], json!([{"count": 1}]));
}

#[tokio::test]
async fn statements_share_one_connection_across_steps() {
    let op = run(r#"
desc: two steps, one db
runners:
  db: "sqlite::memory:"
steps:
  - db:
      stmt: |
        CREATE TABLE kv (k TEXT, v TEXT);
        INSERT INTO kv VALUES ('a', '1');
  - db:
      stmt: SELECT v FROM kv WHERE k = 'a';
  - test: steps[1].rows[0].v == '1'
"#)
    .await;
    assert_eq!(op.store().steps()[1]["rows"], json!([{"v": "1"}]));
}

#[tokio::test]
async fn json_columns_decode_into_structures() {
    let op = run(r#"
desc: json column
runners:
  db: "sqlite::memory:"
steps:
  - db:
      stmt: |
        CREATE TABLE users (username TEXT, info JSON);
        INSERT INTO users VALUES ('alice', '{"age": 20, "address": {"city": "Tokyo"}}');
        SELECT * FROM users;
  - test: steps[0].rows[0].info.address.city == 'Tokyo'
"#)
    .await;
    let row = &op.store().steps()[0]["rows"][0];
    assert_eq!(row["username"], json!("alice"));
    assert_eq!(row["info"]["age"], json!(20));
}
