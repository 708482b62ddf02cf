//! Integration tests for the CLI commands.

use clap::Parser;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tidemark_cli::{run, Args, CliError};

struct TestContext {
    dir: tempfile::TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn data_path(&self) -> PathBuf {
        self.dir.path().join("data")
    }

    fn write_spec(&self, name: &str, spec: Value) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, serde_json::to_string_pretty(&spec).unwrap()).unwrap();
        path
    }

    async fn run(&self, args: &[&str]) -> Result<Value, CliError> {
        let data_path = self.data_path();
        let mut argv = vec!["tidemark", "--data-path", data_path.to_str().unwrap()];
        argv.extend_from_slice(args);
        run(Args::parse_from(argv)).await
    }
}

fn accounts_spec() -> Value {
    json!({
        "name": "create-accounts",
        "version": "1.0.0",
        "operations": [
            {"type": "createTable", "tableName": "accounts",
             "keySchema": [{"attributeName": "id", "keyType": "HASH"}],
             "attributeDefinitions": [{"attributeName": "id", "attributeType": "S"}]},
            {"type": "seedData", "tableName": "accounts",
             "items": [{"id": "a1", "plan": "free"}, {"id": "a2", "plan": "pro"}]},
            {"type": "deleteTable", "tableName": "scratch", "required": false}
        ]
    })
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap()
}

#[tokio::test]
async fn test_validate_and_plan_do_not_open_store() {
    let ctx = TestContext::new();
    let spec = ctx.write_spec("accounts.json", accounts_spec());

    let report = ctx.run(&["validate", path_str(&spec)]).await.unwrap();
    assert_eq!(report["valid"], json!(true));

    let plan = ctx
        .run(&["plan", path_str(&spec), "--env", "staging"])
        .await
        .unwrap();
    assert_eq!(plan["steps"].as_array().map(Vec::len), Some(3));
    assert_eq!(plan["risk"]["score"], json!(4));
    assert_eq!(plan["risk"]["level"], json!("medium"));

    assert!(!ctx.data_path().exists());
}

#[tokio::test]
async fn test_invalid_spec_is_reported() {
    let ctx = TestContext::new();
    let spec = ctx.write_spec(
        "bad.json",
        json!({"name": "", "version": "1.0", "operations": []}),
    );

    let err = ctx.run(&["validate", path_str(&spec)]).await.unwrap_err();
    let CliError::Invalid { errors } = err else {
        panic!("expected an invalid spec error");
    };
    assert_eq!(errors.len(), 2);

    let missing = ctx.dir.path().join("missing.json");
    assert!(matches!(
        ctx.run(&["plan", path_str(&missing)]).await,
        Err(CliError::Read { .. })
    ));
}

#[tokio::test]
async fn test_apply_then_query_history() {
    let ctx = TestContext::new();
    let spec = ctx.write_spec("accounts.json", accounts_spec());

    let migration = ctx.run(&["apply", path_str(&spec)]).await.unwrap();
    assert_eq!(migration["status"], json!("completed"));
    assert_eq!(migration["results"].as_array().map(Vec::len), Some(3));
    assert_eq!(migration["results"][2]["output"]["status"], json!("skipped"));
    let id = migration["id"].as_str().unwrap().to_string();

    let status = ctx.run(&["status", &id]).await.unwrap();
    assert_eq!(status["migrationId"], json!(id));
    assert_eq!(status["operationCount"], json!(3));

    let history = ctx.run(&["history", "--env", "development"]).await.unwrap();
    assert_eq!(history.as_array().map(Vec::len), Some(1));
    let other = ctx.run(&["history", "--env", "production"]).await.unwrap();
    assert_eq!(other, json!([]));

    assert!(matches!(
        ctx.run(&["status", "unknown-id"]).await,
        Err(CliError::Migration(_))
    ));
}

#[tokio::test]
async fn test_failed_apply_is_an_error() {
    let ctx = TestContext::new();
    let spec = ctx.write_spec(
        "broken.json",
        json!({
            "name": "tag-missing",
            "version": "1.0.0",
            "operations": [{"type": "addTags", "tableName": "nope", "tags": {"a": "b"}}]
        }),
    );

    let err = ctx.run(&["apply", path_str(&spec)]).await.unwrap_err();
    assert!(matches!(err, CliError::Failed { .. }));

    let history = ctx.run(&["history"]).await.unwrap();
    assert_eq!(history[0]["status"], json!("failed"));
}
