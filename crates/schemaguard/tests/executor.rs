//! Gated execution through the executor.

mod common;

use std::sync::Arc;

use schemaguard::prelude::*;
use schemaguard_core::change::{PreflightQuery, RiskLevel};
use serde_json::json;

use common::statements;

fn executor(backend: &Arc<InMemoryBackend>) -> Executor {
    Executor::new(backend.clone())
}

#[tokio::test]
async fn test_destructive_without_phrase_runs_nothing() {
    let backend = Arc::new(InMemoryBackend::new(json!({})));
    let exec = executor(&backend);

    for phrase in ["allow destructive changes", "ALLOW DESTRUCTIVE CHANGES ", ""] {
        let err = exec
            .execute(
                &statements(&["ALTER TABLE t ALTER COLUMN a SET NOT NULL"]),
                &ExecuteOptions::destructive(phrase),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Validation(_)), "{phrase:?}");
    }

    let missing = ExecuteOptions {
        allow_destructive: true,
        confirmation_phrase: None,
    };
    assert!(matches!(
        exec.execute(&statements(&["DROP TABLE t"]), &missing).await,
        Err(MigrateError::Validation(_))
    ));

    assert_eq!(backend.rpc_calls(), 0);
    assert!(backend.executed().is_empty());
}

#[tokio::test]
async fn test_partial_failure_reports_each_statement() {
    let backend = Arc::new(
        InMemoryBackend::new(json!({})).fail_statement(
            "CREATE POLICY b ON t",
            StatementError::new("relation \"t\" does not exist", "42P01"),
        ),
    );
    let outcomes = executor(&backend)
        .execute(
            &statements(&[
                "CREATE POLICY a ON t;",
                "CREATE POLICY b ON t;",
                "CREATE POLICY c ON t;",
            ]),
            &ExecuteOptions::safe(),
        )
        .await
        .unwrap();

    let oks: Vec<bool> = outcomes.iter().map(|o| o.ok).collect();
    assert_eq!(oks, [true, false, true]);
    assert_eq!(
        outcomes[1].error.as_ref().unwrap().code.as_deref(),
        Some("42P01")
    );
    assert_eq!(backend.executed(), ["CREATE POLICY a ON t", "CREATE POLICY c ON t"]);
    assert_eq!(backend.rpc_calls(), 1);
}

#[tokio::test]
async fn test_client_rejection_keeps_batch_position() {
    let backend = Arc::new(InMemoryBackend::new(json!({})));
    let outcomes = executor(&backend)
        .execute(
            &statements(&[
                "CREATE EXTENSION IF NOT EXISTS \"pgcrypto\"",
                "DROP TABLE \"Students\"",
                "ALTER TABLE t ENABLE ROW LEVEL SECURITY",
            ]),
            &ExecuteOptions::safe(),
        )
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].ok);
    assert!(!outcomes[1].ok);
    assert_eq!(outcomes[1].statement, "DROP TABLE \"Students\"");
    assert_eq!(
        outcomes[1].error.as_ref().unwrap().code.as_deref(),
        Some("42501")
    );
    assert!(outcomes[2].ok);
    assert_eq!(backend.executed().len(), 2);
}

#[tokio::test]
async fn test_all_rejected_skips_the_call() {
    let backend = Arc::new(InMemoryBackend::new(json!({})));
    let outcomes = executor(&backend)
        .execute(
            &statements(&["ALTER TABLE t RENAME TO u"]),
            &ExecuteOptions::safe(),
        )
        .await
        .unwrap();
    assert!(!outcomes[0].ok);
    assert_eq!(backend.rpc_calls(), 0);
}

#[tokio::test]
async fn test_destructive_mode_allows_drop_with_phrase() {
    let backend = Arc::new(InMemoryBackend::new(json!({})));
    let outcomes = executor(&backend)
        .execute(
            &statements(&["ALTER TABLE t ALTER COLUMN a SET NOT NULL;"]),
            &ExecuteOptions::destructive("ALLOW DESTRUCTIVE CHANGES"),
        )
        .await
        .unwrap();
    assert!(outcomes[0].ok);
    assert_eq!(backend.executed(), ["ALTER TABLE t ALTER COLUMN a SET NOT NULL"]);
}

#[tokio::test]
async fn test_dry_run_does_not_call_backend() {
    let backend = Arc::new(InMemoryBackend::new(json!({})));
    let exec = executor(&backend).dry_run(true);
    assert!(exec.is_dry_run());

    let outcomes = exec
        .execute(
            &statements(&["CREATE POLICY a ON t", "DROP TABLE t"]),
            &ExecuteOptions::safe(),
        )
        .await
        .unwrap();
    assert!(outcomes[0].ok);
    assert!(!outcomes[1].ok);
    assert_eq!(backend.rpc_calls(), 0);
}

#[tokio::test]
async fn test_preflight_rejects_non_select() {
    let backend = Arc::new(
        InMemoryBackend::new(json!({}))
            .query_rows("SELECT count(*) FROM t", vec![json!({"count": 4})]),
    );
    let queries = vec![
        PreflightQuery {
            id: "preflight:a".into(),
            risk_level: RiskLevel::Caution,
            description: "a".into(),
            sql: "SELECT count(*) FROM t".into(),
        },
        PreflightQuery {
            id: "preflight:b".into(),
            risk_level: RiskLevel::Caution,
            description: "b".into(),
            sql: "DELETE FROM t".into(),
        },
    ];
    let results = executor(&backend).run_preflight(&queries).await.unwrap();

    assert!(results[0].ok);
    assert_eq!(results[0].rows, [json!({"count": 4})]);
    assert!(!results[1].ok);
    assert_eq!(backend.queried(), ["SELECT count(*) FROM t"]);
}

#[tokio::test]
async fn test_not_bootstrapped_carries_remediation() {
    let backend = Arc::new(InMemoryBackend::not_bootstrapped());
    let err = executor(&backend).introspect().await.unwrap_err();
    assert!(err.is_not_bootstrapped());
    let MigrateError::NotBootstrapped { remediation_sql, .. } = err else {
        panic!("expected NotBootstrapped");
    };
    assert!(remediation_sql.contains("schema_introspection_v1"));
    assert!(remediation_sql.contains("SECURITY DEFINER"));
}
