//! End-to-end tests exercising the `ContextEngine` contract and the
//! Retrieval/Integrity subsystems together, grounded on the six scenarios in
//! spec §8 ("Concrete end-to-end scenarios").

use std::sync::Arc;

use lcm::compaction::{CompactionTarget, FixedSummarizer};
use lcm::config::LcmConfig;
use lcm::engine::{ContextEngine, FacadeCompactParams, IngestMessage, IngestParams, LcmEngine};
use lcm::integrity::ViolationCode;
use lcm::model::{ContextItemKind, Role};
use lcm::retrieval::auth::IssueGrantParams;
use lcm::retrieval::{ExpandParams, GrepMode, GrepParams, GrepScope};

fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn config_in(dir: &tempfile::TempDir) -> LcmConfig {
    LcmConfig {
        database_path: dir.path().join("lcm.sqlite"),
        fresh_tail_count: 2,
        leaf_batch_size: 6,
        condensed_batch_size: 3,
        ..Default::default()
    }
}

fn engine_in(dir: &tempfile::TempDir) -> LcmEngine {
    LcmEngine::new(config_in(dir), Arc::new(FixedSummarizer::default()))
}

/// Scenario 1: ingest roundtrip.
#[tokio::test]
async fn test_ingest_roundtrip_preserves_ordinal_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    for (role, text) in [
        (Role::User, "hi"),
        (Role::Assistant, "hello"),
        (Role::Tool, "result"),
        (Role::Assistant, "done"),
    ] {
        engine
            .ingest(IngestParams {
                session_id: "conv-1".into(),
                message: IngestMessage::new(role, text),
                agent_id: None,
                is_heartbeat: false,
            })
            .await
            .unwrap();
    }

    let store = engine.get_conversation_store().await.unwrap();
    let messages = store.list_messages("conv-1", None, None, false).await.unwrap();
    assert_eq!(messages.iter().map(|m| m.ordinal).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(
        messages.iter().map(|m| m.content_text.clone()).collect::<Vec<_>>(),
        vec!["hi", "hello", "result", "done"]
    );

    let items = store.get_context_items("conv-1", false, None, None).await.unwrap();
    assert_eq!(items.len(), 4);
    assert!(items.iter().all(|i| i.item_type == ContextItemKind::Message));
}

/// Scenario 2: compaction produces a lineage-linked leaf summary, tombstones
/// its sources, and `getSummaryMessages` can recover them.
#[tokio::test]
async fn test_compaction_produces_lineage_and_recoverable_sources() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    for i in 0..12 {
        engine
            .ingest(IngestParams {
                session_id: "conv-2".into(),
                message: IngestMessage::new(Role::User, "x".repeat(400 + i)),
                agent_id: None,
                is_heartbeat: true, // avoid autocompact firing mid-loop; compact explicitly below
            })
            .await
            .unwrap();
    }

    let outcome = engine
        .compact(FacadeCompactParams {
            session_id: "conv-2".into(),
            session_file: None,
            current_token_count: None,
            compaction_target: CompactionTarget::Budget,
            custom_instructions: None,
            token_budget: Some(50),
        })
        .await
        .unwrap();
    assert!(outcome.ok);
    assert!(outcome.compacted);
    let result = outcome.result.unwrap();
    assert!(result.details.leaf_summaries_created >= 1);
    assert!(result.details.items_tombstoned >= 1);

    let store = engine.get_conversation_store().await.unwrap();
    let active = store.get_context_items("conv-2", false, None, None).await.unwrap();
    let summary = active.iter().find(|i| i.item_type == ContextItemKind::Summary).unwrap();

    let sources = store.get_summary_messages(&summary.item_id, 100).await.unwrap();
    assert!(!sources.is_empty());
    let ordinals: Vec<i64> = sources.iter().map(|m| m.ordinal).collect();
    let mut sorted = ordinals.clone();
    sorted.sort_unstable();
    assert_eq!(ordinals, sorted, "getSummaryMessages must return ordinal order");

    let checker = engine.integrity_checker().await.unwrap();
    let report = checker.check(Some("conv-2")).await.unwrap();
    assert!(
        report.violations.is_empty(),
        "compaction must not leave integrity violations: {:?}",
        report.violations
    );
}

/// Scenario 3: repeated compact calls against an already-compacted
/// conversation are idempotent — no duplicate edges, no further mutation
/// once the budget is satisfied.
#[tokio::test]
async fn test_repeated_compaction_is_idempotent() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    for i in 0..12 {
        engine
            .ingest(IngestParams {
                session_id: "conv-3".into(),
                message: IngestMessage::new(Role::User, "x".repeat(400 + i)),
                agent_id: None,
                is_heartbeat: true,
            })
            .await
            .unwrap();
    }

    let params = || FacadeCompactParams {
        session_id: "conv-3".into(),
        session_file: None,
        current_token_count: None,
        compaction_target: CompactionTarget::Budget,
        custom_instructions: None,
        token_budget: Some(50),
    };

    let first = engine.compact(params()).await.unwrap();
    assert!(first.compacted);

    let store = engine.get_conversation_store().await.unwrap();
    let after_first = store.get_context_items("conv-3", false, None, None).await.unwrap();

    // A second call against the same (now-below-budget) state must not
    // compact further and must not duplicate any lineage edges.
    let second = engine.compact(params()).await.unwrap();
    assert!(!second.compacted);
    assert_eq!(second.reason.as_deref(), Some("already below threshold"));

    let after_second = store.get_context_items("conv-3", false, None, None).await.unwrap();
    assert_eq!(after_first.len(), after_second.len());

    let checker = engine.integrity_checker().await.unwrap();
    let report = checker.check(Some("conv-3")).await.unwrap();
    assert!(report.violations.is_empty());
}

/// Scenario 4: expand defers an over-cap child into `nextSummaryIds` rather
/// than dropping it, and reports `truncated=true`.
#[tokio::test]
async fn test_expand_defers_over_cap_child() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    for i in 0..12 {
        engine
            .ingest(IngestParams {
                session_id: "conv-4".into(),
                message: IngestMessage::new(Role::User, "x".repeat(400 + i)),
                agent_id: None,
                is_heartbeat: true,
            })
            .await
            .unwrap();
    }
    engine
        .compact(FacadeCompactParams {
            session_id: "conv-4".into(),
            session_file: None,
            current_token_count: None,
            compaction_target: CompactionTarget::Budget,
            custom_instructions: None,
            token_budget: Some(1),
        })
        .await
        .unwrap();

    let retrieval = engine.get_retrieval_engine().await.unwrap();
    let store = engine.get_conversation_store().await.unwrap();
    let active = store.get_context_items("conv-4", false, None, None).await.unwrap();
    let summary = active.iter().find(|i| i.item_type == ContextItemKind::Summary).unwrap();

    let result = retrieval
        .expand(
            ExpandParams {
                summary_id: summary.item_id.clone(),
                depth: Some(1),
                include_messages: false,
                token_cap: Some(1),
                limit: None,
            },
            None,
            None,
            0,
        )
        .await
        .unwrap();
    assert!(result.truncated);
    assert!(result.summaries.is_empty());
    assert!(
        !result.next_summary_ids.is_empty(),
        "over-cap summary children must be deferred into nextSummaryIds, not dropped"
    );
    assert!(!result.next_summary_ids.contains(&summary.item_id));
}

/// Scenario 5: an expansion grant scoped to one conversation rejects
/// cross-conversation and over-depth requests with the matching sub-code.
#[tokio::test]
async fn test_auth_scope_and_depth_bounds() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);

    engine
        .ingest(IngestParams {
            session_id: "conv-a".into(),
            message: IngestMessage::new(Role::User, "hi"),
            agent_id: None,
            is_heartbeat: false,
        })
        .await
        .unwrap();
    engine
        .ingest(IngestParams {
            session_id: "conv-b".into(),
            message: IngestMessage::new(Role::User, "hi"),
            agent_id: None,
            is_heartbeat: false,
        })
        .await
        .unwrap();

    let auth = engine.expansion_auth().await.unwrap();
    let grant = auth.issue_grant(IssueGrantParams {
        delegator_session_key: "owner".into(),
        delegate_session_key: "delegate".into(),
        allowed_conversation_ids: ["conv-a".to_string()].into_iter().collect(),
        allowed_summary_ids: Default::default(),
        max_depth: 2,
        max_token_cap: 4000,
        ttl_ms: None,
        now_ms: 0,
    });
    assert!(grant.is_usable(0));

    let retrieval = engine.authorized_retrieval_engine().await.unwrap();

    let out_of_scope = retrieval
        .expand(
            ExpandParams {
                summary_id: "whatever".into(),
                ..Default::default()
            },
            Some("conv-b"),
            Some("delegate"),
            10,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        out_of_scope,
        lcm::error::LcmError::AuthorizationFailed(lcm::error::AuthFailureCode::OutOfScope)
    ));

    let depth_exceeded = retrieval
        .expand(
            ExpandParams {
                summary_id: "whatever".into(),
                depth: Some(3),
                ..Default::default()
            },
            Some("conv-a"),
            Some("delegate"),
            10,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        depth_exceeded,
        lcm::error::LcmError::AuthorizationFailed(lcm::error::AuthFailureCode::DepthExceeded)
    ));

    auth.revoke(&grant.grant_id);
    let revoked = retrieval
        .grep(
            GrepParams {
                query: "hi".into(),
                mode: GrepMode::FullText,
                scope: GrepScope::Messages,
                conversation_id: Some("conv-a".into()),
                limit: 10,
            },
            Some("delegate"),
            20,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        revoked,
        lcm::error::LcmError::AuthorizationFailed(lcm::error::AuthFailureCode::Revoked)
    ));
}

/// Scenario 6: integrity repair applies the fixable plan and leaves the
/// non-fixable violation reported.
#[tokio::test]
async fn test_integrity_repair_plan_fixes_fixable_violations() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(&dir);
    let store = engine.get_conversation_store().await.unwrap();

    store.ensure_conversation("conv-5", "sess-5", None, 0).await.unwrap();

    // (a) summary without lineage — not fixable.
    store
        .insert_summary(lcm::store::NewContextItem {
            item_id: "sum-orphan".into(),
            conversation_id: "conv-5".into(),
            depth: 1,
            title: None,
            body: "orphan".into(),
            metadata: serde_json::json!({}),
            created_at_ms: 0,
            updated_at_ms: 0,
        })
        .await
        .unwrap();

    // (b) context item pointing at a missing conversation — fixable.
    store
        .backend()
        .run(|conn| -> lcm::error::Result<()> {
            conn.execute(
                "INSERT INTO lcm_context_items
                    (item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata, tombstoned, created_at_ms, updated_at_ms)
                 VALUES ('dangling-item', 'no-such-conversation', NULL, 'note', 0, NULL, '', '{}', 0, 0, 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    // (c) lineage edge with a missing endpoint — fixable.
    store
        .backend()
        .run(|conn| -> lcm::error::Result<()> {
            conn.execute(
                "INSERT INTO lcm_lineage_edges (parent_item_id, child_item_id, relation, metadata, created_at_ms)
                 VALUES ('missing-parent', 'sum-orphan', 'derived', '{}', 0)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let checker = engine.integrity_checker().await.unwrap();
    let pre = checker.check(None).await.unwrap();
    assert_eq!(pre.violations.len(), 3);

    let report = checker.repair(None).await.unwrap();
    assert_eq!(report.pre_repair_violation_count, 3);
    assert_eq!(report.applied, 2);
    assert_eq!(report.remaining_violations.len(), 1);
    assert_eq!(report.remaining_violations[0].code, ViolationCode::SummaryWithoutSource);
}
