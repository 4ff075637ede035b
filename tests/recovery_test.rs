mod common;

use common::project_with_tasks;

use ixado::authz::default_policy;
use ixado::exception::EngineError;
use ixado::process::ScriptedResponse;
use ixado::recovery::{attempt_exception_recovery, run_exception_recovery, RecoveryRequest};
use ixado::state::StateStore;
use ixado::types::{
    AdapterFailureKind, AdapterId, ExceptionMetadata, RecoveryStatus, Role,
};

fn request(exception: ExceptionMetadata, attempt_number: u32) -> RecoveryRequest {
    RecoveryRequest {
        assignee: AdapterId::MockCli,
        exception,
        attempt_number,
        role: Some(Role::Owner),
        policy: default_policy(),
    }
}

#[tokio::test]
async fn second_dirty_worktree_attempt_requires_the_json_contract() {
    let project = project_with_tasks(vec![]);
    // Adapter replies with prose instead of the contract
    project
        .runner
        .script("mock-cli", &[], vec![ScriptedResponse::ok("I cleaned it up!")]);

    let err = run_exception_recovery(
        project.store.as_ref(),
        &project.git(),
        &project.audit(),
        &request(ExceptionMetadata::dirty_worktree(" M file.ts"), 2),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, EngineError::Contract(_)));
}

#[tokio::test]
async fn forbidden_git_action_in_result_is_a_contract_violation() {
    let project = project_with_tasks(vec![]);
    project.runner.script(
        "mock-cli",
        &[],
        vec![ScriptedResponse::ok(
            r#"{"status":"fixed","reasoning":"pushed it","actions_taken":["git push origin main"],"files_touched":[]}"#,
        )],
    );

    let err = run_exception_recovery(
        project.store.as_ref(),
        &project.git(),
        &project.audit(),
        &request(
            ExceptionMetadata::agent_failure("adapter crashed", AdapterFailureKind::Unknown),
            1,
        ),
    )
    .await
    .unwrap_err();

    match err {
        EngineError::Contract(msg) => assert!(msg.contains("push")),
        other => panic!("expected contract violation, got {:?}", other),
    }
}

#[tokio::test]
async fn claimed_fix_fails_when_postcondition_does_not_hold() {
    let project = project_with_tasks(vec![]);
    // Tree stays dirty no matter what the adapter claims
    project.runner.script(
        "git",
        &["status", "--porcelain"],
        vec![ScriptedResponse::ok(" M file.ts\n")],
    );
    project.runner.script(
        "mock-cli",
        &[],
        vec![ScriptedResponse::ok(
            r#"{"status":"fixed","reasoning":"committed everything","actions_taken":["git add -A","git commit -m 'wip'"],"files_touched":["file.ts"]}"#,
        )],
    );

    let record = run_exception_recovery(
        project.store.as_ref(),
        &project.git(),
        &project.audit(),
        &request(ExceptionMetadata::dirty_worktree(" M file.ts"), 2),
    )
    .await
    .unwrap();

    assert_eq!(record.result.status, RecoveryStatus::Unfixable);
    assert!(record.result.reasoning.contains("postcondition"));

    // The failed attempt is still recorded in state
    let state = project.store.get_state().await.unwrap();
    assert_eq!(state.recovery_attempts.len(), 1);
}

#[tokio::test]
async fn non_recoverable_exceptions_never_reach_the_adapter() {
    let project = project_with_tasks(vec![]);

    for exception in [
        ExceptionMetadata::unknown("mystery failure"),
        ExceptionMetadata::agent_failure("401 Unauthorized", AdapterFailureKind::Auth),
        ExceptionMetadata::agent_failure(
            "claude: command not found",
            AdapterFailureKind::MissingBinary,
        ),
    ] {
        let err = attempt_exception_recovery(
            project.store.as_ref(),
            &project.git(),
            &project.audit(),
            AdapterId::MockCli,
            exception,
            Some(Role::Owner),
            &default_policy(),
            3,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Exception(_)));
    }

    assert!(project.runner.calls_for("mock-cli").is_empty());
}

#[tokio::test]
async fn exhaustion_carries_a_recovery_annotation() {
    let project = project_with_tasks(vec![]);
    // Adapter keeps reporting unfixable
    project.runner.script(
        "mock-cli",
        &[],
        vec![ScriptedResponse::ok(
            r#"{"status":"unfixable","reasoning":"cannot reproduce","actions_taken":[],"files_touched":[]}"#,
        )],
    );

    let err = attempt_exception_recovery(
        project.store.as_ref(),
        &project.git(),
        &project.audit(),
        AdapterId::MockCli,
        ExceptionMetadata::agent_failure("transient network blip", AdapterFailureKind::Network),
        Some(Role::Owner),
        &default_policy(),
        2,
    )
    .await
    .unwrap_err();

    match err {
        EngineError::Exception(meta) => {
            assert!(meta.message.starts_with("Recovery: exhausted 2 attempt(s)"));
            assert!(meta.message.contains("cannot reproduce"));
        }
        other => panic!("expected engine exception, got {:?}", other),
    }

    assert_eq!(project.runner.calls_for("mock-cli").len(), 2);
}

#[tokio::test]
async fn audit_log_captures_the_recovery_checkpoints() {
    let project = project_with_tasks(vec![]);
    project.runner.script(
        "git",
        &["status", "--porcelain"],
        vec![ScriptedResponse::ok("")],
    );
    project.runner.script(
        "mock-cli",
        &[],
        vec![ScriptedResponse::ok("tidied up")],
    );

    run_exception_recovery(
        project.store.as_ref(),
        &project.git(),
        &project.audit(),
        &request(ExceptionMetadata::dirty_worktree(" M a.rs"), 1),
    )
    .await
    .unwrap();

    let log = std::fs::read_to_string(project.root().join(".ixado").join("audit.log")).unwrap();
    assert!(log.contains("recovery:detected"));
    assert!(log.contains("recovery:adapter-invoked"));
    assert!(log.contains("recovery:parsed-result"));
    assert!(log.contains("orchestrator:exception-recovery:run"));
}
