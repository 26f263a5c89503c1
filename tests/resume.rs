//! 持久化恢复与多 Agent 并发

use std::sync::Arc;
use std::time::Duration;

use keeper::config::AppConfig;
use keeper::core::{AgentPhase, AgentState, Orchestrator, RunOutcome, SessionSupervisor};
use keeper::llm::{LlmClient, ScriptedLlmClient};
use keeper::store::{AgentContext, InMemoryStore, Procedure, SqliteStore, Store};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn bedtime() -> Procedure {
    Procedure::new(
        "prepare_for_sleep",
        "prepare_for_sleep",
        vec!["brush teeth".into(), "dim the lights".into()],
    )
}

fn fast_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.orchestrator.retry_base_delay_ms = 1;
    cfg.orchestrator.retry_max_delay_ms = 5;
    cfg
}

#[tokio::test]
async fn test_restart_resumes_from_last_persisted_step() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("agents.db");
    let llm = Arc::new(ScriptedLlmClient::always("All steps executed."));

    let mut cfg = fast_config();
    cfg.orchestrator.max_steps_per_run = Some(2);
    {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).await.unwrap());
        let orch = Orchestrator::new(Arc::clone(&store), llm.clone() as Arc<dyn LlmClient>, &cfg);
        orch.seed_catalog(&[bedtime()], &[]).await.unwrap();
        orch.provision(&AgentContext::new("nova", "u1", "Nova"))
            .await
            .unwrap();
        orch.assign_procedure("nova", "u1", "prepare_for_sleep")
            .await
            .unwrap();

        let outcome = orch.run("nova", "u1", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::StepLimit);
        store.close().await.unwrap();
    }

    // 模拟进程重启：新的连接与新的编排器
    cfg.orchestrator.max_steps_per_run = None;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&db).await.unwrap());
    let saved = store.get_agent_state("nova", "u1").await.unwrap().unwrap();
    assert_eq!(saved.phase, AgentPhase::Executing);
    assert_eq!(saved.step_index, 1);
    assert_eq!(saved.transcript.len(), 2);

    let orch = Orchestrator::new(Arc::clone(&store), llm.clone() as Arc<dyn LlmClient>, &cfg);
    let outcome = orch.run("nova", "u1", CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Halted);

    // plan + 2 steps + verify，已完成的步骤不会重做
    assert_eq!(llm.call_count(), 4);
    let done = store.get_agent_state("nova", "u1").await.unwrap().unwrap();
    assert_eq!(done.phase, AgentPhase::Sleeping);
    assert_eq!(done.last_procedure.as_deref(), Some("prepare_for_sleep"));
}

#[tokio::test]
async fn test_cancel_during_model_call_persists_nothing() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let llm = ScriptedLlmClient::always("slow").with_delay(Duration::from_secs(30));
    let orch = Orchestrator::new(Arc::clone(&store), Arc::new(llm), &fast_config());
    orch.seed_catalog(&[bedtime()], &[]).await.unwrap();
    orch.assign_procedure("nova", "u1", "prepare_for_sleep")
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = orch.run("nova", "u1", cancel).await.unwrap();
    assert_eq!(outcome, RunOutcome::Cancelled);
    let state = store.get_agent_state("nova", "u1").await.unwrap().unwrap();
    assert_eq!(state.phase, AgentPhase::Planning);
    assert!(state.transcript.is_empty());
}

#[tokio::test]
async fn test_run_many_drives_agents_independently() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let llm = ScriptedLlmClient::always("Procedure complete.").with_delay(Duration::from_millis(5));
    let orch = Orchestrator::new(Arc::clone(&store), Arc::new(llm), &fast_config());
    orch.seed_catalog(&[bedtime()], &[]).await.unwrap();

    let agents: Vec<(String, String)> = (0..4)
        .map(|i| (format!("agent-{i}"), "u1".to_string()))
        .collect();
    for (agent_id, user_id) in &agents[..3] {
        orch.assign_procedure(agent_id, user_id, "prepare_for_sleep")
            .await
            .unwrap();
    }

    let supervisor = SessionSupervisor::new();
    let reports = orch.run_many(agents.clone(), &supervisor).await;
    assert_eq!(reports.len(), 4);
    for report in &reports {
        let outcome = report.result.as_ref().unwrap();
        if report.agent_id == "agent-3" {
            assert_eq!(*outcome, RunOutcome::Idle);
        } else {
            assert_eq!(*outcome, RunOutcome::Halted);
        }
    }
    for (agent_id, user_id) in &agents[..3] {
        let state = store.get_agent_state(agent_id, user_id).await.unwrap().unwrap();
        assert_eq!(state.phase, AgentPhase::Sleeping);
    }
}

#[tokio::test]
async fn test_same_agent_runs_are_serialized() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let llm = Arc::new(
        ScriptedLlmClient::always("Procedure complete.").with_delay(Duration::from_millis(5)),
    );
    let orch = Orchestrator::new(
        Arc::clone(&store),
        llm.clone() as Arc<dyn LlmClient>,
        &fast_config(),
    );
    orch.seed_catalog(&[bedtime()], &[]).await.unwrap();
    orch.assign_procedure("nova", "u1", "prepare_for_sleep")
        .await
        .unwrap();

    let (a, b) = tokio::join!(
        orch.run("nova", "u1", CancellationToken::new()),
        orch.run("nova", "u1", CancellationToken::new()),
    );
    assert_eq!(a.unwrap(), RunOutcome::Halted);
    assert_eq!(b.unwrap(), RunOutcome::Halted);

    // 第二个循环看到的是已休眠的状态，不会重复执行过程
    assert_eq!(llm.call_count(), 4);
}

#[tokio::test]
async fn test_provision_keeps_existing_state() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let llm = Arc::new(ScriptedLlmClient::always("ok"));
    let orch = Orchestrator::new(Arc::clone(&store), llm, &fast_config());
    let ctx = AgentContext::new("nova", "u1", "Nova");

    let first = orch
        .provision_with(&ctx, AgentState::new("nova", "u1").with_emotional_state("calm"))
        .await
        .unwrap();
    assert_eq!(first.emotional_state, "calm");

    let again = orch
        .provision_with(&ctx, AgentState::new("nova", "u1").with_emotional_state("excited"))
        .await
        .unwrap();
    assert_eq!(again.emotional_state, "calm");

    let err = orch
        .provision_with(&ctx, AgentState::new("someone-else", "u1"))
        .await
        .unwrap_err();
    assert!(matches!(err, keeper::EngineError::Store(_)));
}
