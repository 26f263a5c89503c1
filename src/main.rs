//! Keeper - 持久化 Agent 执行引擎
//!
//! 入口：初始化日志、加载配置、打开 Store、准备 Agent，然后运行主循环直到停止或空闲。
//! 用法：`keeper [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use keeper::config::{load_config, AppConfig};
use keeper::core::{AgentPhase, AgentState, Orchestrator, SessionSupervisor};
use keeper::llm::create_llm_from_config;
use keeper::observability;
use keeper::store::AgentContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match config_path {
        Some(path) => {
            let display = path.display().to_string();
            load_config(Some(path)).with_context(|| format!("Failed to load config {display}"))?
        }
        None => load_config(None).unwrap_or_else(|e| {
            tracing::warn!("Config load failed ({}), using defaults", e);
            AppConfig::default()
        }),
    };

    let llm = create_llm_from_config(&cfg.llm);
    let orchestrator = Orchestrator::from_config(&cfg, Arc::clone(&llm))
        .await
        .context("Failed to open store")?;
    orchestrator
        .seed_catalog(&cfg.procedures, &cfg.rules)
        .await
        .context("Failed to seed procedures")?;

    let agent = &cfg.agent;
    let ctx = AgentContext::new(&agent.agent_id, &agent.user_id, &agent.name)
        .with_personality(&agent.personality)
        .with_rule_ids(agent.rule_ids.clone());
    let initial = AgentState::new(&agent.agent_id, &agent.user_id)
        .with_emotional_state(&agent.emotional_state);
    let state = orchestrator
        .provision_with(&ctx, initial)
        .await
        .context("Failed to provision agent")?;

    // 空闲或已休眠时才分配新过程；执行中的过程从断点继续
    if let Some(procedure_id) = &agent.procedure {
        if state.active_procedure.is_none() || state.phase == AgentPhase::Sleeping {
            orchestrator
                .assign_procedure(&agent.agent_id, &agent.user_id, procedure_id)
                .await
                .context("Failed to assign procedure")?;
        } else {
            tracing::info!(
                "Resuming {} at step {} ({})",
                state.active_procedure.as_deref().unwrap_or_default(),
                state.step_index + 1,
                state.phase
            );
        }
    }

    let supervisor = Arc::new(SessionSupervisor::new());
    let signal_supervisor = Arc::clone(&supervisor);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, stopping");
            signal_supervisor.cancel();
        }
    });

    let result = orchestrator
        .run(
            &agent.agent_id,
            &agent.user_id,
            supervisor.agent_token(&agent.agent_id),
        )
        .await;

    let (prompt_tokens, completion_tokens, total) = llm.token_usage();
    if total > 0 {
        tracing::info!(
            "Token usage: {} prompt, {} completion, {} total",
            prompt_tokens,
            completion_tokens,
            total
        );
    }
    orchestrator.store().close().await.context("Failed to close store")?;

    let outcome = result.context("Agent run failed")?;
    tracing::info!("Agent {} finished: {}", agent.agent_id, outcome);
    Ok(())
}
