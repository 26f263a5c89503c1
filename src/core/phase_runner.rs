//! 阶段状态机
//!
//! 每次 [`PhaseRunner::step`] 只推进一个阶段：
//!
//! | 当前 | 条件 | 动作 | 下一阶段 |
//! |---|---|---|---|
//! | PLANNING | 无过程 | 询问下一步 | PLANNING |
//! | PLANNING | 有过程 | 请模型给出计划 | EXECUTING |
//! | EXECUTING | 无过程 | - | PLANNING |
//! | EXECUTING | 指针未越界 | 执行当前步骤，指针 +1 | EXECUTING / VERIFYING |
//! | VERIFYING | - | 请模型校验全部步骤 | SLEEPING / EXECUTING(指针归零) |
//! | SLEEPING | - | 追加结束语 | 停止 |
//!
//! 模型调用失败或被取消时返回错误，传入的状态保持不变。

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::catalog::ProcedureCatalog;
use crate::config::RunnerSection;
use crate::core::prompts::{self, Persona};
use crate::core::{AgentPhase, AgentState, EngineError, ValidationStatus};
use crate::llm::{LlmClient, LlmError};
use crate::memory::{MemoryEntry, MemoryQuery, Message};
use crate::store::{Procedure, Store};

/// 一步的结果：新状态 + 是否继续
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: AgentState,
    pub should_continue: bool,
}

impl StepOutcome {
    fn next(state: AgentState) -> Self {
        Self {
            state,
            should_continue: true,
        }
    }

    fn halt(state: AgentState) -> Self {
        Self {
            state,
            should_continue: false,
        }
    }
}

pub struct PhaseRunner {
    llm: Arc<dyn LlmClient>,
    store: Arc<dyn Store>,
    catalog: ProcedureCatalog,
    settings: RunnerSection,
}

impl PhaseRunner {
    pub fn new(llm: Arc<dyn LlmClient>, store: Arc<dyn Store>) -> Self {
        Self {
            llm,
            catalog: ProcedureCatalog::new(Arc::clone(&store)),
            store,
            settings: RunnerSection::default(),
        }
    }

    pub fn with_settings(mut self, settings: RunnerSection) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &RunnerSection {
        &self.settings
    }

    /// 推进一个阶段；只在成功时返回新状态
    pub async fn step(
        &self,
        state: &AgentState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let mut next = state.clone();
        let procedure = self.resolve_procedure(&mut next).await?;

        let outcome = match (state.phase, procedure) {
            (AgentPhase::Planning, None) => self.plan_idle(next, cancel).await?,
            (AgentPhase::Planning, Some(p)) => self.plan(next, p, cancel).await?,
            (AgentPhase::Executing, None) | (AgentPhase::Verifying, None) => {
                tracing::warn!(
                    agent_id = %state.agent_id,
                    "No active procedure in {}, returning to PLANNING",
                    state.phase
                );
                next.phase = AgentPhase::Planning;
                StepOutcome::next(next)
            }
            (AgentPhase::Executing, Some(p)) => self.execute(next, p, cancel).await?,
            (AgentPhase::Verifying, Some(p)) => self.verify(next, p, cancel).await?,
            (AgentPhase::Sleeping, p) => self.sleep(next, p),
        };

        debug_assert!(
            state.phase.can_transition_to(outcome.state.phase),
            "illegal transition {} -> {}",
            state.phase,
            outcome.state.phase
        );
        if outcome.state.phase != state.phase {
            tracing::info!(
                agent_id = %state.agent_id,
                user_id = %state.user_id,
                "Phase {} -> {}",
                state.phase,
                outcome.state.phase
            );
        }
        Ok(outcome)
    }

    /// 优先使用快照；快照缺失时从目录加载并补写快照
    async fn resolve_procedure(
        &self,
        state: &mut AgentState,
    ) -> Result<Option<Procedure>, EngineError> {
        let Some(procedure_id) = state.active_procedure.clone() else {
            return Ok(None);
        };
        if let Some(p) = state.snapshot() {
            return Ok(Some(p.clone()));
        }
        let procedure = self.catalog.procedure(&procedure_id).await?;
        state.procedure_snapshot = Some(procedure.clone());
        Ok(Some(procedure))
    }

    async fn plan_idle(
        &self,
        mut state: AgentState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let prompt = prompts::idle_prompt();
        let reply = self.ask(&state, None, &prompt, cancel).await?;
        state.record(Message::assistant(reply), self.settings.max_transcript_entries);
        Ok(StepOutcome::next(state))
    }

    async fn plan(
        &self,
        mut state: AgentState,
        procedure: Procedure,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let memories = self.recall(&state, &procedure.name).await?;
        let prompt = prompts::planning_prompt(&procedure, &memories);
        let reply = self.ask(&state, Some(&procedure), &prompt, cancel).await?;
        state.record(Message::assistant(reply), self.settings.max_transcript_entries);
        state.phase = AgentPhase::Executing;
        Ok(StepOutcome::next(state))
    }

    async fn execute(
        &self,
        mut state: AgentState,
        procedure: Procedure,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let Some(step) = procedure.step(state.step_index) else {
            // 指针已越过末尾，直接进入校验
            state.phase = AgentPhase::Verifying;
            return Ok(StepOutcome::next(state));
        };
        let prompt = prompts::execution_prompt(&procedure, state.step_index, step);
        let reply = self.ask(&state, Some(&procedure), &prompt, cancel).await?;
        state.record(Message::assistant(reply), self.settings.max_transcript_entries);
        state.step_index += 1;
        if state.step_index >= procedure.step_count() {
            state.phase = AgentPhase::Verifying;
        }
        Ok(StepOutcome::next(state))
    }

    async fn verify(
        &self,
        mut state: AgentState,
        procedure: Procedure,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let prompt = prompts::verification_prompt(&procedure, &self.settings.success_phrases);
        let reply = self.ask(&state, Some(&procedure), &prompt, cancel).await?;
        let success = prompts::is_success(&reply, &self.settings.success_phrases);
        state.record(Message::assistant(reply), self.settings.max_transcript_entries);

        if success {
            state.phase = AgentPhase::Sleeping;
            state.validation_status = Some(ValidationStatus::Success);
            state.last_procedure = Some(procedure.procedure_id.clone());
            state.verification_failures = 0;
            return Ok(StepOutcome::next(state));
        }

        state.validation_status = Some(ValidationStatus::Failure);
        state.verification_failures += 1;
        let give_up = self
            .settings
            .max_verification_failures
            .is_some_and(|max| state.verification_failures >= max);
        if give_up {
            tracing::warn!(
                agent_id = %state.agent_id,
                "Verification of {} failed {} times, abandoning procedure",
                procedure.procedure_id,
                state.verification_failures
            );
            state.clear_procedure();
            state.phase = AgentPhase::Planning;
        } else {
            tracing::info!(
                agent_id = %state.agent_id,
                "Verification of {} failed, restarting from step 1",
                procedure.procedure_id
            );
            state.step_index = 0;
            state.phase = AgentPhase::Executing;
        }
        Ok(StepOutcome::next(state))
    }

    fn sleep(&self, mut state: AgentState, procedure: Option<Procedure>) -> StepOutcome {
        let name = procedure.map(|p| p.name).or_else(|| state.last_procedure.clone());
        state.record(
            Message::assistant(prompts::closing_line(name.as_deref())),
            self.settings.max_transcript_entries,
        );
        StepOutcome::halt(state)
    }

    async fn recall(
        &self,
        state: &AgentState,
        text: &str,
    ) -> Result<Vec<MemoryEntry>, EngineError> {
        if self.settings.recall_limit == 0 {
            return Ok(Vec::new());
        }
        let query = MemoryQuery::new(&state.user_id, &state.agent_id)
            .with_text(text)
            .with_limit(self.settings.recall_limit);
        Ok(self.store.search_memories(&query).await?)
    }

    async fn persona(
        &self,
        state: &AgentState,
        procedure: Option<&Procedure>,
    ) -> Result<Persona, EngineError> {
        let ctx = self
            .store
            .get_agent_context(&state.agent_id, &state.user_id)
            .await?;
        let context_rules = ctx.as_ref().map(|c| c.rule_ids.as_slice()).unwrap_or(&[]);
        let procedure_rules = procedure.map(|p| p.rule_ids.as_slice()).unwrap_or(&[]);
        let rules = self
            .catalog
            .rule_texts([context_rules, procedure_rules])
            .await?;
        Ok(Persona::from_context(ctx.as_ref(), &state.agent_id).with_rules(rules))
    }

    /// 唯一的慢速挂起点：带超时，可取消
    async fn ask(
        &self,
        state: &AgentState,
        procedure: Option<&Procedure>,
        user_prompt: &str,
        cancel: &CancellationToken,
    ) -> Result<String, EngineError> {
        let persona = self.persona(state, procedure).await?;
        let system = prompts::system_prompt(&persona, state, procedure);
        let timeout = self.settings.model_timeout();

        let call = self.llm.complete(&system, user_prompt, timeout);
        tokio::select! {
            _ = cancel.cancelled() => Err(LlmError::Cancelled.into()),
            result = tokio::time::timeout(timeout, call) => {
                match result {
                    Ok(reply) => Ok(reply?),
                    Err(_) => Err(LlmError::Timeout(timeout).into()),
                }
            }
        }
    }
}
