//! Agent 编排器：主控循环
//!
//! 负责：加载状态 → PhaseRunner 推进一步 → 写回 Store，直到停止、空闲、取消或出错。
//! 每次阶段转换后立即持久化，进程在任意时刻退出都能从最后一次写入处恢复。
//! 同一 (agent_id, user_id) 同时只允许一个循环（进程内互斥）；不同 Agent 相互独立并发运行。

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::catalog::ProcedureCatalog;
use crate::config::{AppConfig, OrchestratorSection};
use crate::core::phase_runner::{PhaseRunner, StepOutcome};
use crate::core::prompts;
use crate::core::{
    AgentPhase, AgentState, EngineError, RecoveryAction, RecoveryEngine, SessionSupervisor,
    StoreError,
};
use crate::llm::{LlmClient, LlmError};
use crate::mailbox::{MailMessage, Mailbox};
use crate::memory::{MemoryEntry, MemoryType, Message};
use crate::store::{create_store, AgentContext, Procedure, Rule, Store};

/// 一次 run 的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// 到达 SLEEPING 并发出停止信号
    Halted,
    /// 没有可执行的过程，等待分配
    Idle,
    /// 达到 max_steps_per_run
    StepLimit,
    Cancelled,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunOutcome::Halted => "halted",
            RunOutcome::Idle => "idle",
            RunOutcome::StepLimit => "step limit reached",
            RunOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// run_many 中单个 Agent 的结果
#[derive(Debug)]
pub struct AgentRunReport {
    pub agent_id: String,
    pub user_id: String,
    pub result: Result<RunOutcome, EngineError>,
}

/// 每个 (agent_id, user_id) 一把异步互斥锁
#[derive(Default)]
struct AgentLocks {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl AgentLocks {
    async fn acquire(&self, agent_id: &str, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry((agent_id.to_string(), user_id.to_string()))
                    .or_default(),
            )
        };
        lock.lock_owned().await
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    runner: Arc<PhaseRunner>,
    catalog: ProcedureCatalog,
    recovery: RecoveryEngine,
    settings: OrchestratorSection,
    locks: Arc<AgentLocks>,
    mailbox: Option<Arc<dyn Mailbox>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, llm: Arc<dyn LlmClient>, cfg: &AppConfig) -> Self {
        let runner = PhaseRunner::new(llm, Arc::clone(&store)).with_settings(cfg.runner.clone());
        Self {
            catalog: ProcedureCatalog::new(Arc::clone(&store)),
            store,
            runner: Arc::new(runner),
            recovery: RecoveryEngine::from_config(&cfg.orchestrator),
            settings: cfg.orchestrator.clone(),
            locks: Arc::new(AgentLocks::default()),
            mailbox: None,
        }
    }

    /// 按 [store] 段创建后端
    pub async fn from_config(
        cfg: &AppConfig,
        llm: Arc<dyn LlmClient>,
    ) -> Result<Self, EngineError> {
        let store = create_store(&cfg.store).await?;
        Ok(Self::new(store, llm, cfg))
    }

    pub fn with_mailbox(mut self, mailbox: Arc<dyn Mailbox>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn catalog(&self) -> &ProcedureCatalog {
        &self.catalog
    }

    /// 写入过程与规则定义（启动时由宿主调用）
    pub async fn seed_catalog(
        &self,
        procedures: &[Procedure],
        rules: &[Rule],
    ) -> Result<(), EngineError> {
        for rule in rules {
            self.store.upsert_rule(rule).await?;
        }
        for procedure in procedures {
            self.store.upsert_procedure(procedure).await?;
        }
        tracing::info!(
            "Catalog seeded with {} procedures and {} rules",
            procedures.len(),
            rules.len()
        );
        Ok(())
    }

    /// 写入 AgentContext；若还没有状态则创建 PLANNING 初始状态
    pub async fn provision(&self, ctx: &AgentContext) -> Result<AgentState, EngineError> {
        self.provision_with(ctx, AgentState::new(&ctx.agent_id, &ctx.user_id))
            .await
    }

    /// 同 provision，但首次创建时使用给定的初始状态（如指定情绪）；已有状态时忽略
    pub async fn provision_with(
        &self,
        ctx: &AgentContext,
        initial: AgentState,
    ) -> Result<AgentState, EngineError> {
        if initial.agent_id != ctx.agent_id || initial.user_id != ctx.user_id {
            return Err(StoreError::invalid("initial state belongs to a different agent").into());
        }
        let _guard = self.locks.acquire(&ctx.agent_id, &ctx.user_id).await;
        self.store.upsert_agent_context(ctx).await?;
        match self.store.get_agent_state(&ctx.agent_id, &ctx.user_id).await? {
            Some(state) => Ok(state),
            None => {
                let state = initial;
                self.store.upsert_agent_state(&state).await?;
                tracing::info!(agent_id = %ctx.agent_id, "Provisioned agent {}", ctx.agent_name);
                Ok(state)
            }
        }
    }

    /// 给 Agent 分配过程：快照过程定义，指针归零，回到 PLANNING
    pub async fn assign_procedure(
        &self,
        agent_id: &str,
        user_id: &str,
        procedure_id: &str,
    ) -> Result<AgentState, EngineError> {
        let _guard = self.locks.acquire(agent_id, user_id).await;
        let procedure = self.catalog.procedure(procedure_id).await?;
        let mut state = self.load_or_init(agent_id, user_id).await?;
        state.assign(procedure);
        self.store.upsert_agent_state(&state).await?;
        tracing::info!(agent_id, user_id, "Assigned procedure {}", procedure_id);
        Ok(state)
    }

    /// 主循环：load → step → save，直到停止 / 空闲 / 取消 / 出错
    ///
    /// 模型调用失败时按退避策略重试同一步，期间不写入任何状态；
    /// Store 不可用时立即停止并返回错误。
    pub async fn run(
        &self,
        agent_id: &str,
        user_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let _guard = self.locks.acquire(agent_id, user_id).await;
        let mut state = self.load_or_init(agent_id, user_id).await?;
        if self.deliver_inbox(&mut state).await {
            self.store.upsert_agent_state(&state).await?;
            self.acknowledge_inbox(&state.agent_id).await;
        }

        let mut steps = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            if self.settings.max_steps_per_run.is_some_and(|max| steps >= max) {
                tracing::info!(agent_id, "Step limit reached after {} steps", steps);
                return Ok(RunOutcome::StepLimit);
            }

            let outcome = match self.step_with_retry(&state, &cancel).await {
                Ok(outcome) => outcome,
                Err(e) if e.is_cancelled() => {
                    tracing::info!(agent_id, "Run cancelled during model call");
                    return Ok(RunOutcome::Cancelled);
                }
                Err(e) => {
                    tracing::error!(agent_id, "Run halted: {}", e);
                    return Err(e);
                }
            };
            steps += 1;

            let previous = state.phase;
            let StepOutcome {
                state: next,
                should_continue,
            } = outcome;
            state = next;

            // 情节记忆先于 SLEEPING 落盘；写入失败时保留 VERIFYING，下次运行重做校验
            if previous == AgentPhase::Verifying && state.phase == AgentPhase::Sleeping {
                self.record_episode(&state).await?;
            }
            if let Err(e) = self.store.upsert_agent_state(&state).await {
                tracing::error!(agent_id, "Failed to persist state: {}", e);
                return Err(e.into());
            }
            if !should_continue {
                self.notify_halt(&state).await;
                return Ok(RunOutcome::Halted);
            }
            if state.is_idle() {
                tracing::info!(agent_id, "No procedure assigned, agent is idle");
                return Ok(RunOutcome::Idle);
            }
        }
    }

    /// 多个 Agent 并发运行，各自使用 supervisor 下的子 token
    pub async fn run_many(
        &self,
        agents: Vec<(String, String)>,
        supervisor: &SessionSupervisor,
    ) -> Vec<AgentRunReport> {
        let mut ids = Vec::with_capacity(agents.len());
        let mut handles = Vec::with_capacity(agents.len());
        for (agent_id, user_id) in agents {
            let this = self.clone();
            let token = supervisor.agent_token(&agent_id);
            let (a, u) = (agent_id.clone(), user_id.clone());
            handles.push(tokio::spawn(async move { this.run(&a, &u, token).await }));
            ids.push((agent_id, user_id));
        }

        join_all(handles)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, (agent_id, user_id))| AgentRunReport {
                agent_id,
                user_id,
                result: joined.unwrap_or_else(|e| Err(EngineError::TaskFailed(e.to_string()))),
            })
            .collect()
    }

    /// 首次运行时创建默认的 AgentContext 与 AgentState
    async fn load_or_init(&self, agent_id: &str, user_id: &str) -> Result<AgentState, EngineError> {
        if let Some(state) = self.store.get_agent_state(agent_id, user_id).await? {
            return Ok(state);
        }
        if self.store.get_agent_context(agent_id, user_id).await?.is_none() {
            self.store
                .upsert_agent_context(&AgentContext::new(agent_id, user_id, agent_id))
                .await?;
        }
        let state = AgentState::new(agent_id, user_id);
        self.store.upsert_agent_state(&state).await?;
        tracing::info!(agent_id, user_id, "Created initial state");
        Ok(state)
    }

    async fn step_with_retry(
        &self,
        state: &AgentState,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, EngineError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match self.runner.step(state, cancel).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };
            match self.recovery.handle(&err, attempt) {
                RecoveryAction::RetryAfter(delay) => {
                    tracing::warn!(
                        agent_id = %state.agent_id,
                        "Model call failed ({}), retrying in {:?} (attempt {})",
                        err,
                        delay,
                        attempt
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(LlmError::Cancelled.into()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RecoveryAction::Halt => return Err(err),
            }
        }
    }

    /// 未读消息作为 User 消息追加到 Transcript；返回是否有新消息。不标记已读
    async fn deliver_inbox(&self, state: &mut AgentState) -> bool {
        let Some(mailbox) = &self.mailbox else {
            return false;
        };
        let unread = match mailbox.poll_unread(&state.agent_id).await {
            Ok(unread) => unread,
            Err(e) => {
                tracing::warn!(agent_id = %state.agent_id, "Inbox poll failed: {}", e);
                return false;
            }
        };
        if unread.is_empty() {
            return false;
        }
        let limit = self.runner.settings().max_transcript_entries;
        for msg in &unread {
            state.record(Message::user(format!("[from {}] {}", msg.from, msg.body)), limit);
        }
        tracing::info!(agent_id = %state.agent_id, "Delivered {} inbox messages", unread.len());
        true
    }

    /// 仅在 Transcript 落盘之后调用，否则消息会丢失
    async fn acknowledge_inbox(&self, agent_id: &str) {
        let Some(mailbox) = &self.mailbox else {
            return;
        };
        if let Err(e) = mailbox.mark_read(agent_id).await {
            tracing::warn!(agent_id, "Failed to mark inbox read: {}", e);
        }
    }

    async fn notify_halt(&self, state: &AgentState) {
        let Some(mailbox) = &self.mailbox else {
            return;
        };
        let body = state
            .transcript
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_else(|| prompts::closing_line(None));
        if let Err(e) = mailbox
            .send(&state.user_id, MailMessage::new(&state.agent_id, body))
            .await
        {
            tracing::warn!(agent_id = %state.agent_id, "Failed to send closing message: {}", e);
        }
    }

    async fn record_episode(&self, state: &AgentState) -> Result<(), EngineError> {
        if !self.settings.record_episodes {
            return Ok(());
        }
        let Some(procedure) = state.snapshot() else {
            return Ok(());
        };
        let entry = MemoryEntry::new(
            &state.user_id,
            &state.agent_id,
            MemoryType::Episodic,
            format!(
                "Completed the {} procedure ({} steps).",
                procedure.name,
                procedure.step_count()
            ),
        )
        .with_relevance(1.0);
        self.store.upsert_memory(&entry).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::llm::ScriptedLlmClient;
    use crate::mailbox::InMemoryMailbox;
    use crate::memory::{MemoryQuery, MemoryRecord};
    use crate::store::{InMemoryStore, StoreKind};

    /// 内存 Store 外加可开关的写入故障
    #[derive(Default)]
    struct FaultyStore {
        inner: InMemoryStore,
        fail_state_writes: AtomicBool,
        fail_memory_writes: AtomicBool,
    }

    impl FaultyStore {
        fn check(flag: &AtomicBool) -> Result<(), StoreError> {
            if flag.load(Ordering::SeqCst) {
                return Err(StoreError::BackendUnavailable("injected fault".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Store for FaultyStore {
        fn kind(&self) -> StoreKind {
            self.inner.kind()
        }

        async fn upsert_agent_context(&self, ctx: &AgentContext) -> Result<(), StoreError> {
            self.inner.upsert_agent_context(ctx).await
        }

        async fn get_agent_context(
            &self,
            agent_id: &str,
            user_id: &str,
        ) -> Result<Option<AgentContext>, StoreError> {
            self.inner.get_agent_context(agent_id, user_id).await
        }

        async fn upsert_agent_state(&self, state: &AgentState) -> Result<(), StoreError> {
            Self::check(&self.fail_state_writes)?;
            self.inner.upsert_agent_state(state).await
        }

        async fn get_agent_state(
            &self,
            agent_id: &str,
            user_id: &str,
        ) -> Result<Option<AgentState>, StoreError> {
            self.inner.get_agent_state(agent_id, user_id).await
        }

        async fn upsert_memory(&self, entry: &MemoryEntry) -> Result<(), StoreError> {
            Self::check(&self.fail_memory_writes)?;
            self.inner.upsert_memory(entry).await
        }

        async fn get_memory_record(
            &self,
            memory_id: &str,
            user_id: &str,
            agent_id: &str,
        ) -> Result<Option<MemoryRecord>, StoreError> {
            self.inner.get_memory_record(memory_id, user_id, agent_id).await
        }

        async fn search_memories(
            &self,
            query: &MemoryQuery,
        ) -> Result<Vec<MemoryEntry>, StoreError> {
            self.inner.search_memories(query).await
        }

        async fn upsert_procedure(&self, procedure: &Procedure) -> Result<(), StoreError> {
            self.inner.upsert_procedure(procedure).await
        }

        async fn get_procedure(&self, procedure_id: &str) -> Result<Option<Procedure>, StoreError> {
            self.inner.get_procedure(procedure_id).await
        }

        async fn list_procedure_ids(&self) -> Result<Vec<String>, StoreError> {
            self.inner.list_procedure_ids().await
        }

        async fn upsert_rule(&self, rule: &Rule) -> Result<(), StoreError> {
            self.inner.upsert_rule(rule).await
        }

        async fn get_rule(&self, rule_id: &str) -> Result<Option<Rule>, StoreError> {
            self.inner.get_rule(rule_id).await
        }

        async fn close(&self) -> Result<(), StoreError> {
            self.inner.close().await
        }
    }

    fn tidy() -> Procedure {
        Procedure::new("tidy", "tidy_up", vec!["sweep".into(), "mop".into()])
    }

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.orchestrator.retry_base_delay_ms = 1;
        cfg.orchestrator.retry_max_delay_ms = 5;
        cfg
    }

    async fn orchestrator(llm: ScriptedLlmClient, cfg: &AppConfig) -> Orchestrator {
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let orch = Orchestrator::new(store, Arc::new(llm), cfg);
        orch.seed_catalog(&[tidy()], &[]).await.unwrap();
        orch
    }

    #[tokio::test]
    async fn test_run_to_sleep_records_episode() {
        let cfg = config();
        let orch = orchestrator(ScriptedLlmClient::always("All steps executed."), &cfg).await;
        orch.assign_procedure("a", "u", "tidy").await.unwrap();

        let outcome = orch.run("a", "u", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Halted);

        let state = orch.store().get_agent_state("a", "u").await.unwrap().unwrap();
        assert_eq!(state.phase, AgentPhase::Sleeping);
        assert_eq!(state.last_procedure.as_deref(), Some("tidy"));

        let episodes = orch
            .store()
            .search_memories(&MemoryQuery::new("u", "a").with_text("tidy_up"))
            .await
            .unwrap();
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].memory_type, MemoryType::Episodic);
    }

    #[tokio::test]
    async fn test_unassigned_agent_goes_idle() {
        let cfg = config();
        let orch = orchestrator(ScriptedLlmClient::always("nothing to do"), &cfg).await;
        let outcome = orch.run("a", "u", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Idle);
        // 首次运行创建默认上下文
        let ctx = orch.store().get_agent_context("a", "u").await.unwrap().unwrap();
        assert_eq!(ctx.agent_name, "a");
    }

    #[tokio::test]
    async fn test_transient_model_failure_is_retried() {
        let cfg = config();
        let llm = ScriptedLlmClient::new(vec![
            Err(LlmError::Timeout(Duration::from_secs(1))),
            Err(LlmError::Unavailable("503".to_string())),
        ])
        .with_fallback(Ok("procedure complete".to_string()));
        let orch = orchestrator(llm, &cfg).await;
        orch.assign_procedure("a", "u", "tidy").await.unwrap();

        let outcome = orch.run("a", "u", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Halted);
    }

    #[tokio::test]
    async fn test_persistent_model_failure_surfaces_without_mutation() {
        let cfg = config();
        let llm = ScriptedLlmClient::new(Vec::new())
            .with_fallback(Err(LlmError::Unavailable("down".to_string())));
        let orch = orchestrator(llm, &cfg).await;
        let assigned = orch.assign_procedure("a", "u", "tidy").await.unwrap();

        let err = orch.run("a", "u", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Model(LlmError::Unavailable(_))));
        let stored = orch.store().get_agent_state("a", "u").await.unwrap().unwrap();
        assert_eq!(stored, assigned);
    }

    #[tokio::test]
    async fn test_closed_store_halts_run() {
        let cfg = config();
        let orch = orchestrator(ScriptedLlmClient::always("x"), &cfg).await;
        orch.store().close().await.unwrap();
        let err = orch.run("a", "u", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Store(StoreError::BackendUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cfg = config();
        let orch = orchestrator(ScriptedLlmClient::always("x"), &cfg).await;
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(orch.run("a", "u", token).await.unwrap(), RunOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_inbox_delivered_and_closing_line_sent() {
        let cfg = config();
        let mailbox = Arc::new(InMemoryMailbox::new());
        mailbox
            .send("a", MailMessage::new("bob", "please tidy"))
            .await
            .unwrap();
        let orch = orchestrator(ScriptedLlmClient::always("procedure complete"), &cfg)
            .await
            .with_mailbox(mailbox.clone());
        orch.assign_procedure("a", "u", "tidy").await.unwrap();

        orch.run("a", "u", CancellationToken::new()).await.unwrap();

        assert!(mailbox.poll_unread("a").await.unwrap().is_empty());
        let state = orch.store().get_agent_state("a", "u").await.unwrap().unwrap();
        assert_eq!(state.transcript[0].content, "[from bob] please tidy");
        let sent = mailbox.poll_unread("u").await.unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].body.contains("sleep mode"));
    }

    #[tokio::test]
    async fn test_inbox_text_reaches_procedure_prompts() {
        let cfg = config();
        let llm = Arc::new(ScriptedLlmClient::always("procedure complete"));
        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
        let mailbox = Arc::new(InMemoryMailbox::new());
        let orch = Orchestrator::new(store, llm.clone() as Arc<dyn LlmClient>, &cfg)
            .with_mailbox(mailbox.clone());
        orch.seed_catalog(&[tidy()], &[]).await.unwrap();
        orch.assign_procedure("a", "u", "tidy").await.unwrap();
        mailbox
            .send("a", MailMessage::new("bob", "use the blue mop"))
            .await
            .unwrap();

        orch.run("a", "u", CancellationToken::new()).await.unwrap();

        let prompts = llm.prompts();
        assert_eq!(prompts.len(), 4);
        assert!(prompts[0].system.contains("[from bob] use the blue mop"));
        // 回应过之后不再作为未读输入出现
        assert!(!prompts[1].system.contains("use the blue mop"));
    }

    #[tokio::test]
    async fn test_episode_failure_keeps_agent_verifying() {
        let cfg = config();
        let store = Arc::new(FaultyStore::default());
        let orch = Orchestrator::new(
            store.clone(),
            Arc::new(ScriptedLlmClient::always("All steps executed.")),
            &cfg,
        );
        orch.seed_catalog(&[tidy()], &[]).await.unwrap();
        orch.assign_procedure("a", "u", "tidy").await.unwrap();

        store.fail_memory_writes.store(true, Ordering::SeqCst);
        let err = orch.run("a", "u", CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::BackendUnavailable(_))));
        let stored = store.get_agent_state("a", "u").await.unwrap().unwrap();
        assert_eq!(stored.phase, AgentPhase::Verifying);

        // 恢复后重做校验，情节记忆与 SLEEPING 一起落盘
        store.fail_memory_writes.store(false, Ordering::SeqCst);
        let outcome = orch.run("a", "u", CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::Halted);
        let stored = store.get_agent_state("a", "u").await.unwrap().unwrap();
        assert_eq!(stored.phase, AgentPhase::Sleeping);
        let episodes = store
            .search_memories(&MemoryQuery::new("u", "a").with_text("tidy_up"))
            .await
            .unwrap();
        assert_eq!(episodes.len(), 1);
    }

    #[tokio::test]
    async fn test_inbox_stays_unread_when_delivery_not_persisted() {
        let cfg = config();
        let store = Arc::new(FaultyStore::default());
        let mailbox = Arc::new(InMemoryMailbox::new());
        let orch = Orchestrator::new(
            store.clone(),
            Arc::new(ScriptedLlmClient::always("procedure complete")),
            &cfg,
        )
        .with_mailbox(mailbox.clone());
        orch.seed_catalog(&[tidy()], &[]).await.unwrap();
        orch.assign_procedure("a", "u", "tidy").await.unwrap();
        mailbox
            .send("a", MailMessage::new("bob", "please tidy"))
            .await
            .unwrap();

        store.fail_state_writes.store(true, Ordering::SeqCst);
        assert!(orch.run("a", "u", CancellationToken::new()).await.is_err());
        assert_eq!(mailbox.poll_unread("a").await.unwrap().len(), 1);

        store.fail_state_writes.store(false, Ordering::SeqCst);
        orch.run("a", "u", CancellationToken::new()).await.unwrap();
        assert!(mailbox.poll_unread("a").await.unwrap().is_empty());
        let state = store.get_agent_state("a", "u").await.unwrap().unwrap();
        assert_eq!(state.transcript[0].content, "[from bob] please tidy");
    }
}
