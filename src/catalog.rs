//! 过程目录：Procedure 与 Rule 的只读访问
//!
//! 通过 ID 引用但不存在的过程或规则属于配置错误，由 [`EngineError::Configuration`] 表示。

use std::collections::HashSet;
use std::sync::Arc;

use crate::core::{EngineError, StoreError};
use crate::store::{Procedure, Rule, Store};

#[derive(Clone)]
pub struct ProcedureCatalog {
    store: Arc<dyn Store>,
}

impl ProcedureCatalog {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn find_procedure(
        &self,
        procedure_id: &str,
    ) -> Result<Option<Procedure>, StoreError> {
        self.store.get_procedure(procedure_id).await
    }

    /// 必须存在的过程
    pub async fn procedure(&self, procedure_id: &str) -> Result<Procedure, EngineError> {
        self.find_procedure(procedure_id).await?.ok_or_else(|| {
            EngineError::configuration(format!("procedure {procedure_id} is not defined"))
        })
    }

    /// 按 ID 升序
    pub async fn procedure_ids(&self) -> Result<Vec<String>, StoreError> {
        self.store.list_procedure_ids().await
    }

    pub async fn rule(&self, rule_id: &str) -> Result<Rule, EngineError> {
        self.store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| EngineError::configuration(format!("rule {rule_id} is not defined")))
    }

    /// 依次解析多组规则 ID，去重后保持首次出现的顺序
    pub async fn rule_texts<'a>(
        &self,
        groups: impl IntoIterator<Item = &'a [String]>,
    ) -> Result<Vec<String>, EngineError> {
        let mut seen = HashSet::new();
        let mut texts = Vec::new();
        for rule_id in groups.into_iter().flatten() {
            if seen.insert(rule_id.as_str()) {
                texts.push(self.rule(rule_id).await?.text);
            }
        }
        Ok(texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    async fn catalog() -> ProcedureCatalog {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_rule(&Rule::new("r1", "Be kind.")).await.unwrap();
        store.upsert_rule(&Rule::new("r2", "Be brief.")).await.unwrap();
        store
            .upsert_procedure(&Procedure::new("b", "B", vec!["x".into()]))
            .await
            .unwrap();
        store
            .upsert_procedure(&Procedure::new("a", "A", vec!["y".into()]))
            .await
            .unwrap();
        ProcedureCatalog::new(store)
    }

    #[tokio::test]
    async fn test_procedure_ids_sorted() {
        assert_eq!(catalog().await.procedure_ids().await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_missing_procedure_is_configuration_error() {
        let err = catalog().await.procedure("nope").await.unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_rule_texts_dedup_in_order() {
        let context_rules = vec!["r2".to_string(), "r1".to_string()];
        let procedure_rules = vec!["r1".to_string()];
        let texts = catalog()
            .await
            .rule_texts([context_rules.as_slice(), procedure_rules.as_slice()])
            .await
            .unwrap();
        assert_eq!(texts, vec!["Be brief.", "Be kind."]);
    }

    #[tokio::test]
    async fn test_missing_rule_is_configuration_error() {
        let ids = vec!["r9".to_string()];
        let err = catalog()
            .await
            .rule_texts([ids.as_slice()])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
