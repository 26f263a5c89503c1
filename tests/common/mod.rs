//! 集成测试共用的后端构造

#![allow(dead_code)]

use std::sync::Arc;

use keeper::store::{InMemoryStore, SqliteStore, Store};
use tempfile::TempDir;

/// 持有 Store 以及它依赖的临时目录
pub struct Backend {
    pub store: Arc<dyn Store>,
    _dir: Option<TempDir>,
}

impl Backend {
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }
}

pub async fn memory_backend() -> Option<Backend> {
    Some(Backend {
        store: Arc::new(InMemoryStore::new()),
        _dir: None,
    })
}

pub async fn sqlite_backend() -> Option<Backend> {
    let dir = TempDir::new().unwrap();
    let store = SqliteStore::open(dir.path().join("keeper.db")).await.unwrap();
    Some(Backend {
        store: Arc::new(store),
        _dir: Some(dir),
    })
}

/// 仅当设置了 KEEPER_TEST_POSTGRES_URL 时返回
#[cfg(feature = "postgres")]
pub async fn postgres_backend() -> Option<Backend> {
    let url = std::env::var("KEEPER_TEST_POSTGRES_URL").ok()?;
    let store = keeper::store::PostgresStore::connect(&url, 2, std::time::Duration::from_secs(5))
        .await
        .unwrap();
    Some(Backend {
        store: Arc::new(store),
        _dir: None,
    })
}

#[cfg(not(feature = "postgres"))]
pub async fn postgres_backend() -> Option<Backend> {
    None
}

/// 每个测试使用独立 ID 前缀，共享数据库时互不干扰
pub fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}
