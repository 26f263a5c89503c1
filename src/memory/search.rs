//! 相关度检索
//!
//! 所有后端都只负责取出候选记录（按归属过滤），最终的过滤、排序、截断统一在这里完成，
//! 保证同一数据在不同后端上得到完全相同的结果顺序。

use std::cmp::Ordering;

use super::{MemoryEntry, MemoryQuery, MemoryRecord};

/// 过滤 + 排序 + 截断
///
/// 排序键：relevance_score 降序，updated_at 降序，memory_id 升序（保证全序）。
pub fn rank_memories(
    candidates: impl IntoIterator<Item = MemoryRecord>,
    query: &MemoryQuery,
) -> Vec<MemoryEntry> {
    let needle = query.text.to_lowercase();
    let mut hits: Vec<MemoryRecord> = candidates
        .into_iter()
        .filter(|r| r.entry.is_owned_by(&query.user_id, &query.agent_id))
        .filter(|r| query.memory_type.map_or(true, |t| r.entry.memory_type == t))
        .filter(|r| needle.is_empty() || r.entry.content.to_lowercase().contains(&needle))
        .collect();

    hits.sort_by(compare_records);
    hits.truncate(query.limit);
    hits.into_iter().map(|r| r.entry).collect()
}

fn compare_records(a: &MemoryRecord, b: &MemoryRecord) -> Ordering {
    b.entry
        .relevance_score
        .total_cmp(&a.entry.relevance_score)
        .then_with(|| b.updated_at.cmp(&a.updated_at))
        .then_with(|| a.entry.memory_id.cmp(&b.entry.memory_id))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::memory::MemoryType;

    fn record(id: &str, user: &str, content: &str, score: f64, age_secs: i64) -> MemoryRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let at = base - Duration::seconds(age_secs);
        MemoryRecord {
            entry: MemoryEntry::new(user, "agent", MemoryType::Semantic, content)
                .with_id(id)
                .with_relevance(score),
            created_at: at,
            updated_at: at,
        }
    }

    fn ids(entries: &[MemoryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.memory_id.as_str()).collect()
    }

    #[test]
    fn test_rank_by_score_then_recency() {
        let candidates = vec![
            record("m1", "u", "alpha", 0.9, 30),
            record("m2", "u", "alpha beta", 0.5, 20),
            record("m3", "u", "ALPHA", 0.5, 10),
        ];
        let query = MemoryQuery::new("u", "agent").with_text("alpha").with_limit(10);
        let ranked = rank_memories(candidates, &query);
        assert_eq!(ids(&ranked), vec!["m1", "m3", "m2"]);
    }

    #[test]
    fn test_rank_truncates_to_limit() {
        let candidates = vec![
            record("m1", "u", "alpha", 0.9, 30),
            record("m2", "u", "alpha", 0.5, 20),
            record("m3", "u", "alpha", 0.5, 10),
        ];
        let query = MemoryQuery::new("u", "agent").with_text("alpha").with_limit(2);
        assert_eq!(ids(&rank_memories(candidates, &query)), vec!["m1", "m3"]);
    }

    #[test]
    fn test_rank_filters_owner_and_type() {
        let mut episodic = record("e1", "u", "walk", 0.1, 0);
        episodic.entry.memory_type = MemoryType::Episodic;
        let candidates = vec![
            record("s1", "u", "walk", 0.2, 0),
            record("other", "someone-else", "walk", 1.0, 0),
            episodic,
        ];
        let query = MemoryQuery::new("u", "agent").with_type(MemoryType::Episodic);
        assert_eq!(ids(&rank_memories(candidates, &query)), vec!["e1"]);
    }

    #[test]
    fn test_rank_empty_text_matches_all() {
        let candidates = vec![record("a", "u", "x", 0.1, 0), record("b", "u", "y", 0.2, 0)];
        let query = MemoryQuery::new("u", "agent");
        assert_eq!(ids(&rank_memories(candidates, &query)), vec!["b", "a"]);
    }

    #[test]
    fn test_rank_case_insensitive_unicode() {
        let candidates = vec![record("a", "u", "Café ÉCLAIR", 0.1, 0)];
        let query = MemoryQuery::new("u", "agent").with_text("éclair");
        assert_eq!(rank_memories(candidates, &query).len(), 1);
    }

    #[test]
    fn test_rank_full_tie_uses_memory_id() {
        let candidates = vec![record("b", "u", "x", 0.5, 0), record("a", "u", "x", 0.5, 0)];
        let query = MemoryQuery::new("u", "agent");
        assert_eq!(ids(&rank_memories(candidates, &query)), vec!["a", "b"]);
    }
}
