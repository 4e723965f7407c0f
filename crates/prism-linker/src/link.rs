//! Linkage derivation: given a request's message history and read access to
//! previously persisted rows, decide which conversation/branch the request
//! belongs to, who its parent is, and whether it was spawned by a Task tool.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use prism_protocol::MessagesRequest;

use crate::error::Result;
use crate::hash;

pub const MAIN_BRANCH: &str = "main";

/// Lookback window for matching a first turn against Task tool prompts.
const SUBTASK_LOOKBACK_HOURS: i64 = 24;

/// A previously persisted request row, reduced to the linkage fields.
#[derive(Debug, Clone)]
pub struct PriorRequest {
    pub request_id: Uuid,
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub timestamp: DateTime<Utc>,
    pub current_message_hash: Option<String>,
}

/// A Task tool invocation whose prompt matched a new conversation's opening
/// user content.
#[derive(Debug, Clone)]
pub struct TaskMatch {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Read access the linker needs. Implemented by the storage layer; tests use
/// an in-memory table.
#[async_trait]
pub trait LinkStore: Send + Sync {
    /// Rows whose `current_message_hash` equals `hash` (parent candidates).
    async fn requests_with_current_hash(&self, hash: &str) -> Result<Vec<PriorRequest>>;

    /// Rows whose `parent_message_hash` equals `hash` (sibling candidates).
    async fn requests_with_parent_hash(&self, hash: &str) -> Result<Vec<PriorRequest>>;

    /// Most recent request since `since` whose response contained a Task
    /// tool use with exactly this prompt.
    async fn find_task_invocation(
        &self,
        prompt: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<TaskMatch>>;
}

/// Fully derived linkage fields for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct Linkage {
    pub conversation_id: Uuid,
    pub branch_id: String,
    pub current_message_hash: Option<String>,
    pub parent_message_hash: Option<String>,
    pub system_hash: Option<String>,
    pub parent_request_id: Option<Uuid>,
    pub is_subtask: bool,
    pub parent_task_request_id: Option<Uuid>,
}

/// Derive linkage for `request`. Deterministic in the hashes; the store is
/// only read, never written.
pub async fn link(
    store: &dyn LinkStore,
    request: &MessagesRequest,
    now: DateTime<Utc>,
) -> Result<Linkage> {
    let current = hash::current_message_hash(&request.messages);
    let parent = hash::parent_message_hash(&request.messages);
    let system = hash::system_hash(request.system.as_ref());

    let mut linkage = Linkage {
        conversation_id: Uuid::new_v4(),
        branch_id: MAIN_BRANCH.to_string(),
        current_message_hash: current.clone(),
        parent_message_hash: parent.clone(),
        system_hash: system,
        parent_request_id: None,
        is_subtask: false,
        parent_task_request_id: None,
    };

    if let Some(parent_hash) = parent.as_deref() {
        let parents = store.requests_with_current_hash(parent_hash).await?;
        // Rows that already continued from the same parent state. A replay of
        // this very request (same current hash) is not a sibling.
        let siblings: Vec<PriorRequest> = store
            .requests_with_parent_hash(parent_hash)
            .await?
            .into_iter()
            .filter(|row| row.current_message_hash != current)
            .collect();

        if let Some(anchor) = most_recent(parents.iter().chain(siblings.iter())) {
            linkage.conversation_id = anchor.conversation_id;
            linkage.parent_request_id = Some(anchor.request_id);
            linkage.branch_id = if siblings.is_empty() {
                // Linear continuation: stay on the parent's branch.
                most_recent(parents.iter())
                    .map(|p| p.branch_id.clone())
                    .unwrap_or_else(|| MAIN_BRANCH.to_string())
            } else {
                // The parent state already has children: this is a fork.
                branch_label(current.as_deref())
            };
            return Ok(linkage);
        }
        // No prior row matches: fall through to a fresh conversation. The
        // parent hash is still recorded for later reconstruction.
        return Ok(linkage);
    }

    // First turn of a new conversation: check whether the opening user
    // content quotes a Task tool prompt issued in the last 24h.
    let opening = request.last_user_text();
    if !opening.trim().is_empty() {
        let since = now - Duration::hours(SUBTASK_LOOKBACK_HOURS);
        if let Some(task) = store.find_task_invocation(opening.trim(), since).await? {
            linkage.is_subtask = true;
            linkage.parent_task_request_id = Some(task.request_id);
        }
    }

    Ok(linkage)
}

/// Stable branch label derived from the request's own content hash.
fn branch_label(current_hash: Option<&str>) -> String {
    match current_hash {
        Some(hash) => format!("branch_{}", &hash[..8.min(hash.len())]),
        None => MAIN_BRANCH.to_string(),
    }
}

fn most_recent<'a>(rows: impl Iterator<Item = &'a PriorRequest>) -> Option<&'a PriorRequest> {
    rows.max_by_key(|row| row.timestamp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    struct MemoryStore {
        rows: Mutex<Vec<(PriorRequest, Option<String>)>>, // (row, parent_hash)
        tasks: Mutex<Vec<(String, TaskMatch)>>,           // (prompt, match)
    }

    impl MemoryStore {
        fn new() -> Self {
            Self {
                rows: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }
        }

        fn insert(&self, row: PriorRequest, parent_hash: Option<String>) {
            self.rows.lock().unwrap().push((row, parent_hash));
        }
    }

    #[async_trait]
    impl LinkStore for MemoryStore {
        async fn requests_with_current_hash(&self, hash: &str) -> Result<Vec<PriorRequest>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(row, _)| row.current_message_hash.as_deref() == Some(hash))
                .map(|(row, _)| row.clone())
                .collect())
        }

        async fn requests_with_parent_hash(&self, hash: &str) -> Result<Vec<PriorRequest>> {
            Ok(self
                .rows
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, parent)| parent.as_deref() == Some(hash))
                .map(|(row, _)| row.clone())
                .collect())
        }

        async fn find_task_invocation(
            &self,
            prompt: &str,
            _since: DateTime<Utc>,
        ) -> Result<Option<TaskMatch>> {
            Ok(self
                .tasks
                .lock()
                .unwrap()
                .iter()
                .find(|(p, _)| p == prompt)
                .map(|(_, m)| m.clone()))
        }
    }

    fn request(messages: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(json!({"model": "m", "messages": messages})).unwrap()
    }

    fn ts(offset_secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + offset_secs, 0).unwrap()
    }

    #[tokio::test]
    async fn first_turn_mints_a_conversation() {
        let store = MemoryStore::new();
        let req = request(json!([{"role": "user", "content": "a"}]));
        let linkage = link(&store, &req, ts(0)).await.unwrap();

        assert_eq!(linkage.branch_id, MAIN_BRANCH);
        assert!(linkage.parent_message_hash.is_none());
        assert!(linkage.parent_request_id.is_none());
        assert!(!linkage.is_subtask);
    }

    #[tokio::test]
    async fn second_turn_links_to_the_first() {
        let store = MemoryStore::new();
        let first = request(json!([{"role": "user", "content": "a"}]));
        let first_linkage = link(&store, &first, ts(0)).await.unwrap();

        let first_id = Uuid::new_v4();
        store.insert(
            PriorRequest {
                request_id: first_id,
                conversation_id: first_linkage.conversation_id,
                branch_id: first_linkage.branch_id.clone(),
                timestamp: ts(0),
                current_message_hash: first_linkage.current_message_hash.clone(),
            },
            first_linkage.parent_message_hash.clone(),
        );

        let second = request(json!([
            {"role": "user", "content": "a"},
            {"role": "assistant", "content": "b"},
            {"role": "user", "content": "c"},
        ]));
        let second_linkage = link(&store, &second, ts(10)).await.unwrap();

        assert_eq!(
            second_linkage.parent_message_hash,
            first_linkage.current_message_hash
        );
        assert_eq!(
            second_linkage.conversation_id,
            first_linkage.conversation_id
        );
        assert_eq!(second_linkage.branch_id, MAIN_BRANCH);
        assert_eq!(second_linkage.parent_request_id, Some(first_id));
    }

    #[tokio::test]
    async fn fork_gets_a_new_branch_and_points_at_the_sibling() {
        let store = MemoryStore::new();
        let first = request(json!([{"role": "user", "content": "a"}]));
        let first_linkage = link(&store, &first, ts(0)).await.unwrap();
        let first_id = Uuid::new_v4();
        store.insert(
            PriorRequest {
                request_id: first_id,
                conversation_id: first_linkage.conversation_id,
                branch_id: first_linkage.branch_id.clone(),
                timestamp: ts(0),
                current_message_hash: first_linkage.current_message_hash.clone(),
            },
            first_linkage.parent_message_hash.clone(),
        );

        let second = request(json!([
            {"role": "user", "content": "a"},
            {"role": "assistant", "content": "b"},
            {"role": "user", "content": "c"},
        ]));
        let second_linkage = link(&store, &second, ts(10)).await.unwrap();
        let second_id = Uuid::new_v4();
        store.insert(
            PriorRequest {
                request_id: second_id,
                conversation_id: second_linkage.conversation_id,
                branch_id: second_linkage.branch_id.clone(),
                timestamp: ts(10),
                current_message_hash: second_linkage.current_message_hash.clone(),
            },
            second_linkage.parent_message_hash.clone(),
        );

        // Same parent state, different final user turn.
        let third = request(json!([
            {"role": "user", "content": "a"},
            {"role": "assistant", "content": "b"},
            {"role": "user", "content": "d"},
        ]));
        let third_linkage = link(&store, &third, ts(20)).await.unwrap();

        assert_eq!(
            third_linkage.parent_message_hash,
            second_linkage.parent_message_hash
        );
        assert_ne!(
            third_linkage.current_message_hash,
            second_linkage.current_message_hash
        );
        assert_eq!(
            third_linkage.conversation_id,
            first_linkage.conversation_id
        );
        assert_ne!(third_linkage.branch_id, MAIN_BRANCH);
        assert!(third_linkage.branch_id.starts_with("branch_"));
        // the most recent row sharing the parent state wins
        assert_eq!(third_linkage.parent_request_id, Some(second_id));
    }

    #[tokio::test]
    async fn replaying_the_same_request_does_not_fork() {
        let store = MemoryStore::new();
        let first = request(json!([{"role": "user", "content": "a"}]));
        let first_linkage = link(&store, &first, ts(0)).await.unwrap();
        let first_id = Uuid::new_v4();
        store.insert(
            PriorRequest {
                request_id: first_id,
                conversation_id: first_linkage.conversation_id,
                branch_id: first_linkage.branch_id.clone(),
                timestamp: ts(0),
                current_message_hash: first_linkage.current_message_hash.clone(),
            },
            first_linkage.parent_message_hash.clone(),
        );

        let second = request(json!([
            {"role": "user", "content": "a"},
            {"role": "assistant", "content": "b"},
            {"role": "user", "content": "c"},
        ]));
        let linkage_a = link(&store, &second, ts(10)).await.unwrap();
        store.insert(
            PriorRequest {
                request_id: Uuid::new_v4(),
                conversation_id: linkage_a.conversation_id,
                branch_id: linkage_a.branch_id.clone(),
                timestamp: ts(10),
                current_message_hash: linkage_a.current_message_hash.clone(),
            },
            linkage_a.parent_message_hash.clone(),
        );

        // Re-running the linker on identical input keeps main (its own row is
        // not treated as a sibling).
        let linkage_b = link(&store, &second, ts(11)).await.unwrap();
        assert_eq!(linkage_b.branch_id, MAIN_BRANCH);
        assert_eq!(linkage_b.conversation_id, linkage_a.conversation_id);
    }

    #[tokio::test]
    async fn opening_turn_matching_a_task_prompt_is_a_subtask() {
        let store = MemoryStore::new();
        let spawner_id = Uuid::new_v4();
        store
            .tasks
            .lock()
            .unwrap()
            .push((
                "survey the auth module".to_string(),
                TaskMatch {
                    request_id: spawner_id,
                    timestamp: ts(0),
                },
            ));

        let req = request(json!([{"role": "user", "content": "survey the auth module"}]));
        let linkage = link(&store, &req, ts(100)).await.unwrap();

        assert!(linkage.is_subtask);
        assert_eq!(linkage.parent_task_request_id, Some(spawner_id));
        // still its own conversation
        assert_eq!(linkage.branch_id, MAIN_BRANCH);
    }
}
