//! 持久化协作方接口 / Persistence collaborator interfaces
//!
//! 核心只消费这些trait，从不被持久层反向调用（仅拉取）
//! The core only consumes these traits; the persistence layer never calls
//! back in (pull-only)

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::message::{BufferedMessage, JobStatus, Notification};

/// 消息持久化 / Message persistence
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 单次批量落库，返回写入条数 / One batched durable write, returns rows written
    async fn batch_insert(&self, messages: &[BufferedMessage]) -> Result<usize>;
}

/// 上传状态持久化 / Upload status persistence
#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn update_upload_status(
        &self,
        upload_id: &str,
        status: &JobStatus,
        meta: serde_json::Value,
    ) -> Result<()>;
}

/// 通知记录持久化 / Notification record persistence
#[async_trait]
pub trait NotificationStore: Send + Sync {
    async fn create_notification_record(&self, notification: &Notification) -> Result<()>;
}

/// 内存实现，用于默认接线与测试 / In-memory implementation for default wiring and tests
#[derive(Default)]
pub struct MemoryStore {
    pub messages: RwLock<Vec<BufferedMessage>>,
    pub upload_statuses: DashMap<String, JobStatus>,
    pub notification_records: RwLock<Vec<Notification>>,
    /// 置true时batch_insert失败，用于测试重试路径 / When true batch_insert fails, for retry-path tests
    pub fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn batch_insert(&self, messages: &[BufferedMessage]) -> Result<usize> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("batch insert rejected");
        }
        let mut guard = self.messages.write();
        guard.extend_from_slice(messages);
        Ok(messages.len())
    }
}

#[async_trait]
impl UploadStore for MemoryStore {
    async fn update_upload_status(
        &self,
        upload_id: &str,
        status: &JobStatus,
        _meta: serde_json::Value,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("status update rejected");
        }
        self.upload_statuses
            .insert(upload_id.to_string(), status.clone());
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for MemoryStore {
    async fn create_notification_record(&self, notification: &Notification) -> Result<()> {
        self.notification_records.write().push(notification.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: usize) -> Vec<BufferedMessage> {
        (0..n)
            .map(|i| BufferedMessage {
                message_id: format!("m-{}", i),
                channel_id: "c1".into(),
                user_id: "u1".into(),
                content: "hi".into(),
                buffered_at: 0,
                metadata: serde_json::json!({}),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_memory_store_batch_insert() {
        let store = MemoryStore::new();
        let written = store.batch_insert(&sample(3)).await.expect("insert");
        assert_eq!(written, 3);
        assert_eq!(store.message_count(), 3);
    }

    #[tokio::test]
    async fn test_memory_store_failure_injection() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        assert!(store.batch_insert(&sample(1)).await.is_err());
        assert_eq!(store.message_count(), 0);
    }
}
