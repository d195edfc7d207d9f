//! 名称注册表与actor寻址 / Name registry and actor addressing
//!
//! 逻辑实体键（workspace:<id>、channel:<id>）到当前持有该实体的actor句柄
//! Maps a logical entity key (workspace:<id>, channel:<id>) to the handle of
//! the actor instance currently owning it

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// 可替换的actor信箱 / Replaceable actor mailbox
///
/// 监督者重启actor后替换内部发送端，持有该信箱的调用方无需更新
/// The supervisor swaps the inner sender after a restart so callers holding
/// the mailbox never go stale
pub struct Mailbox<C> {
    tx: Arc<RwLock<mpsc::UnboundedSender<C>>>,
}

impl<C> Clone for Mailbox<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C> Mailbox<C> {
    pub fn new(tx: mpsc::UnboundedSender<C>) -> Self {
        Self {
            tx: Arc::new(RwLock::new(tx)),
        }
    }

    /// 投递命令，actor已停止时返回false / Send a command, false if the actor is gone
    pub fn send(&self, cmd: C) -> bool {
        self.tx.read().send(cmd).is_ok()
    }

    /// 重启后替换发送端 / Replace the sender after a restart
    pub fn replace(&self, tx: mpsc::UnboundedSender<C>) {
        *self.tx.write() = tx;
    }
}

/// 注册表中的actor句柄 / Actor handle held by the registry
pub struct ActorHandle<C> {
    pub mailbox: Mailbox<C>,
    pub abort: AbortHandle,
    pub started_at: i64,
}

impl<C> Clone for ActorHandle<C> {
    fn clone(&self) -> Self {
        Self {
            mailbox: self.mailbox.clone(),
            abort: self.abort.clone(),
            started_at: self.started_at,
        }
    }
}

impl<C> ActorHandle<C> {
    pub fn new(mailbox: Mailbox<C>, abort: AbortHandle) -> Self {
        Self {
            mailbox,
            abort,
            started_at: Utc::now().timestamp_millis(),
        }
    }
}

/// 名称注册表 / Name registry
///
/// 由协调器/监督者独占持有，从不对外暴露可变访问
/// Owned by the coordinator/supervisor, never exposed for external mutation
pub struct Registry<C> {
    entries: DashMap<String, ActorHandle<C>>,
}

impl<C> Registry<C> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(&self, key: &str, handle: ActorHandle<C>) {
        self.entries.insert(key.to_string(), handle);
    }

    pub fn unregister(&self, key: &str) -> Option<ActorHandle<C>> {
        self.entries.remove(key).map(|(_, h)| h)
    }

    /// 仅当started_at一致时移除，避免误删重启后的新实例
    /// Remove only when started_at matches, protecting a restarted instance
    pub fn unregister_if_started_at(&self, key: &str, started_at: i64) -> bool {
        self.entries
            .remove_if(key, |_, h| h.started_at == started_at)
            .is_some()
    }

    pub fn lookup(&self, key: &str) -> Option<ActorHandle<C>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// 原子的查找或插入，保证懒启动幂等 / Atomic lookup-or-insert, keeps lazy starts idempotent
    pub fn get_or_insert_with(
        &self,
        key: &str,
        make: impl FnOnce() -> ActorHandle<C>,
    ) -> ActorHandle<C> {
        self.entries
            .entry(key.to_string())
            .or_insert_with(make)
            .clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn list(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C> Default for Registry<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// 实体键方案 / Entity key scheme
pub mod keys {
    pub fn workspace(id: &str) -> String {
        format!("workspace:{}", id)
    }

    pub fn channel(id: &str) -> String {
        format!("channel:{}", id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry: Registry<u32> = Registry::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(async move { while rx.recv().await.is_some() {} });
        let handle = ActorHandle::new(Mailbox::new(tx), join.abort_handle());

        registry.register(&keys::channel("c1"), handle);
        assert!(registry.contains("channel:c1"));
        assert_eq!(registry.len(), 1);

        let found = registry.lookup("channel:c1").expect("registered");
        assert!(found.mailbox.send(7));

        assert!(registry.unregister("channel:c1").is_some());
        assert!(registry.is_empty());
        join.abort();
    }

    #[tokio::test]
    async fn test_unregister_if_started_at_protects_new_instance() {
        let registry: Registry<u32> = Registry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let join = tokio::spawn(async {});
        let old = ActorHandle {
            mailbox: Mailbox::new(tx.clone()),
            abort: join.abort_handle(),
            started_at: 1,
        };
        registry.register("channel:c1", old);

        let newer = ActorHandle {
            mailbox: Mailbox::new(tx),
            abort: join.abort_handle(),
            started_at: 2,
        };
        registry.register("channel:c1", newer);

        // 针对旧started_at的移除不得命中新实例 / Stale removal must not hit the new instance
        assert!(!registry.unregister_if_started_at("channel:c1", 1));
        assert!(registry.contains("channel:c1"));
        assert!(registry.unregister_if_started_at("channel:c1", 2));
    }
}
