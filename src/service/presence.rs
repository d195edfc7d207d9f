//! 在线状态跟踪 / Presence tracking
//!
//! 每用户的全局online/away/offline状态机，独立于任何频道或工作区。
//! 状态转移：offline --上线--> online --away超时--> away --offline超时--> offline
//! Global per-user online/away/offline state machine, independent of any
//! channel or workspace. Transitions: offline --join--> online
//! --away timeout--> away --offline timeout--> offline

use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, info};

use crate::bus::SharedBus;
use crate::config::PresenceConfig;
use crate::domain::event::{kinds, topics};
use crate::domain::message::{PresenceRecord, PresenceSnapshot, PresenceStatus};
use crate::error::CoreError;
use crate::registry::Mailbox;

/// 每用户定时器种类 / Per-user timer kinds
///
/// 不变式：每个(用户, 种类)至多一个存活定时器，转移时取消并替换
/// Invariant: at most one live timer per (user, kind), cancel-and-replace on
/// every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PresenceTimer {
    Away,
    Offline,
}

pub enum PresenceCommand {
    SetOnline {
        user_id: String,
        conn_id: String,
        metadata: serde_json::Value,
    },
    SetAway {
        user_id: String,
    },
    SetOffline {
        user_id: String,
        conn_id: String,
    },
    Get {
        user_id: String,
        reply: oneshot::Sender<Option<PresenceSnapshot>>,
    },
    GetForWorkspace {
        user_ids: Vec<String>,
        reply: oneshot::Sender<Vec<PresenceSnapshot>>,
    },
    /// away定时器到期（内部） / Away timer fired (internal)
    AwayTimeout { user_id: String },
    /// offline定时器到期（内部） / Offline timer fired (internal)
    OfflineTimeout { user_id: String },
    /// 存活定时器计数，用于泄漏断言 / Live timer count, for leak assertions
    TimerCount { reply: oneshot::Sender<usize> },
}

/// 在线状态句柄 / Presence handle
#[derive(Clone)]
pub struct PresenceHandle {
    mailbox: Mailbox<PresenceCommand>,
}

impl PresenceHandle {
    pub fn new(mailbox: Mailbox<PresenceCommand>) -> Self {
        Self { mailbox }
    }

    pub fn set_online(&self, user_id: &str, conn_id: &str, metadata: serde_json::Value) {
        self.mailbox.send(PresenceCommand::SetOnline {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
            metadata,
        });
    }

    pub fn set_away(&self, user_id: &str) {
        self.mailbox.send(PresenceCommand::SetAway {
            user_id: user_id.to_string(),
        });
    }

    pub fn set_offline(&self, user_id: &str, conn_id: &str) {
        self.mailbox.send(PresenceCommand::SetOffline {
            user_id: user_id.to_string(),
            conn_id: conn_id.to_string(),
        });
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<PresenceSnapshot>, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(PresenceCommand::Get {
            user_id: user_id.to_string(),
            reply: tx,
        }) {
            return Err(CoreError::ActorUnavailable {
                name: "presence_tracker".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "presence_tracker".into(),
        })
    }

    pub async fn get_for_workspace(
        &self,
        user_ids: Vec<String>,
    ) -> Result<Vec<PresenceSnapshot>, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(PresenceCommand::GetForWorkspace {
            user_ids,
            reply: tx,
        }) {
            return Err(CoreError::ActorUnavailable {
                name: "presence_tracker".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "presence_tracker".into(),
        })
    }

    pub async fn timer_count(&self) -> Result<usize, CoreError> {
        let (tx, rx) = oneshot::channel();
        if !self.mailbox.send(PresenceCommand::TimerCount { reply: tx }) {
            return Err(CoreError::ActorUnavailable {
                name: "presence_tracker".into(),
            });
        }
        rx.await.map_err(|_| CoreError::ActorUnavailable {
            name: "presence_tracker".into(),
        })
    }
}

struct PresenceTracker {
    config: PresenceConfig,
    bus: SharedBus,
    records: HashMap<String, PresenceRecord>,
    timers: HashMap<(String, PresenceTimer), JoinHandle<()>>,
    self_tx: mpsc::UnboundedSender<PresenceCommand>,
}

/// 启动在线状态跟踪actor / Spawn the presence tracker actor
pub fn spawn(
    config: PresenceConfig,
    bus: SharedBus,
    mut shutdown_rx: watch::Receiver<bool>,
) -> (mpsc::UnboundedSender<PresenceCommand>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let self_tx = tx.clone();
    let join = tokio::spawn(async move {
        let sweep_every = Duration::from_millis(config.sweep_interval_ms);
        let mut actor = PresenceTracker {
            config,
            bus,
            records: HashMap::new(),
            timers: HashMap::new(),
            self_tx,
        };
        let mut sweep = interval(sweep_every);
        sweep.tick().await;
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(cmd) => actor.handle(cmd),
                        None => break,
                    }
                }
                _ = sweep.tick() => actor.sweep(),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        actor.cancel_all_timers();
    });
    (tx, join)
}

impl PresenceTracker {
    fn handle(&mut self, cmd: PresenceCommand) {
        match cmd {
            PresenceCommand::SetOnline {
                user_id,
                conn_id,
                metadata,
            } => self.set_online(&user_id, &conn_id, metadata),
            PresenceCommand::SetAway { user_id } => self.set_away(&user_id),
            PresenceCommand::SetOffline { user_id, conn_id } => {
                self.set_offline(&user_id, &conn_id)
            }
            PresenceCommand::Get { user_id, reply } => {
                let _ = reply.send(self.records.get(&user_id).map(|r| r.snapshot()));
            }
            PresenceCommand::GetForWorkspace { user_ids, reply } => {
                let snapshots = user_ids
                    .iter()
                    .filter_map(|id| self.records.get(id).map(|r| r.snapshot()))
                    .collect();
                let _ = reply.send(snapshots);
            }
            PresenceCommand::AwayTimeout { user_id } => {
                self.timers.remove(&(user_id.clone(), PresenceTimer::Away));
                self.set_away(&user_id);
            }
            PresenceCommand::OfflineTimeout { user_id } => {
                self.timers
                    .remove(&(user_id.clone(), PresenceTimer::Offline));
                if self
                    .records
                    .get(&user_id)
                    .map(|r| r.status == PresenceStatus::Away)
                    .unwrap_or(false)
                {
                    self.go_offline(&user_id);
                }
            }
            PresenceCommand::TimerCount { reply } => {
                let _ = reply.send(self.timers.len());
            }
        }
    }

    /// 上线或活动 / Come online, or record activity
    fn set_online(&mut self, user_id: &str, conn_id: &str, metadata: serde_json::Value) {
        let now = Utc::now().timestamp_millis();
        let record = self
            .records
            .entry(user_id.to_string())
            .or_insert_with(|| PresenceRecord {
                user_id: user_id.to_string(),
                status: PresenceStatus::Offline,
                last_seen: now,
                connections: Default::default(),
                metadata: serde_json::Value::Null,
            });
        record.connections.insert(conn_id.to_string());
        record.last_seen = now;
        if !metadata.is_null() {
            record.metadata = metadata;
        }
        let changed = record.status != PresenceStatus::Online;
        record.status = PresenceStatus::Online;

        // 活动重置away定时器并取消待定的offline定时器
        // Activity resets the away timer and cancels a pending offline timer
        self.cancel_timer(user_id, PresenceTimer::Offline);
        self.arm_timer(
            user_id,
            PresenceTimer::Away,
            self.config.away_timeout_ms,
        );
        if changed {
            self.publish_diff(user_id);
        }
    }

    fn set_away(&mut self, user_id: &str) {
        let Some(record) = self.records.get_mut(user_id) else {
            return;
        };
        if record.status != PresenceStatus::Online {
            return;
        }
        record.status = PresenceStatus::Away;
        self.cancel_timer(user_id, PresenceTimer::Away);
        self.arm_timer(
            user_id,
            PresenceTimer::Offline,
            self.config.offline_timeout_ms,
        );
        self.publish_diff(user_id);
    }

    /// 断开一个连接 / Disconnect one connection
    fn set_offline(&mut self, user_id: &str, conn_id: &str) {
        let Some(record) = self.records.get_mut(user_id) else {
            return;
        };
        record.connections.remove(conn_id);
        if record.connections.is_empty() {
            // 连接集清空即离线，记录销毁 / Empty connection set means offline; record destroyed
            self.go_offline(user_id);
        } else {
            record.last_seen = Utc::now().timestamp_millis();
        }
    }

    /// 强制离线并销毁记录 / Force offline and destroy the record
    fn go_offline(&mut self, user_id: &str) {
        self.cancel_timer(user_id, PresenceTimer::Away);
        self.cancel_timer(user_id, PresenceTimer::Offline);
        if let Some(mut record) = self.records.remove(user_id) {
            record.status = PresenceStatus::Offline;
            record.connections.clear();
            let payload = serde_json::json!({
                "user_id": user_id,
                "status": PresenceStatus::Offline,
                "last_seen": record.last_seen,
                "connection_count": 0,
            });
            self.bus
                .emit(topics::PRESENCE, kinds::PRESENCE_DIFF, payload.clone());
            self.bus
                .emit(&topics::user_presence(user_id), kinds::PRESENCE_DIFF, payload);
            info!("👋 Presence offline: {}", user_id);
        }
    }

    /// 周期清扫，防御丢失的定时器消息 / Periodic sweep, guards against lost timer messages
    fn sweep(&mut self) {
        let now = Utc::now().timestamp_millis();
        let offline_after = self.config.offline_timeout_ms as i64;
        let away_after = self.config.away_timeout_ms as i64;
        let stale: Vec<String> = self
            .records
            .values()
            .filter(|r| match r.status {
                // 自然离线时刻为 last_seen + away超时 + offline超时；超过即视为定时器丢失
                // Natural offline instant is last_seen + away + offline timeouts;
                // anything older means a timer message was lost
                PresenceStatus::Online | PresenceStatus::Away => {
                    now - r.last_seen > away_after + offline_after
                }
                PresenceStatus::Offline => true,
            })
            .map(|r| r.user_id.clone())
            .collect();
        if !stale.is_empty() {
            debug!("🧹 Presence sweep forcing {} records offline", stale.len());
        }
        for user_id in stale {
            self.go_offline(&user_id);
        }
    }

    fn publish_diff(&self, user_id: &str) {
        let Some(record) = self.records.get(user_id) else {
            return;
        };
        let payload = serde_json::json!({
            "user_id": record.user_id,
            "status": record.status,
            "last_seen": record.last_seen,
            "connection_count": record.connections.len(),
        });
        self.bus
            .emit(topics::PRESENCE, kinds::PRESENCE_DIFF, payload.clone());
        self.bus
            .emit(&topics::user_presence(user_id), kinds::PRESENCE_DIFF, payload);
    }

    /// 取消并替换 (用户, 种类) 的定时器 / Cancel-and-replace the (user, kind) timer
    fn arm_timer(&mut self, user_id: &str, kind: PresenceTimer, after_ms: u64) {
        self.cancel_timer(user_id, kind);
        let tx = self.self_tx.clone();
        let user = user_id.to_string();
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(after_ms)).await;
            let cmd = match kind {
                PresenceTimer::Away => PresenceCommand::AwayTimeout { user_id: user },
                PresenceTimer::Offline => PresenceCommand::OfflineTimeout { user_id: user },
            };
            let _ = tx.send(cmd);
        });
        self.timers.insert((user_id.to_string(), kind), handle);
    }

    fn cancel_timer(&mut self, user_id: &str, kind: PresenceTimer) {
        if let Some(handle) = self.timers.remove(&(user_id.to_string(), kind)) {
            handle.abort();
        }
    }

    fn cancel_all_timers(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use std::sync::Arc;

    fn setup(config: PresenceConfig) -> (PresenceHandle, SharedBus, watch::Sender<bool>) {
        let bus = Arc::new(EventBus::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tx, _join) = spawn(config, bus.clone(), shutdown_rx);
        (PresenceHandle::new(Mailbox::new(tx)), bus, shutdown_tx)
    }

    fn fast_config() -> PresenceConfig {
        PresenceConfig {
            away_timeout_ms: 100,
            offline_timeout_ms: 80,
            sweep_interval_ms: 60_000,
        }
    }

    #[tokio::test]
    async fn test_online_away_offline_transitions() {
        let (presence, bus, _shutdown) = setup(fast_config());
        let mut diffs = bus.subscribe("test", topics::PRESENCE);

        presence.set_online("u1", "conn-1", serde_json::json!({"device": "web"}));
        let ev = diffs.recv().await.unwrap();
        assert_eq!(ev.payload["status"], "online");

        // away超时 / Away timeout
        let ev = diffs.recv().await.unwrap();
        assert_eq!(ev.payload["status"], "away");

        // offline超时后记录销毁 / Record destroyed after offline timeout
        let ev = diffs.recv().await.unwrap();
        assert_eq!(ev.payload["status"], "offline");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(presence.get("u1").await.unwrap().is_none());
        assert_eq!(presence.timer_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_activity_resets_away_timer() {
        let (presence, bus, _shutdown) = setup(PresenceConfig {
            away_timeout_ms: 200,
            offline_timeout_ms: 80,
            sweep_interval_ms: 60_000,
        });
        let mut diffs = bus.subscribe("test", topics::PRESENCE);
        presence.set_online("u1", "conn-1", serde_json::Value::Null);
        let _ = diffs.recv().await.unwrap();

        // 持续活动跨越原定away时刻 / Keep active past the original away instant
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(120)).await;
            presence.set_online("u1", "conn-1", serde_json::Value::Null);
        }
        let snap = presence.get("u1").await.unwrap().expect("record");
        assert_eq!(snap.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_multi_connection_offline_only_when_set_empties() {
        let (presence, _bus, _shutdown) = setup(PresenceConfig {
            away_timeout_ms: 60_000,
            offline_timeout_ms: 60_000,
            sweep_interval_ms: 60_000,
        });
        presence.set_online("u1", "conn-a", serde_json::Value::Null);
        presence.set_online("u1", "conn-b", serde_json::Value::Null);
        presence.set_offline("u1", "conn-a");

        let snap = presence.get("u1").await.unwrap().expect("record");
        assert_eq!(snap.status, PresenceStatus::Online);
        assert_eq!(snap.connection_count, 1);

        presence.set_offline("u1", "conn-b");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(presence.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_connection_set_never_reported_online_or_away() {
        // 随机join/leave序列下的不变式 / Invariant over a random join/leave sequence
        use rand::Rng;
        let (presence, _bus, _shutdown) = setup(PresenceConfig {
            away_timeout_ms: 60_000,
            offline_timeout_ms: 60_000,
            sweep_interval_ms: 60_000,
        });
        let users = ["u1", "u2", "u3"];
        let conns = ["c1", "c2", "c3"];
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let user = users[rng.gen_range(0..users.len())];
            let conn = conns[rng.gen_range(0..conns.len())];
            if rng.gen_bool(0.5) {
                presence.set_online(user, conn, serde_json::Value::Null);
            } else {
                presence.set_offline(user, conn);
            }
        }
        for user in users {
            if let Some(snap) = presence.get(user).await.unwrap() {
                assert!(
                    snap.connection_count > 0,
                    "user {} reported {:?} with empty connection set",
                    user,
                    snap.status
                );
            }
        }
    }

    #[tokio::test]
    async fn test_get_for_workspace() {
        let (presence, _bus, _shutdown) = setup(PresenceConfig {
            away_timeout_ms: 60_000,
            offline_timeout_ms: 60_000,
            sweep_interval_ms: 60_000,
        });
        presence.set_online("u1", "c1", serde_json::Value::Null);
        presence.set_online("u2", "c2", serde_json::Value::Null);
        let snaps = presence
            .get_for_workspace(vec!["u1".into(), "u2".into(), "absent".into()])
            .await
            .unwrap();
        assert_eq!(snaps.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_forces_stale_records_offline() {
        // 快速清扫配合大offline窗口：伪造丢失定时器的场景
        // Fast sweep with large per-user windows: emulates lost timer messages
        let (presence, bus, _shutdown) = setup(PresenceConfig {
            away_timeout_ms: 10,
            offline_timeout_ms: 10,
            sweep_interval_ms: 50,
        });
        let mut diffs = bus.subscribe("test", topics::PRESENCE);
        presence.set_online("u1", "conn-1", serde_json::Value::Null);
        let _ = diffs.recv().await.unwrap();

        // 即使away/offline定时器事件乱序或丢失，清扫最终强制离线
        // Sweep eventually forces offline even if timer messages were lost
        let mut saw_offline = false;
        for _ in 0..4 {
            if let Ok(Some(ev)) =
                tokio::time::timeout(Duration::from_millis(300), diffs.recv()).await
            {
                if ev.payload["status"] == "offline" {
                    saw_offline = true;
                    break;
                }
            }
        }
        assert!(saw_offline);
    }
}
