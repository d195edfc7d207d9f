//! 事件总线 / Event bus
//!
//! 提供actor之间以及actor到外部传输层的主题订阅和发布机制
//! Topic-based subscription/publication between actors and outward to the
//! transport layer

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::domain::event::BusEvent;

/// 订阅信息 / Subscription info
struct BusSubscriber {
    /// 订阅者名称 / Subscriber name
    name: String,
    /// 事件投递通道 / Event delivery channel
    sender: mpsc::UnboundedSender<BusEvent>,
}

/// 事件总线 / Event Bus
///
/// 订阅表：主题模式 -> 订阅者列表。模式支持尾部通配符：
/// `channel:*` 匹配所有以 `channel:` 开头的主题，`*` 匹配全部。
/// Subscription table: topic pattern -> subscribers. Patterns support a
/// trailing wildcard: `channel:*` matches every topic starting with
/// `channel:`, `*` matches everything.
pub struct EventBus {
    subscriptions: DashMap<String, Vec<BusSubscriber>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// 订阅主题模式 / Subscribe to a topic pattern
    ///
    /// 返回无界接收端；订阅者掉线后在下一次投递失败时被清除
    /// Returns an unbounded receiver; a dropped subscriber is purged on the
    /// next failed delivery
    pub fn subscribe(&self, name: &str, pattern: &str) -> mpsc::UnboundedReceiver<BusEvent> {
        debug!("📝 Bus subscribe: {} -> {}", name, pattern);
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions
            .entry(pattern.to_string())
            .or_default()
            .push(BusSubscriber {
                name: name.to_string(),
                sender: tx,
            });
        rx
    }

    /// 取消某订阅者在某模式下的订阅 / Unsubscribe a subscriber from a pattern
    pub fn unsubscribe(&self, name: &str, pattern: &str) {
        if let Some(mut subs) = self.subscriptions.get_mut(pattern) {
            subs.retain(|s| s.name != name);
        }
    }

    /// 发布事件 / Publish an event
    ///
    /// 投递是非阻塞的且从不报错跨出actor边界；死订阅者被剔除
    /// Delivery is non-blocking and never errors across actor boundaries;
    /// dead subscribers are dropped from the table
    pub fn publish(&self, event: BusEvent) {
        let mut delivered = 0u64;
        let mut dropped = 0u64;
        for mut entry in self.subscriptions.iter_mut() {
            if !matches_pattern(&event.topic, entry.key()) {
                continue;
            }
            entry.value_mut().retain(|sub| {
                match sub.sender.send(event.clone()) {
                    Ok(()) => {
                        delivered += 1;
                        true
                    }
                    Err(_) => {
                        warn!("🗑️  Dropping dead bus subscriber: {}", sub.name);
                        dropped += 1;
                        false
                    }
                }
            });
        }
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        self.dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    /// 便捷发布 / Convenience publish
    pub fn emit(&self, topic: &str, kind: &str, payload: serde_json::Value) {
        self.publish(BusEvent::new(topic, kind, payload));
    }

    /// 某模式下的订阅者数量 / Subscriber count under a pattern
    pub fn subscriber_count(&self, pattern: &str) -> usize {
        self.subscriptions
            .get(pattern)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }

    /// 投递统计 / Delivery stats
    pub fn stats(&self) -> (u64, u64) {
        (
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
        )
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// 匹配主题模式 / Match topic pattern
///
/// `*` 匹配全部；尾部 `:*` 匹配任意非空后缀
/// `*` matches everything; trailing `:*` matches any non-empty suffix
fn matches_pattern(topic: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern == topic {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix(":*") {
        if let Some(rest) = topic.strip_prefix(prefix) {
            return rest.starts_with(':') && rest.len() > 1;
        }
    }
    false
}

/// 共享总线句柄 / Shared bus handle
pub type SharedBus = Arc<EventBus>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::topics;

    #[test]
    fn test_pattern_matching() {
        assert!(matches_pattern("channel:c1:messages", "*"));
        assert!(matches_pattern("channel:c1:messages", "channel:c1:messages"));
        assert!(matches_pattern("channel:c1:messages", "channel:*"));
        assert!(matches_pattern("channel:c1:messages", "channel:c1:*"));
        assert!(!matches_pattern("workspace:w1", "channel:*"));
        assert!(!matches_pattern("channel:", "channel:*"));
        assert!(!matches_pattern("channelx:c1", "channel:*"));
    }

    #[tokio::test]
    async fn test_publish_fanout_and_dead_subscriber_cleanup() {
        let bus = EventBus::new();
        let mut rx_exact = bus.subscribe("exact", &topics::channel_messages("c1"));
        let mut rx_wild = bus.subscribe("wild", "channel:*");
        let rx_dead = bus.subscribe("dead", "channel:*");
        drop(rx_dead);

        bus.emit(
            &topics::channel_messages("c1"),
            "new_message",
            serde_json::json!({"content": "hello"}),
        );

        let ev = rx_exact.recv().await.expect("exact delivery");
        assert_eq!(ev.kind, "new_message");
        let ev = rx_wild.recv().await.expect("wildcard delivery");
        assert_eq!(ev.payload["content"], "hello");

        // 死订阅者在投递后被剔除 / Dead subscriber purged after delivery
        assert_eq!(bus.subscriber_count("channel:*"), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1", "presence");
        bus.unsubscribe("s1", "presence");
        bus.emit("presence", "presence_diff", serde_json::json!({}));
        assert!(rx.try_recv().is_err());
    }
}
