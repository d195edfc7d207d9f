//! v-chat-core
//!
//! 多租户聊天平台的实时协调核心：每实体actor加单例服务，
//! 覆盖在线状态、消息缓冲与广播、输入指示、通知队列与上传任务调度。
//! Real-time coordination core of a multi-tenant chat platform: per-entity
//! actors plus singleton services covering presence, message buffering and
//! broadcast, typing indicators, the notification queue and upload job
//! scheduling.
//!
//! 并发模型：每个actor一个tokio任务，顺序消费自身信箱；跨actor一致性
//! 只依赖消息传递与事件总线，不共享可变内存。
//! Concurrency model: one tokio task per actor draining its own mailbox
//! sequentially; cross-actor consistency relies only on message passing and
//! the event bus, never shared mutable memory.

pub mod actors;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod identity;
pub mod notify;
pub mod registry;
pub mod service;
pub mod storage;
pub mod supervisor;
pub mod upload;

pub use bus::{EventBus, SharedBus};
pub use config::CoreConfig;
pub use coordinator::Coordinator;
pub use error::{CoreError, CoreResult};
pub use supervisor::{Collaborators, CoreSupervisor, HealthReport};
