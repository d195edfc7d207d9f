//! 动态实体actor / Dynamic per-entity actors
//!
//! 每个活跃频道/工作区一个actor，按需创建，顺序处理自身消息
//! One actor per active channel/workspace, created on demand, processing its
//! own messages sequentially

pub mod channel;
pub mod workspace;
