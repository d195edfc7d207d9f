//! 单例服务 / Singleton services

pub mod buffer;
pub mod presence;
