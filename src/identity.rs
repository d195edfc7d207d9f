//! 身份协作方接口 / Identity collaborator interface
//!
//! 查询设备token、邮箱、Webhook地址与成员资格授权
//! Queried for device tokens, email, webhook URL and membership authorization

use anyhow::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn device_tokens(&self, user_id: &str) -> Result<Vec<String>>;
    async fn email_address(&self, user_id: &str) -> Result<Option<String>>;
    async fn webhook_url(&self, user_id: &str) -> Result<Option<String>>;
    /// 成员资格授权检查 / Membership authorization check
    async fn is_member(&self, entity: &str, user_id: &str) -> Result<bool>;
}

/// 静态实现，用于默认接线与测试 / Static implementation for default wiring and tests
#[derive(Default)]
pub struct StaticIdentity {
    pub tokens: DashMap<String, Vec<String>>,
    pub emails: DashMap<String, String>,
    pub webhooks: DashMap<String, String>,
    /// (entity, user) 成员对；open_membership时全部放行
    /// (entity, user) member pairs; open_membership admits everyone
    pub members: DashSet<(String, String)>,
    pub open_membership: bool,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self {
            open_membership: true,
            ..Self::default()
        }
    }

    pub fn closed() -> Self {
        Self::default()
    }

    pub fn grant(&self, entity: &str, user_id: &str) {
        self.members
            .insert((entity.to_string(), user_id.to_string()));
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn device_tokens(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .tokens
            .get(user_id)
            .map(|t| t.clone())
            .unwrap_or_default())
    }

    async fn email_address(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.emails.get(user_id).map(|e| e.clone()))
    }

    async fn webhook_url(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self.webhooks.get(user_id).map(|w| w.clone()))
    }

    async fn is_member(&self, entity: &str, user_id: &str) -> Result<bool> {
        if self.open_membership {
            return Ok(true);
        }
        Ok(self
            .members
            .contains(&(entity.to_string(), user_id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_identity_membership() {
        let identity = StaticIdentity::closed();
        assert!(!identity.is_member("channel:c1", "u1").await.unwrap());
        identity.grant("channel:c1", "u1");
        assert!(identity.is_member("channel:c1", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_membership_admits_everyone() {
        let identity = StaticIdentity::new();
        assert!(identity.is_member("workspace:w1", "anyone").await.unwrap());
    }
}
