//! 投递策略 / Delivery strategies
//!
//! 每种通知类型一种策略：push / email / in-app / webhook。
//! 真正的推送与邮件通道由外部传输方承接，这里只做查询与交接；
//! webhook由本进程直接POST并携带HMAC签名。
//! One strategy per notification kind: push / email / in-app / webhook.
//! Real push and email channels live in external transports, here we only
//! resolve targets and hand off; webhooks are POSTed directly with an HMAC
//! signature.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::bus::SharedBus;
use crate::domain::event::{kinds, topics};
use crate::domain::message::{Notification, NotificationKind};
use crate::identity::IdentityProvider;

#[async_trait]
pub trait DeliveryStrategy: Send + Sync {
    fn kind(&self) -> NotificationKind;
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// 推送投递 / Push delivery
pub struct PushDelivery {
    identity: Arc<dyn IdentityProvider>,
}

impl PushDelivery {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl DeliveryStrategy for PushDelivery {
    fn kind(&self) -> NotificationKind {
        NotificationKind::Push
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let tokens = self.identity.device_tokens(&notification.recipient_id).await?;
        if tokens.is_empty() {
            debug!(
                "No device tokens for {}, push skipped",
                notification.recipient_id
            );
            return Ok(());
        }
        info!(
            "📲 Push {} handed off to {} devices of {}",
            notification.id,
            tokens.len(),
            notification.recipient_id
        );
        Ok(())
    }
}

/// 邮件投递 / Email delivery
pub struct EmailDelivery {
    identity: Arc<dyn IdentityProvider>,
}

impl EmailDelivery {
    pub fn new(identity: Arc<dyn IdentityProvider>) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl DeliveryStrategy for EmailDelivery {
    fn kind(&self) -> NotificationKind {
        NotificationKind::Email
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let Some(address) = self
            .identity
            .email_address(&notification.recipient_id)
            .await?
        else {
            anyhow::bail!("no email address for {}", notification.recipient_id);
        };
        info!("📧 Email {} handed off for {}", notification.id, address);
        Ok(())
    }
}

/// 应用内投递：发布到用户通知主题 / In-app delivery: published on the user's notification topic
pub struct InAppDelivery {
    bus: SharedBus,
}

impl InAppDelivery {
    pub fn new(bus: SharedBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl DeliveryStrategy for InAppDelivery {
    fn kind(&self) -> NotificationKind {
        NotificationKind::InApp
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.bus.emit(
            &topics::user_notifications(&notification.recipient_id),
            kinds::NOTIFICATION,
            serde_json::json!({
                "id": notification.id,
                "payload": notification.payload,
                "created_at": notification.created_at,
            }),
        );
        Ok(())
    }
}

/// Webhook投递 / Webhook delivery
pub struct WebhookDelivery {
    identity: Arc<dyn IdentityProvider>,
    client: reqwest::Client,
    secret: Option<String>,
}

impl WebhookDelivery {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        timeout_ms: u64,
        secret: Option<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            identity,
            client,
            secret,
        })
    }
}

#[async_trait]
impl DeliveryStrategy for WebhookDelivery {
    fn kind(&self) -> NotificationKind {
        NotificationKind::Webhook
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        let Some(url) = self.identity.webhook_url(&notification.recipient_id).await? else {
            anyhow::bail!("no webhook url for {}", notification.recipient_id);
        };
        let mut request = self.client.post(&url).json(&notification.payload);
        if let Some(secret) = &self.secret {
            request = request.header(
                "X-VChat-Signature",
                generate_webhook_signature(notification, secret),
            );
        }
        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook request failed: {}", e))?;
        if response.status().is_success() {
            info!("✅ Webhook {} delivered to {}", notification.id, url);
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(anyhow::anyhow!(
                "Webhook delivery failed with status {}: {}",
                status,
                body
            ))
        }
    }
}

/// 生成Webhook签名 / Generate webhook signature
pub fn generate_webhook_signature(notification: &Notification, secret: &str) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;
    let payload = serde_json::json!({
        "id": notification.id,
        "kind": notification.kind,
        "created_at": notification.created_at,
    })
    .to_string();
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(payload.as_bytes());
    let result = mac.finalize();
    format!("sha256={}", hex::encode(result.into_bytes()))
}

/// 默认策略集 / Default strategy set
pub fn default_strategies(
    bus: SharedBus,
    identity: Arc<dyn IdentityProvider>,
    webhook_timeout_ms: u64,
    webhook_secret: Option<String>,
) -> Result<HashMap<NotificationKind, Arc<dyn DeliveryStrategy>>> {
    let mut strategies: HashMap<NotificationKind, Arc<dyn DeliveryStrategy>> = HashMap::new();
    strategies.insert(
        NotificationKind::Push,
        Arc::new(PushDelivery::new(identity.clone())),
    );
    strategies.insert(
        NotificationKind::Email,
        Arc::new(EmailDelivery::new(identity.clone())),
    );
    strategies.insert(NotificationKind::InApp, Arc::new(InAppDelivery::new(bus)));
    strategies.insert(
        NotificationKind::Webhook,
        Arc::new(WebhookDelivery::new(
            identity,
            webhook_timeout_ms,
            webhook_secret,
        )?),
    );
    Ok(strategies)
}
