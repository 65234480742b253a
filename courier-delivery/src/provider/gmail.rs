use std::sync::Arc;

use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use courier_common::{DeliveryEvent, ProviderKind};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::{EmailProvider, SendOutcome, bearer_token};
use crate::{CredentialStore, Credentials};

/// Gmail API (`users.messages.send`) with OAuth bearer tokens.
#[derive(Debug, Clone)]
pub struct GmailProvider {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: Option<String>,
}

impl GmailProvider {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
        }
    }

    async fn deliver(&self, token: &str, event: &DeliveryEvent) -> Result<Option<String>, reqwest::Error> {
        let raw = URL_SAFE_NO_PAD.encode(render_message(event));

        let sent: SentMessage = self
            .client
            .post(format!("{}/gmail/v1/users/me/messages/send", self.base_url))
            .bearer_auth(token)
            .json(&json!({ "raw": raw }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(sent.id)
    }
}

/// UTF-8 bytes per RFC 2047 encoded word, keeping each word under 75 characters.
const ENCODED_WORD_BYTES: usize = 45;

/// The RFC 5322 message Gmail expects, before base64url encoding.
fn render_message(event: &DeliveryEvent) -> String {
    [
        format!("To: {}", event.to_address),
        "Content-Type: text/html; charset=utf-8".to_string(),
        "MIME-Version: 1.0".to_string(),
        format!("Subject: {}", encode_subject(&event.subject)),
        String::new(),
        event.body.clone(),
    ]
    .join("\r\n")
}

/// A subject that stays on its header line: line breaks are dropped, and
/// non-ASCII text becomes folded `=?utf-8?B?...?=` encoded words.
fn encode_subject(subject: &str) -> String {
    let flat: String = subject.chars().filter(|c| !matches!(c, '\r' | '\n')).collect();
    if flat.is_ascii() {
        return flat;
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in flat.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_BYTES {
            words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(&chunk)));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?utf-8?B?{}?=", STANDARD.encode(&chunk)));
    }

    words.join("\r\n ")
}

#[async_trait]
impl EmailProvider for GmailProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gmail
    }

    async fn send(&self, event: &DeliveryEvent) -> SendOutcome {
        let token = match bearer_token(self.credentials.as_ref(), ProviderKind::Gmail, event).await {
            Ok(token) => token,
            Err(outcome) => return outcome,
        };

        match self.deliver(&token, event).await {
            Ok(message_id) => {
                info!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    user_id = %event.user_id,
                    message_id = message_id.as_deref().unwrap_or("-"),
                    "Email sent via Gmail"
                );
                SendOutcome::Sent { message_id }
            }
            Err(e) => {
                error!(
                    event_id = %event.id,
                    tenant_id = %event.tenant_id,
                    user_id = %event.user_id,
                    error = %e,
                    "Failed to send email via Gmail"
                );
                SendOutcome::failed(e)
            }
        }
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> bool {
        let Some(token) = credentials.access_token() else {
            return false;
        };

        let response = self
            .client
            .get(format!("{}/gmail/v1/users/me/profile", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);

        match response {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to validate Gmail credentials");
                false
            }
        }
    }
}
