use std::sync::Arc;

use async_trait::async_trait;
use courier_common::{DeliveryEvent, ProviderKind};
use serde_json::{Value, json};
use tracing::{error, info};

use super::{EmailProvider, SendOutcome, bearer_token};
use crate::{CredentialStore, Credentials};

/// Microsoft Graph `/me/sendMail`.
///
/// Graph answers `202 Accepted` with no body, so no message id is reported.
#[derive(Debug, Clone)]
pub struct OutlookProvider {
    client: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
}

impl OutlookProvider {
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

    async fn deliver(&self, token: &str, event: &DeliveryEvent) -> Result<(), reqwest::Error> {
        self.client
            .post(format!("{}/me/sendMail", self.base_url))
            .bearer_auth(token)
            .json(&message(event))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn message(event: &DeliveryEvent) -> Value {
    json!({
        "message": {
            "subject": event.subject,
            "body": {
                "contentType": "HTML",
                "content": event.body,
            },
            "toRecipients": [
                { "emailAddress": { "address": event.to_address } }
            ],
        }
    })
}

#[async_trait]
impl EmailProvider for OutlookProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Outlook
    }

    async fn send(&self, event: &DeliveryEvent) -> SendOutcome {
        let token =
            match bearer_token(self.credentials.as_ref(), ProviderKind::Outlook, event).await {
                Ok(token) => token,
                Err(outcome) => return outcome,
            };

        if let Err(e) = self.deliver(&token, event).await {
            error!(
                event_id = %event.id,
                tenant_id = %event.tenant_id,
                user_id = %event.user_id,
                error = %e,
                "Failed to send email via Outlook"
            );
            return SendOutcome::failed(e);
        }

        info!(
            event_id = %event.id,
            tenant_id = %event.tenant_id,
            user_id = %event.user_id,
            "Email sent via Outlook"
        );
        SendOutcome::Sent { message_id: None }
    }

    async fn validate_credentials(&self, credentials: &Credentials) -> bool {
        let Some(token) = credentials.access_token() else {
            return false;
        };

        match self
            .client
            .get(format!("{}/me", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
        {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to validate Outlook credentials");
                false
            }
        }
    }
}
