use crate::{config::Config, models::PushSubscription};
use web_push::{
    ContentEncoding, IsahcWebPushClient, SubscriptionInfo, VapidSignatureBuilder, WebPushClient,
    WebPushError, WebPushMessageBuilder,
};

/// What happened to a single delivery attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The push service no longer knows this subscription.
    Gone,
}

pub struct PushSender {
    client: IsahcWebPushClient,
    private_key_pem: Vec<u8>,
    subject: String,
    public_key: Option<String>,
}

impl PushSender {
    /// Returns `None` when no VAPID key is configured.
    pub fn from_config(config: &Config) -> anyhow::Result<Option<PushSender>> {
        let Some(path) = &config.vapid_private_key_path else {
            return Ok(None);
        };

        Ok(Some(PushSender {
            client: IsahcWebPushClient::new()?,
            private_key_pem: std::fs::read(path)?,
            subject: config.vapid_subject.clone(),
            public_key: config.vapid_public_key.clone(),
        }))
    }

    pub fn public_key(&self) -> Option<&str> {
        self.public_key.as_deref()
    }

    pub async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &[u8],
    ) -> anyhow::Result<Delivery> {
        let info = SubscriptionInfo::new(
            &subscription.endpoint,
            &subscription.p256dh,
            &subscription.auth,
        );

        let mut signature =
            VapidSignatureBuilder::from_pem(self.private_key_pem.as_slice(), &info)?;
        signature.add_claim("sub", self.subject.as_str());

        let mut builder = WebPushMessageBuilder::new(&info);
        builder.set_payload(ContentEncoding::Aes128Gcm, payload);
        builder.set_vapid_signature(signature.build()?);

        match self.client.send(builder.build()?).await {
            Ok(()) => Ok(Delivery::Sent),
            Err(e) if is_gone(&e) => Ok(Delivery::Gone),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_gone(e: &WebPushError) -> bool {
    matches!(
        e,
        WebPushError::EndpointNotValid | WebPushError::EndpointNotFound
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_endpoints_are_gone() {
        assert!(is_gone(&WebPushError::EndpointNotValid));
        assert!(is_gone(&WebPushError::EndpointNotFound));
    }

    #[test]
    fn other_failures_keep_the_subscription() {
        assert!(!is_gone(&WebPushError::Unauthorized));
        assert!(!is_gone(&WebPushError::PayloadTooLarge));
        assert!(!is_gone(&WebPushError::ServerError(None)));
    }
}
