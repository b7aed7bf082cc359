use crate::config::Config;
use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use url::Url;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

// 10 minutes
const LOGIN_ALLOWED_TIME: Duration = Duration::from_secs(60 * 10);

pub type GoogleClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// OpenID Connect user-info document.
#[derive(Debug, Clone, Deserialize)]
pub struct GoogleUser {
    pub sub: String,
    pub email: String,
    #[serde(default)]
    pub email_verified: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
}

impl GoogleUser {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| self.email.split('@').next().unwrap_or_default().to_string())
    }
}

/// CSRF states handed out by `login_url` and not yet redeemed.
#[derive(Default)]
pub struct PendingLogins(Mutex<HashMap<String, Instant>>);

impl PendingLogins {
    pub async fn insert(&self, state: String) {
        let mut pending = self.0.lock().await;
        pending.retain(|_, issued| issued.elapsed() <= LOGIN_ALLOWED_TIME);
        pending.insert(state, Instant::now());
    }

    /// Consumes a state; it is valid only once and only while fresh.
    pub async fn redeem(&self, state: &str) -> bool {
        self.0
            .lock()
            .await
            .remove(state)
            .map_or(false, |issued| issued.elapsed() <= LOGIN_ALLOWED_TIME)
    }
}

pub struct GoogleAuth {
    client: GoogleClient,
    http: reqwest::Client,
    allowed_domain: Option<String>,
    pub pending: PendingLogins,
}

impl GoogleAuth {
    pub fn from_config(config: &Config) -> anyhow::Result<GoogleAuth> {
        let client = BasicClient::new(ClientId::new(config.google_client_id.clone()))
            .set_client_secret(ClientSecret::new(config.google_client_secret.clone()))
            .set_auth_uri(AuthUrl::new(GOOGLE_AUTH_URL.to_string())?)
            .set_token_uri(TokenUrl::new(GOOGLE_TOKEN_URL.to_string())?)
            .set_redirect_uri(RedirectUrl::new(config.google_redirect_url.clone())?);

        // no redirects, the token endpoint must answer directly
        let http = reqwest::ClientBuilder::new()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(GoogleAuth {
            client,
            http,
            allowed_domain: config
                .allowed_email_domain
                .as_ref()
                .map(|d| d.trim().trim_start_matches('@').to_lowercase()),
            pending: PendingLogins::default(),
        })
    }

    pub async fn login_url(&self) -> Url {
        let (url, state) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new("openid".to_string()))
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .url();

        self.pending.insert(state.secret().clone()).await;
        url
    }

    pub async fn exchange(&self, code: String) -> anyhow::Result<GoogleUser> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(&self.http)
            .await
            .map_err(|e| anyhow::anyhow!("google token exchange failed: {e}"))?;

        Ok(self
            .http
            .get(GOOGLE_USERINFO_URL)
            .bearer_auth(token.access_token().secret())
            .send()
            .await?
            .error_for_status()?
            .json::<GoogleUser>()
            .await?)
    }

    /// Whether this Google account may sign in at all.
    pub fn accepts(&self, user: &GoogleUser) -> bool {
        email_allowed(user, self.allowed_domain.as_deref())
    }
}

fn email_allowed(user: &GoogleUser, allowed_domain: Option<&str>) -> bool {
    if !user.email_verified {
        return false;
    }
    match allowed_domain {
        None => true,
        Some(domain) => user
            .email
            .rsplit_once('@')
            .map_or(false, |(_, d)| d.eq_ignore_ascii_case(domain)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn google_user(email: &str, verified: bool) -> GoogleUser {
        GoogleUser {
            sub: "123".to_string(),
            email: email.to_string(),
            email_verified: verified,
            name: None,
            picture: None,
        }
    }

    #[test]
    fn domain_restriction() {
        assert!(email_allowed(&google_user("ada@uni.edu", true), Some("uni.edu")));
        assert!(email_allowed(&google_user("ada@UNI.EDU", true), Some("uni.edu")));
        assert!(!email_allowed(&google_user("ada@gmail.com", true), Some("uni.edu")));
        assert!(email_allowed(&google_user("ada@gmail.com", true), None));
    }

    #[test]
    fn unverified_emails_are_refused() {
        assert!(!email_allowed(&google_user("ada@uni.edu", false), None));
    }

    #[test]
    fn display_name_falls_back_to_mailbox() {
        assert_eq!(google_user("grace@uni.edu", true).display_name(), "grace");
        let mut named = google_user("grace@uni.edu", true);
        named.name = Some("Grace Hopper".to_string());
        assert_eq!(named.display_name(), "Grace Hopper");
    }

    #[tokio::test]
    async fn login_states_redeem_once() {
        let pending = PendingLogins::default();
        pending.insert("abc".to_string()).await;
        assert!(pending.redeem("abc").await);
        assert!(!pending.redeem("abc").await);
        assert!(!pending.redeem("never-issued").await);
    }
}
