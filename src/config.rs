use envconfig::Envconfig;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing or invalid environment variable: {0}")]
    Env(#[from] envconfig::Error),

    #[error("{0} is not valid: {1}")]
    Invalid(&'static str, String),
}

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "DATABASE_URL")]
    pub db_url: String,
    #[envconfig(from = "PORT", default = "8080")]
    pub port: u16,
    #[envconfig(from = "JWT_SECRET")]
    pub jwt_secret: String,
    #[envconfig(from = "FRONTEND_HOST", default = "http://localhost:3000")]
    pub frontend_host: String,

    #[envconfig(from = "GOOGLE_CLIENT_ID")]
    pub google_client_id: String,
    #[envconfig(from = "GOOGLE_CLIENT_SECRET")]
    pub google_client_secret: String,
    #[envconfig(from = "GOOGLE_REDIRECT_URL")]
    pub google_redirect_url: String,
    #[envconfig(from = "ALLOWED_EMAIL_DOMAIN")]
    pub allowed_email_domain: Option<String>,
    #[envconfig(from = "ADMIN_EMAILS", default = "")]
    pub admin_emails: String,

    #[envconfig(from = "SMTP_RELAY", default = "smtp.gmail.com")]
    pub smtp_relay: String,
    #[envconfig(from = "EMAIL_USERNAME")]
    pub email_username: Option<String>,
    #[envconfig(from = "EMAIL_PASSWORD")]
    pub email_password: Option<String>,

    #[envconfig(from = "S3_BUCKET")]
    pub s3_bucket: String,
    #[envconfig(from = "S3_REGION", default = "us-east-1")]
    pub s3_region: String,
    #[envconfig(from = "S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,
    #[envconfig(from = "S3_ACCESS_KEY_ID")]
    pub s3_access_key_id: String,
    #[envconfig(from = "S3_SECRET_ACCESS_KEY")]
    pub s3_secret_access_key: String,
    // 10 MiB
    #[envconfig(from = "UPLOAD_MAX_BYTES", default = "10485760")]
    pub upload_max_bytes: usize,

    #[envconfig(from = "VAPID_PRIVATE_KEY_PATH")]
    pub vapid_private_key_path: Option<String>,
    #[envconfig(from = "VAPID_PUBLIC_KEY")]
    pub vapid_public_key: Option<String>,
    #[envconfig(from = "VAPID_SUBJECT", default = "mailto:admin@example.edu")]
    pub vapid_subject: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let config = Self::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.frontend_host)
            .map_err(|e| ConfigError::Invalid("FRONTEND_HOST", e.to_string()))?;
        url::Url::parse(&self.google_redirect_url)
            .map_err(|e| ConfigError::Invalid("GOOGLE_REDIRECT_URL", e.to_string()))?;
        if self.upload_max_bytes == 0 {
            return Err(ConfigError::Invalid(
                "UPLOAD_MAX_BYTES",
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Lowercased admin emails from the comma separated `ADMIN_EMAILS`.
    pub fn admin_emails(&self) -> Vec<String> {
        self.admin_emails
            .split(',')
            .map(|e| e.trim().to_lowercase())
            .filter(|e| !e.is_empty())
            .collect()
    }

    pub fn frontend_link(&self, path: &str) -> String {
        format!("{}{}", self.frontend_host.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn required() -> HashMap<String, String> {
        [
            ("DATABASE_URL", "postgres://localhost/clubs"),
            ("JWT_SECRET", "c2VjcmV0"),
            ("GOOGLE_CLIENT_ID", "id"),
            ("GOOGLE_CLIENT_SECRET", "secret"),
            ("GOOGLE_REDIRECT_URL", "http://localhost:3000/auth/callback"),
            ("S3_BUCKET", "uploads"),
            ("S3_ACCESS_KEY_ID", "key"),
            ("S3_SECRET_ACCESS_KEY", "secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::init_from_hashmap(&required()).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.smtp_relay, "smtp.gmail.com");
        assert_eq!(config.upload_max_bytes, 10 * 1024 * 1024);
        assert!(config.email_username.is_none());
        assert!(config.allowed_email_domain.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn missing_required_key_fails() {
        let mut env = required();
        env.remove("JWT_SECRET");
        assert!(Config::init_from_hashmap(&env).is_err());
    }

    #[test]
    fn admin_emails_are_normalized() {
        let mut env = required();
        env.insert(
            "ADMIN_EMAILS".to_string(),
            " Dean@Uni.edu, ,ops@uni.edu ".to_string(),
        );
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.admin_emails(), vec!["dean@uni.edu", "ops@uni.edu"]);
    }

    #[test]
    fn invalid_frontend_host_is_rejected() {
        let mut env = required();
        env.insert("FRONTEND_HOST".to_string(), "not a url".to_string());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid("FRONTEND_HOST", _))
        ));
    }

    #[test]
    fn frontend_link_joins_paths() {
        let mut env = required();
        env.insert("FRONTEND_HOST".to_string(), "https://clubs.uni.edu/".to_string());
        let config = Config::init_from_hashmap(&env).unwrap();
        assert_eq!(config.frontend_link("/clubs/3"), "https://clubs.uni.edu/clubs/3");
    }
}
