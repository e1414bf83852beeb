//! credentials for signing sns requests

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use super::PublishError;
use crate::instance_metadata::MetadataClient;

/// renew instance role credentials this long before they expire
const EXPIRY_MARGIN_SECONDS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
}

impl Credentials {
    /// `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok().filter(|v| !v.is_empty())?;
        let secret_access_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").ok().filter(|v| !v.is_empty())?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").ok().filter(|v| !v.is_empty());

        Some(Self { access_key_id, secret_access_key, session_token, expiration: None })
    }

    fn expires_soon(&self, now: DateTime<Utc>) -> bool {
        self.expiration
            .map_or(false, |expiration| expiration - Duration::seconds(EXPIRY_MARGIN_SECONDS) <= now)
    }
}

/// Where the credentials come from
pub enum CredentialsProvider {
    Static(Credentials),
    /// role of the ec2 instance, cached until shortly before expiry
    InstanceRole { metadata: MetadataClient, cached: Mutex<Option<Credentials>> },
}

impl CredentialsProvider {
    /// environment credentials if set, instance role credentials otherwise
    pub fn from_env_or_instance(metadata: MetadataClient) -> Self {
        match Credentials::from_env() {
            Some(credentials) => {
                tracing::info!("using aws credentials from environment");
                Self::Static(credentials)
            }
            None => {
                tracing::info!("using aws credentials of the instance role");
                Self::InstanceRole { metadata, cached: Mutex::new(None) }
            }
        }
    }

    pub async fn credentials(&self) -> Result<Credentials, PublishError> {
        match self {
            Self::Static(credentials) => Ok(credentials.clone()),
            Self::InstanceRole { metadata, cached } => {
                let mut cached = cached.lock().await;

                if let Some(credentials) = cached.as_ref() {
                    if !credentials.expires_soon(Utc::now()) {
                        return Ok(credentials.clone());
                    }
                }

                let role = metadata
                    .role_credentials()
                    .await
                    .map_err(|err| PublishError::MissingCredentials(err.to_string()))?;

                let credentials = Credentials {
                    access_key_id: role.access_key_id,
                    secret_access_key: role.secret_access_key,
                    session_token: Some(role.token),
                    expiration: Some(role.expiration),
                };
                *cached = Some(credentials.clone());

                Ok(credentials)
            }
        }
    }
}
