//! client for the ec2 instance metadata service
//!
//! Used to detect the sns topic prefix at startup and to fetch the
//! credentials of the instance role for signing sns requests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use thiserror::Error;
use url::Url;

const TOKEN_PATH: &str = "latest/api/token";
const TOKEN_TTL_HEADER: &str = "x-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_HEADER: &str = "x-aws-ec2-metadata-token";
const TOKEN_TTL_SECONDS: &str = "21600";

const INSTANCE_ID_PATH: &str = "latest/meta-data/instance-id";
const IAM_INFO_PATH: &str = "latest/meta-data/iam/info";
const IDENTITY_DOCUMENT_PATH: &str = "latest/dynamic/instance-identity/document";
const SECURITY_CREDENTIALS_PATH: &str = "latest/meta-data/iam/security-credentials/";

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct MetadataSettings {
    pub endpoint: Url,
    #[serde_as(as = "DurationSeconds<f64>")]
    pub timeout: Duration,
}

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata request failed")]
    Request(#[from] reqwest::Error),
    #[error("metadata service responded with status {0}")]
    Status(StatusCode),
    #[error("failed to decode metadata response")]
    Decode(#[from] serde_json::Error),
    #[error("metadata service reported {0:?}")]
    NotSuccessful(String),
    #[error("invalid metadata url")]
    Url(#[from] url::ParseError),
    #[error("no role attached to instance")]
    NoRole,
}

/// `iam/info` document
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IamInfo {
    pub code: String,
    pub instance_profile_arn: String,
    #[serde(default)]
    pub instance_profile_id: String,
}

#[derive(Debug, Deserialize)]
struct IdentityDocument {
    #[serde(default)]
    region: String,
}

/// temporary credentials of the instance role
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RoleCredentials {
    pub code: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub token: String,
    pub expiration: DateTime<Utc>,
}

/// The queries needed from an instance identity service
#[async_trait]
pub trait InstanceMetadata: Send + Sync {
    /// whether the service is reachable at all
    async fn available(&self) -> bool;

    async fn iam_info(&self) -> Result<IamInfo, MetadataError>;

    /// region the instance runs in
    async fn region(&self) -> Result<String, MetadataError>;
}

#[derive(Debug, Clone)]
pub struct MetadataClient {
    client: reqwest::Client,
    endpoint: Url,
}

impl MetadataClient {
    pub fn new(settings: &MetadataSettings) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder().timeout(settings.timeout).build()?;

        Ok(Self { client, endpoint: settings.endpoint.clone() })
    }

    /// IMDSv2 session token. `None` means we fall back to IMDSv1 requests.
    async fn token(&self) -> Option<String> {
        let url = self.endpoint.join(TOKEN_PATH).ok()?;

        let response = self
            .client
            .put(url)
            .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECONDS)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        response.text().await.ok().filter(|token| !token.is_empty())
    }

    async fn get(&self, path: &str) -> Result<String, MetadataError> {
        let url = self.endpoint.join(path)?;

        let mut request = self.client.get(url);
        if let Some(token) = self.token().await {
            request = request.header(TOKEN_HEADER, token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetadataError::Status(status));
        }

        Ok(response.text().await?)
    }

    /// credentials of the role attached to the instance
    pub async fn role_credentials(&self) -> Result<RoleCredentials, MetadataError> {
        let roles = self.get(SECURITY_CREDENTIALS_PATH).await?;
        let role = roles.lines().next().map(str::trim).filter(|role| !role.is_empty());
        let role = role.ok_or(MetadataError::NoRole)?;

        let body = self.get(&format!("{SECURITY_CREDENTIALS_PATH}{role}")).await?;
        let credentials: RoleCredentials = serde_json::from_str(&body)?;

        if credentials.code != "Success" {
            return Err(MetadataError::NotSuccessful(credentials.code));
        }

        Ok(credentials)
    }
}

#[async_trait]
impl InstanceMetadata for MetadataClient {
    async fn available(&self) -> bool {
        match self.get(INSTANCE_ID_PATH).await {
            Ok(_) => true,
            Err(err) => {
                tracing::debug!("metadata api not available: {err}");
                false
            }
        }
    }

    async fn iam_info(&self) -> Result<IamInfo, MetadataError> {
        let body = self.get(IAM_INFO_PATH).await?;
        let info: IamInfo = serde_json::from_str(&body)?;

        if info.code != "Success" {
            return Err(MetadataError::NotSuccessful(info.code));
        }

        Ok(info)
    }

    async fn region(&self) -> Result<String, MetadataError> {
        let body = self.get(IDENTITY_DOCUMENT_PATH).await?;
        let document: IdentityDocument = serde_json::from_str(&body)?;

        Ok(document.region)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::arn::{detect_prefix, ResolveError};

    fn iam_info() -> serde_json::Value {
        json!({
            "Code": "Success",
            "LastUpdated": "2026-10-19T08:00:00Z",
            "InstanceProfileArn": "arn:aws:iam::123456789012:instance-profile/profile",
            "InstanceProfileId": "123456789012",
        })
    }

    /// metadata service answering every request with `status` and `body`
    async fn mock_metadata(status: u16, body: Option<String>) -> (MockServer, MetadataClient) {
        let server = MockServer::start().await;

        let mut response = ResponseTemplate::new(status);
        if let Some(body) = body {
            response = response.set_body_string(body);
        }
        Mock::given(wiremock::matchers::any()).respond_with(response).mount(&server).await;

        let client = client_for(&server);
        (server, client)
    }

    fn client_for(server: &MockServer) -> MetadataClient {
        MetadataClient::new(&MetadataSettings {
            endpoint: Url::parse(&server.uri()).unwrap(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[tokio::test]
    async fn unavailable_service_fails_detection() {
        let (_server, client) = mock_metadata(400, None).await;

        assert!(!client.available().await);
        let err = detect_prefix(&client, no_env).await.unwrap_err();
        assert!(matches!(err, ResolveError::MetadataUnavailable));
    }

    #[tokio::test]
    async fn empty_responses_fail_detection() {
        let (_server, client) = mock_metadata(200, None).await;

        assert!(client.available().await);
        let err = detect_prefix(&client, no_env).await.unwrap_err();
        assert!(matches!(err, ResolveError::MetadataQueryFailed(_)));
    }

    #[tokio::test]
    async fn missing_region_fails_detection() {
        // every path returns the iam document, so the identity document has no region
        let (_server, client) = mock_metadata(200, Some(iam_info().to_string())).await;

        let err = detect_prefix(&client, no_env).await.unwrap_err();
        assert!(matches!(err, ResolveError::PrefixUndetectable));
    }

    #[tokio::test]
    async fn environment_region_completes_detection() {
        let (_server, client) = mock_metadata(200, Some(iam_info().to_string())).await;

        let prefix = detect_prefix(&client, |var| {
            (var == "AWS_DEFAULT_REGION").then(|| "eu-central-1".to_owned())
        })
        .await
        .unwrap();

        assert_eq!(prefix, "arn:aws:sns:eu-central-1:123456789012:");
        assert!(crate::arn::validate(&prefix));
    }

    #[tokio::test]
    async fn uses_session_token_and_identity_document() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/latest/api/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("session-token"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data/instance-id"))
            .and(wiremock::matchers::header(TOKEN_HEADER, "session-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("i-0123456789"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data/iam/info"))
            .respond_with(ResponseTemplate::new(200).set_body_json(iam_info()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/dynamic/instance-identity/document"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "region": "us-east-2" })),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let prefix = detect_prefix(&client, no_env).await.unwrap();

        assert_eq!(prefix, "arn:aws:sns:us-east-2:123456789012:");
    }

    #[tokio::test]
    async fn fetches_role_credentials() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/latest/meta-data/iam/security-credentials/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("forwarder-role\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/latest/meta-data/iam/security-credentials/forwarder-role"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Code": "Success",
                "LastUpdated": "2026-10-19T08:00:00Z",
                "Type": "AWS-HMAC",
                "AccessKeyId": "ASIAEXAMPLE",
                "SecretAccessKey": "secret",
                "Token": "token",
                "Expiration": "2026-10-19T14:00:00Z",
            })))
            .mount(&server)
            .await;

        let credentials = client_for(&server).role_credentials().await.unwrap();

        assert_eq!(credentials.access_key_id, "ASIAEXAMPLE");
        assert_eq!(credentials.token, "token");
    }
}
