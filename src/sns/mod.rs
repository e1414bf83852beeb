//! publishing messages to sns topics
//!
//! [SnsClient] speaks the sns query api directly: a form encoded `Publish`
//! action signed with aws signature version 4. Failures reported by sns keep
//! their error code so the webhook receiver can map them to a status code.
//! Responses are xml documents decoded with `quick_xml`.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use http::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use self::{
    credentials::CredentialsProvider,
    signing::{sign, FormRequest},
};
use crate::arn;

pub mod credentials;
pub mod signing;

const API_VERSION: &str = "2010-03-31";
const CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";
/// region used for signing when the topic arn has none
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SnsSettings {
    /// subject line of published messages
    pub subject: Option<String>,
    /// overrides the endpoint derived from the topic region
    pub endpoint: Option<Url>,
}

#[derive(Error, Debug)]
pub enum PublishError {
    /// sns rejected the request with an error code
    #[error("sns error {code}: {message}")]
    Provider { code: String, message: String },
    #[error("sns request failed")]
    Transport(#[from] reqwest::Error),
    #[error("no aws credentials available: {0}")]
    MissingCredentials(String),
    #[error("unexpected sns response with status {status}: {body}")]
    UnexpectedResponse { status: StatusCode, body: String },
    #[error("invalid sns endpoint")]
    Endpoint(#[from] url::ParseError),
}

impl PublishError {
    /// error code reported by sns, if it's one we know
    pub fn provider_code(&self) -> Option<ProviderErrorCode> {
        match self {
            Self::Provider { code, .. } => code.parse().ok(),
            _ => None,
        }
    }
}

/// Error codes of the sns `Publish` action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorCode {
    InvalidParameter,
    InvalidParameterValue,
    InternalError,
    EndpointDisabled,
    AuthorizationError,
    KmsDisabled,
    KmsInvalidState,
    KmsNotFound,
    KmsOptInRequired,
    KmsThrottling,
    KmsAccessDenied,
    InvalidSecurity,
}

impl FromStr for ProviderErrorCode {
    type Err = ();

    /// accepts the wire codes as well as their `...Exception` names
    fn from_str(code: &str) -> Result<Self, Self::Err> {
        let code = code.strip_suffix("Exception").unwrap_or(code);

        Ok(match code {
            "InvalidParameter" => Self::InvalidParameter,
            "InvalidParameterValue" => Self::InvalidParameterValue,
            "InternalError" => Self::InternalError,
            "EndpointDisabled" => Self::EndpointDisabled,
            "AuthorizationError" => Self::AuthorizationError,
            "KMSDisabled" => Self::KmsDisabled,
            "KMSInvalidState" => Self::KmsInvalidState,
            "KMSNotFound" => Self::KmsNotFound,
            "KMSOptInRequired" => Self::KmsOptInRequired,
            "KMSThrottling" => Self::KmsThrottling,
            "KMSAccessDenied" => Self::KmsAccessDenied,
            "InvalidSecurity" => Self::InvalidSecurity,
            _ => return Err(()),
        })
    }
}

/// Something we can publish rendered alerts to
#[async_trait]
pub trait Publisher: Send + Sync {
    /// publish `message` to the topic `topic_arn`, returns the message id
    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        subject: Option<&str>,
    ) -> Result<String, PublishError>;
}

pub struct SnsClient {
    client: reqwest::Client,
    endpoint: Option<Url>,
    credentials: CredentialsProvider,
}

impl SnsClient {
    pub fn new(endpoint: Option<Url>, credentials: CredentialsProvider) -> Self {
        Self { client: reqwest::Client::new(), endpoint, credentials }
    }

    /// endpoint and signing region for `topic_arn`
    fn endpoint_for(&self, topic_arn: &str) -> Result<(Url, String), PublishError> {
        let region = Some(arn::region_of(topic_arn))
            .filter(|region| !region.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_owned());

        let endpoint = match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => Url::parse(&format!(
                "https://{}.{region}.{}/",
                arn::SNS_SERVICE,
                arn::dns_suffix_for_region(&region)
            ))?,
        };

        Ok((endpoint, region))
    }
}

fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();

    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

/// body of a successful `Publish`
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublishResponse {
    publish_result: PublishResult,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PublishResult {
    message_id: String,
}

/// body of a request rejected by sns
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ErrorDetail {
    code: String,
    #[serde(default)]
    message: String,
}

#[async_trait]
impl Publisher for SnsClient {
    async fn publish(
        &self,
        topic_arn: &str,
        message: &str,
        subject: Option<&str>,
    ) -> Result<String, PublishError> {
        let (endpoint, region) = self.endpoint_for(topic_arn)?;

        // the serializer isn't Send, it must not live across an await
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("Action", "Publish")
                .append_pair("Version", API_VERSION)
                .append_pair("TopicArn", topic_arn)
                .append_pair("Message", message);
            if let Some(subject) = subject {
                form.append_pair("Subject", subject);
            }
            form.finish()
        };

        let credentials = self.credentials.credentials().await?;
        let host = host_header(&endpoint);
        let signed = sign(
            &FormRequest { host: &host, content_type: CONTENT_TYPE, body: body.as_bytes() },
            &credentials,
            arn::SNS_SERVICE,
            &region,
            Utc::now(),
        );

        let mut request = self
            .client
            .post(endpoint)
            .header(http::header::CONTENT_TYPE, CONTENT_TYPE)
            .header("x-amz-date", signed.amz_date)
            .header(http::header::AUTHORIZATION, signed.authorization);
        if let Some(token) = signed.security_token {
            request = request.header("x-amz-security-token", token);
        }

        let response = request.body(body).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            return match quick_xml::de::from_str::<PublishResponse>(&body) {
                Ok(response) => Ok(response.publish_result.message_id),
                Err(err) => {
                    tracing::warn!(%topic_arn, "published, but can't read the message id: {err}");
                    Ok(String::new())
                }
            };
        }

        match quick_xml::de::from_str::<ErrorResponse>(&body) {
            Ok(ErrorResponse { error: ErrorDetail { code, message } }) => {
                Err(PublishError::Provider { code, message })
            }
            Err(_) => Err(PublishError::UnexpectedResponse { status, body }),
        }
    }
}
