//! aws signature version 4 for sns requests

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::credentials::Credentials;

type HmacSha256 = Hmac<Sha256>;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    #[allow(clippy::expect_used)]
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// headers to add to a signed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub amz_date: String,
    pub authorization: String,
    pub security_token: Option<String>,
}

/// A POST request to the root path of `host` with a form encoded body
pub struct FormRequest<'a> {
    pub host: &'a str,
    pub content_type: &'a str,
    pub body: &'a [u8],
}

/// sign `request` for `service` in `region`
pub fn sign(
    request: &FormRequest<'_>,
    credentials: &Credentials,
    service: &str,
    region: &str,
    now: DateTime<Utc>,
) -> SignedHeaders {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();

    let mut headers = vec![
        ("content-type", request.content_type.to_owned()),
        ("host", request.host.to_owned()),
        ("x-amz-date", amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        headers.push(("x-amz-security-token", token.clone()));
    }

    let canonical_headers: String =
        headers.iter().map(|(name, value)| format!("{name}:{}\n", value.trim())).collect();
    let signed_headers = headers.iter().map(|(name, _)| *name).collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "POST\n/\n\n{canonical_headers}\n{signed_headers}\n{}",
        sha256_hex(request.body)
    );

    let scope = format!("{date}/{region}/{service}/aws4_request");
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let key = [date.as_str(), region, service, "aws4_request"].iter().fold(
        format!("AWS4{}", credentials.secret_access_key).into_bytes(),
        |key, part| hmac(&key, part.as_bytes()),
    );
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes()));

    let authorization = format!(
        "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );

    SignedHeaders { amz_date, authorization, security_token: credentials.session_token.clone() }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn credentials(session_token: Option<&str>) -> Credentials {
        Credentials {
            access_key_id: "AKIDEXAMPLE".to_owned(),
            secret_access_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_owned(),
            session_token: session_token.map(str::to_owned),
            expiration: None,
        }
    }

    fn request() -> FormRequest<'static> {
        FormRequest {
            host: "sns.eu-central-1.amazonaws.com",
            content_type: "application/x-www-form-urlencoded; charset=utf-8",
            body: b"Action=Publish&Version=2010-03-31",
        }
    }

    #[test]
    fn builds_authorization_header() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let signed = sign(&request(), &credentials(None), "sns", "eu-central-1", now);

        assert_eq!(signed.amz_date, "20261019T083000Z");
        assert!(signed.authorization.starts_with(
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20261019/eu-central-1/sns/aws4_request, \
            SignedHeaders=content-type;host;x-amz-date, Signature="
        ));

        let signature = signed.authorization.rsplit('=').next().unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_depends_on_body_and_time() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let first = sign(&request(), &credentials(None), "sns", "eu-central-1", now);
        let again = sign(&request(), &credentials(None), "sns", "eu-central-1", now);
        assert_eq!(first, again);

        let other_body = FormRequest { body: b"Action=Publish", ..request() };
        let changed = sign(&other_body, &credentials(None), "sns", "eu-central-1", now);
        assert_ne!(first.authorization, changed.authorization);

        let later = now + chrono::Duration::seconds(1);
        let changed = sign(&request(), &credentials(None), "sns", "eu-central-1", later);
        assert_ne!(first.authorization, changed.authorization);
    }

    #[test]
    fn signs_session_token() {
        let now = Utc.with_ymd_and_hms(2026, 10, 19, 8, 30, 0).unwrap();
        let signed = sign(&request(), &credentials(Some("token")), "sns", "eu-central-1", now);

        assert!(signed
            .authorization
            .contains("SignedHeaders=content-type;host;x-amz-date;x-amz-security-token,"));
        assert_eq!(signed.security_token.as_deref(), Some("token"));
    }
}
