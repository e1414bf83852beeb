//! aws resource names: parsing, validation and detection of the sns topic prefix
//!
//! The topic prefix is everything of a topic arn except the topic name, e.g.
//! `arn:aws:sns:eu-central-1:123456789012:`. It's either configured or
//! derived from the role of the ec2 instance we're running on.

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::instance_metadata::InstanceMetadata;

/// service name used in sns arns
pub const SNS_SERVICE: &str = "sns";

/// environment variables consulted for the region, in this order
pub const REGION_ENV_VARS: [&str; 2] = ["AWS_REGION", "AWS_DEFAULT_REGION"];

const ARN_PREFIX: &str = "arn";
const ARN_SECTIONS: usize = 6;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArnError {
    #[error("arn invalid: prefix is not \"arn:\"")]
    InvalidPrefix,
    #[error("arn invalid: not enough sections")]
    InvalidSections,
}

/// Errors of the topic prefix autodetection
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("aws metadata api not available")]
    MetadataUnavailable,
    #[error("error accessing iam info: {0}")]
    MetadataQueryFailed(String),
    #[error("instance profile arn {arn:?} is invalid")]
    InvalidInstanceArn {
        arn: String,
        #[source]
        source: ArnError,
    },
    #[error("the arn prefix was not supplied and could not be detected")]
    PrefixUndetectable,
}

/// Structured aws resource name
///
/// `arn:partition:service:region:account-id:resource`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceName {
    pub partition: String,
    pub service: String,
    /// empty for region-less resources like iam roles
    pub region: String,
    pub account_id: String,
    /// may itself contain `:`
    pub resource: String,
}

impl FromStr for ResourceName {
    type Err = ArnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with("arn:") {
            return Err(ArnError::InvalidPrefix);
        }

        let sections: Vec<&str> = s.splitn(ARN_SECTIONS, ':').collect();
        if sections.len() != ARN_SECTIONS {
            return Err(ArnError::InvalidSections);
        }

        Ok(Self {
            partition: sections[1].to_owned(),
            service: sections[2].to_owned(),
            region: sections[3].to_owned(),
            account_id: sections[4].to_owned(),
            resource: sections[5].to_owned(),
        })
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{ARN_PREFIX}:{}:{}:{}:{}:{}",
            self.partition, self.service, self.region, self.account_id, self.resource
        )
    }
}

/// check if `arn` parses into a [ResourceName]
pub fn validate(arn: &str) -> bool {
    match arn.parse::<ResourceName>() {
        Ok(_) => true,
        Err(err) => {
            tracing::warn!(%arn, "the arn does not parse successfully: {err}");
            false
        }
    }
}

/// region of `arn`, empty if the arn has none or doesn't parse
pub fn region_of(arn: &str) -> String {
    match arn.parse::<ResourceName>() {
        Ok(arn) => arn.region,
        Err(err) => {
            tracing::warn!(%arn, "the arn does not parse successfully: {err}");
            String::new()
        }
    }
}

/// an aws partition with the regions it's known to contain
struct Partition {
    id: &'static str,
    dns_suffix: &'static str,
    region_regex: Lazy<Regex>,
    regions: &'static [&'static str],
}

#[allow(clippy::expect_used)]
static PARTITIONS: [Partition; 5] = [
    Partition {
        id: "aws",
        dns_suffix: "amazonaws.com",
        region_regex: Lazy::new(|| {
            Regex::new(r"^(us|eu|ap|sa|ca|me|af|il|mx)\-\w+\-\d+$").expect("valid regex")
        }),
        regions: &[
            "af-south-1",
            "ap-east-1",
            "ap-northeast-1",
            "ap-northeast-2",
            "ap-northeast-3",
            "ap-south-1",
            "ap-south-2",
            "ap-southeast-1",
            "ap-southeast-2",
            "ap-southeast-3",
            "ap-southeast-4",
            "ca-central-1",
            "ca-west-1",
            "eu-central-1",
            "eu-central-2",
            "eu-north-1",
            "eu-south-1",
            "eu-south-2",
            "eu-west-1",
            "eu-west-2",
            "eu-west-3",
            "il-central-1",
            "me-central-1",
            "me-south-1",
            "sa-east-1",
            "us-east-1",
            "us-east-2",
            "us-west-1",
            "us-west-2",
        ],
    },
    Partition {
        id: "aws-cn",
        dns_suffix: "amazonaws.com.cn",
        region_regex: Lazy::new(|| Regex::new(r"^cn\-\w+\-\d+$").expect("valid regex")),
        regions: &["cn-north-1", "cn-northwest-1"],
    },
    Partition {
        id: "aws-us-gov",
        dns_suffix: "amazonaws.com",
        region_regex: Lazy::new(|| Regex::new(r"^us\-gov\-\w+\-\d+$").expect("valid regex")),
        regions: &["us-gov-east-1", "us-gov-west-1"],
    },
    Partition {
        id: "aws-iso",
        dns_suffix: "c2s.ic.gov",
        region_regex: Lazy::new(|| Regex::new(r"^us\-iso\-\w+\-\d+$").expect("valid regex")),
        regions: &["us-iso-east-1", "us-iso-west-1"],
    },
    Partition {
        id: "aws-iso-b",
        dns_suffix: "sc2s.sgov.gov",
        region_regex: Lazy::new(|| Regex::new(r"^us\-isob\-\w+\-\d+$").expect("valid regex")),
        regions: &["us-isob-east-1"],
    },
];

fn partition_for_region(region: &str) -> Option<&'static Partition> {
    PARTITIONS
        .iter()
        .find(|p| p.regions.contains(&region) || p.region_regex.is_match(region))
}

/// check if `region` belongs to one of the known aws partitions
pub fn validate_region(region: &str) -> bool {
    partition_for_region(region).is_some()
}

/// dns suffix of the partition `region` belongs to
pub fn dns_suffix_for_region(region: &str) -> &'static str {
    partition_for_region(region).map_or("amazonaws.com", |p| p.dns_suffix)
}

/// arn of the instance profile attached to the current ec2 instance
pub async fn instance_profile_arn<M: InstanceMetadata + ?Sized>(
    metadata: &M,
) -> Result<ResourceName, ResolveError> {
    if !metadata.available().await {
        return Err(ResolveError::MetadataUnavailable);
    }

    let info = metadata
        .iam_info()
        .await
        .map_err(|err| ResolveError::MetadataQueryFailed(err.to_string()))?;

    info.instance_profile_arn
        .parse()
        .map_err(|source| ResolveError::InvalidInstanceArn {
            arn: info.instance_profile_arn.clone(),
            source,
        })
}

/// sns arn prefix of the account `instance_arn` belongs to
///
/// instance profile arns look like
/// `arn:aws:iam::account-id:instance-profile/role-name`
pub fn base_topic_prefix(instance_arn: &ResourceName, region: &str) -> String {
    format!(
        "{ARN_PREFIX}:{}:{SNS_SERVICE}:{region}:{}:",
        instance_arn.partition, instance_arn.account_id
    )
}

/// Detect the sns topic prefix from the instance metadata service.
///
/// The region is taken from the metadata service, falling back to
/// [REGION_ENV_VARS] looked up through `env`.
pub async fn detect_prefix<M, E>(metadata: &M, env: E) -> Result<String, ResolveError>
where
    M: InstanceMetadata + ?Sized,
    E: Fn(&str) -> Option<String>,
{
    let instance_arn = instance_profile_arn(metadata).await?;

    let region = match metadata.region().await {
        Ok(region) if validate_region(&region) => region,
        Ok(_) | Err(_) => {
            tracing::debug!("could not get region from metadata api, trying environment");

            REGION_ENV_VARS
                .iter()
                .filter_map(|var| env(var))
                .find(|region| validate_region(region))
                .ok_or(ResolveError::PrefixUndetectable)?
        }
    };

    Ok(base_topic_prefix(&instance_arn, &region))
}
