// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The `IAMIdentityMapping` resource and ARN helpers.

#![allow(clippy::upper_case_acronyms)]

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maps an IAM principal to a Kubernetes user and groups.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "iamauthenticator.k8s.aws",
    version = "v1alpha1",
    kind = "IAMIdentityMapping",
    plural = "iamidentitymappings",
    status = "IAMIdentityMappingStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct IAMIdentityMappingSpec {
    /// ARN of the IAM user or role.
    pub arn: String,

    /// Username template.
    pub username: String,

    /// Group templates.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Reconciled state of an [`IAMIdentityMapping`].
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IAMIdentityMappingStatus {
    /// Canonical form of `spec.arn`.
    #[serde(rename = "canonicalARN", default, skip_serializing_if = "Option::is_none")]
    pub canonical_arn: Option<String>,

    /// Stable identifier derived from the canonical ARN.
    #[serde(rename = "userID", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl IAMIdentityMapping {
    /// Key the mapping is indexed under: the lowercased canonical ARN from
    /// status, or the lowercased spec ARN before the controller has run.
    pub fn index_key(&self) -> String {
        self.status
            .as_ref()
            .and_then(|s| s.canonical_arn.as_deref())
            .unwrap_or(&self.spec.arn)
            .to_lowercase()
    }

    /// Name of the mapping. Mappings are cluster scoped.
    pub fn key(&self) -> String {
        self.name_any()
    }
}

/// Errors returned by [`canonicalize`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArnError {
    #[error("arn '{0}' is malformed")]
    Malformed(String),

    #[error("arn '{0}' has unsupported partition '{1}'")]
    Partition(String, String),

    #[error("arn '{0}' has unsupported service or resource type")]
    Unsupported(String),
}

const PARTITIONS: &[&str] = &["aws", "aws-cn", "aws-us-gov", "aws-iso", "aws-iso-b"];

/// Parsed parts of an ARN that canonicalization cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArnParts<'a> {
    /// `aws`, `aws-cn`, ...
    pub partition: &'a str,
    /// `iam` or `sts` for the ARNs we accept.
    pub service: &'a str,
    /// Twelve-digit account id.
    pub account: &'a str,
    /// Everything after the account, e.g. `role/Admin`.
    pub resource: &'a str,
}

/// Splits an ARN into its components.
pub fn parse(arn: &str) -> Result<ArnParts<'_>, ArnError> {
    let mut parts = arn.splitn(6, ':');
    let (Some("arn"), Some(partition), Some(service), Some(_region), Some(account), Some(resource)) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return Err(ArnError::Malformed(arn.to_string()));
    };

    if !PARTITIONS.contains(&partition) {
        return Err(ArnError::Partition(arn.to_string(), partition.to_string()));
    }

    Ok(ArnParts {
        partition,
        service,
        account,
        resource,
    })
}

/// Reduces an IAM or STS ARN to the form mappings are declared in.
///
/// Assumed-role session ARNs become the ARN of the role itself; IAM users,
/// roles, account roots and federated users are returned unchanged.
pub fn canonicalize(arn: &str) -> Result<String, ArnError> {
    let parts = parse(arn)?;

    match parts.service {
        "iam" => {
            let kind = parts.resource.split('/').next().unwrap_or_default();
            match kind {
                "user" | "role" | "root" => Ok(arn.to_string()),
                _ => Err(ArnError::Unsupported(arn.to_string())),
            }
        }
        "sts" => {
            let segments: Vec<&str> = parts.resource.split('/').collect();
            match segments.as_slice() {
                ["assumed-role", role, _session] => Ok(format!(
                    "arn:{}:iam::{}:role/{}",
                    parts.partition, parts.account, role
                )),
                ["federated-user", _] => Ok(arn.to_string()),
                _ => Err(ArnError::Unsupported(arn.to_string())),
            }
        }
        _ => Err(ArnError::Unsupported(arn.to_string())),
    }
}

/// Derives the user id written to status from a canonical ARN.
pub fn user_id(canonical_arn: &str) -> String {
    format!("iam-authenticator:{}", canonical_arn.to_lowercase())
}

/// Values available to username and group templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateValues<'a> {
    /// Account the caller belongs to.
    pub account_id: &'a str,
    /// Role session name, empty for IAM users.
    pub session_name: &'a str,
}

/// Expands `{{AccountID}}`, `{{SessionName}}` and `{{SessionNameRaw}}`.
///
/// `{{SessionName}}` replaces `@` with `-` so email-shaped session names
/// stay valid in usernames.
pub fn render_template(template: &str, values: &TemplateValues<'_>) -> String {
    template
        .replace("{{AccountID}}", values.account_id)
        .replace("{{SessionNameRaw}}", values.session_name)
        .replace("{{SessionName}}", &values.session_name.replace('@', "-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_iam() {
        for arn in [
            "arn:aws:iam::123456789012:user/Alice",
            "arn:aws:iam::123456789012:role/Admin",
            "arn:aws:iam::123456789012:root",
            "arn:aws-cn:iam::123456789012:role/path/Admin",
        ] {
            assert_eq!(canonicalize(arn).unwrap(), arn);
        }
    }

    #[test]
    fn test_canonicalize_assumed_role() {
        assert_eq!(
            canonicalize("arn:aws:sts::123456789012:assumed-role/Admin/alice@example.com").unwrap(),
            "arn:aws:iam::123456789012:role/Admin"
        );
        assert_eq!(
            canonicalize("arn:aws-us-gov:sts::123456789012:assumed-role/Ops/i-0abc").unwrap(),
            "arn:aws-us-gov:iam::123456789012:role/Ops"
        );
    }

    #[test]
    fn test_canonicalize_federated_user() {
        let arn = "arn:aws:sts::123456789012:federated-user/Bob";
        assert_eq!(canonicalize(arn).unwrap(), arn);
    }

    #[test]
    fn test_canonicalize_errors() {
        assert!(matches!(canonicalize("not-an-arn"), Err(ArnError::Malformed(_))));
        assert!(matches!(
            canonicalize("arn:gcp:iam::1:user/x"),
            Err(ArnError::Partition(_, p)) if p == "gcp"
        ));
        assert!(matches!(
            canonicalize("arn:aws:s3:::bucket"),
            Err(ArnError::Unsupported(_))
        ));
        assert!(matches!(
            canonicalize("arn:aws:sts::1:assumed-role/OnlyRole"),
            Err(ArnError::Unsupported(_))
        ));
    }

    #[test]
    fn test_render_template() {
        let values = TemplateValues {
            account_id: "123456789012",
            session_name: "alice@example.com",
        };
        assert_eq!(
            render_template("admin:{{AccountID}}:{{SessionName}}", &values),
            "admin:123456789012:alice-example.com"
        );
        assert_eq!(render_template("{{SessionNameRaw}}", &values), "alice@example.com");
        assert_eq!(render_template("plain", &values), "plain");
    }

    #[test]
    fn test_index_key_prefers_status() {
        let mut mapping = IAMIdentityMapping::new(
            "admin",
            IAMIdentityMappingSpec {
                arn: "arn:aws:iam::1:role/Admin".to_string(),
                username: "admin".to_string(),
                groups: vec![],
            },
        );
        assert_eq!(mapping.index_key(), "arn:aws:iam::1:role/admin");

        mapping.status = Some(IAMIdentityMappingStatus {
            canonical_arn: Some("arn:aws:iam::1:role/Other".to_string()),
            user_id: None,
        });
        assert_eq!(mapping.index_key(), "arn:aws:iam::1:role/other");
        assert_eq!(mapping.key(), "admin");
    }
}
