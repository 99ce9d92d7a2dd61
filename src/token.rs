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

//! Bearer token verification.
//!
//! A token is a presigned STS `GetCallerIdentity` request, base64url encoded
//! behind the `k8s-aws-v1.` prefix. The URL is checked locally and then
//! replayed against STS, which validates the signature and tells us who
//! signed it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, NaiveDateTime, TimeDelta, Utc};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;

use crate::mapping::{self, ArnError};

/// Prefix of every token this verifier accepts.
pub const TOKEN_PREFIX: &str = "k8s-aws-v1.";

/// Header that binds a token to one cluster.
pub const CLUSTER_ID_HEADER: &str = "x-k8s-aws-id";

/// Longest token accepted.
pub const MAX_TOKEN_LEN: usize = 4 * 1024;

/// Minutes a presigned URL stays valid after it was signed.
pub const PRESIGNED_URL_EXPIRATION_MINUTES: i64 = 15;

const STS_TIMEOUT: Duration = Duration::from_secs(10);

const DATE_FORMAT: &str = "%Y%m%dT%H%M%SZ";

const ALLOWED_PARAMS: &[&str] = &[
    "action",
    "version",
    "x-amz-algorithm",
    "x-amz-credential",
    "x-amz-date",
    "x-amz-expires",
    "x-amz-security-token",
    "x-amz-signature",
    "x-amz-signedheaders",
];

/// Errors returned by a [`TokenVerifier`].
#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("input token was not properly formatted: {0}")]
    Malformed(String),

    #[error("input token has expired")]
    Expired,

    #[error("sts getCallerIdentity failed: {0}")]
    Sts(String),

    #[error("sts request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error(transparent)]
    Arn(#[from] ArnError),
}

fn malformed(reason: impl Into<String>) -> VerifyError {
    VerifyError::Malformed(reason.into())
}

/// The AWS identity behind a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// ARN reported by STS.
    pub arn: String,
    /// ARN the identity is mapped by. See [`mapping::canonicalize`].
    pub canonical_arn: String,
    /// Account the identity belongs to.
    pub account_id: String,
    /// STS unique id, `AROA...:session` for roles.
    pub user_id: String,
    /// Role session name, empty for IAM users.
    pub session_name: String,
    /// Access key that signed the request.
    pub access_key_id: String,
}

/// Turns a bearer token into an AWS identity.
#[async_trait]
pub trait TokenVerifier: Send + Sync + 'static {
    /// Verifies `token`.
    async fn verify(&self, token: &str) -> Result<Identity, VerifyError>;
}

/// A token decoded and checked without contacting STS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    /// The presigned request to replay.
    pub url: Url,
    /// Key id from the `X-Amz-Credential` parameter.
    pub access_key_id: String,
}

/// Decodes a token and checks the presigned URL inside it.
pub fn parse_token(token: &str, now: DateTime<Utc>) -> Result<ParsedToken, VerifyError> {
    if token.len() > MAX_TOKEN_LEN {
        return Err(malformed("token is too large"));
    }
    let encoded = token
        .strip_prefix(TOKEN_PREFIX)
        .ok_or_else(|| malformed(format!("token is missing expected {TOKEN_PREFIX:?} prefix")))?;

    let decoded = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| malformed(e.to_string()))?;
    let raw = String::from_utf8(decoded).map_err(|e| malformed(e.to_string()))?;
    let url = Url::parse(&raw).map_err(|e| malformed(e.to_string()))?;

    if url.scheme() != "https" {
        return Err(malformed(format!("unexpected scheme {:?} in pre-signed URL", url.scheme())));
    }
    let host = url.host_str().unwrap_or_default();
    if !is_sts_host(host) {
        return Err(malformed(format!("unexpected hostname {host:?} in pre-signed URL")));
    }
    if url.path() != "/" {
        return Err(malformed("unexpected path in pre-signed URL"));
    }

    let mut params = HashMap::new();
    for (key, value) in url.query_pairs() {
        let key = key.to_lowercase();
        if !ALLOWED_PARAMS.contains(&key.as_str()) {
            return Err(malformed(format!("non-allowlisted query parameter {key:?}")));
        }
        if params.insert(key.clone(), value.into_owned()).is_some() {
            return Err(malformed(format!("query parameter {key:?} appears more than once")));
        }
    }

    if params.get("action").map(String::as_str) != Some("GetCallerIdentity") {
        return Err(malformed("unexpected action parameter in pre-signed URL"));
    }

    let signed_headers = params.get("x-amz-signedheaders").map(String::as_str).unwrap_or_default();
    if !signed_headers.split(';').any(|h| h.eq_ignore_ascii_case(CLUSTER_ID_HEADER)) {
        return Err(malformed(format!(
            "client did not sign the {CLUSTER_ID_HEADER} header in the pre-signed URL"
        )));
    }

    let date = params
        .get("x-amz-date")
        .ok_or_else(|| malformed("X-Amz-Date parameter must be present in pre-signed URL"))?;
    let signed_at = NaiveDateTime::parse_from_str(date, DATE_FORMAT)
        .map_err(|e| malformed(format!("error parsing X-Amz-Date parameter {date:?}: {e}")))?
        .and_utc();
    if now > signed_at + TimeDelta::minutes(PRESIGNED_URL_EXPIRATION_MINUTES) {
        return Err(VerifyError::Expired);
    }

    let access_key_id = params
        .get("x-amz-credential")
        .and_then(|c| c.split('/').next())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| malformed("X-Amz-Credential parameter must be present in pre-signed URL"))?
        .to_string();

    Ok(ParsedToken { url, access_key_id })
}

/// Matches `sts.amazonaws.com` and regional endpoints such as
/// `sts.us-west-2.amazonaws.com` or `sts.cn-north-1.amazonaws.com.cn`.
fn is_sts_host(host: &str) -> bool {
    let Some(rest) = host.strip_prefix("sts") else {
        return false;
    };
    let Some(region) = rest
        .strip_suffix(".amazonaws.com")
        .or_else(|| rest.strip_suffix(".amazonaws.com.cn"))
    else {
        return false;
    };

    match region.strip_prefix('.') {
        None => region.is_empty(),
        Some(region) => {
            !region.is_empty()
                && region
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityResponse {
    get_caller_identity_response: CallerIdentityEnvelope,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentityEnvelope {
    get_caller_identity_result: CallerIdentity,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: String,
    arn: String,
    user_id: String,
}

fn identity(caller: CallerIdentity, access_key_id: String) -> Result<Identity, VerifyError> {
    let canonical_arn = mapping::canonicalize(&caller.arn)?;
    let session_name = match caller.user_id.split_once(':') {
        Some((_, session)) => session.to_string(),
        None => String::new(),
    };

    Ok(Identity {
        arn: caller.arn,
        canonical_arn,
        account_id: caller.account,
        user_id: caller.user_id,
        session_name,
        access_key_id,
    })
}

/// Verifies tokens by replaying them against STS.
#[derive(Debug, Clone)]
pub struct StsVerifier {
    client: reqwest::Client,
    cluster_id: String,
}

impl StsVerifier {
    /// Creates a verifier that only accepts tokens minted for `cluster_id`.
    pub fn new(cluster_id: impl Into<String>) -> Result<Self, VerifyError> {
        let client = reqwest::Client::builder()
            .timeout(STS_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            cluster_id: cluster_id.into(),
        })
    }
}

#[async_trait]
impl TokenVerifier for StsVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, VerifyError> {
        let parsed = parse_token(token, Utc::now())?;

        let response = self
            .client
            .get(parsed.url)
            .header(CLUSTER_ID_HEADER, &self.cluster_id)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%status, %body, "sts rejected token");
            return Err(VerifyError::Sts(format!("error from AWS (expected 200, got {status})")));
        }

        let caller: CallerIdentityResponse = response.json().await?;
        let identity = identity(
            caller.get_caller_identity_response.get_caller_identity_result,
            parsed.access_key_id,
        )?;
        tracing::debug!(arn = %identity.arn, account = %identity.account_id, "verified token");
        Ok(identity)
    }
}
