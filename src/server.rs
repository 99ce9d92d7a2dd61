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

//! Authentication webhook server.
//!
//! The API server posts a `TokenReview` to `/authenticate` for every bearer
//! token it sees. We verify the token, look the caller's ARN up in the
//! identity mappings and answer with the Kubernetes user it maps to.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Bytes};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use k8s_openapi::api::authentication::v1::{TokenReviewStatus, UserInfo};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::Lister;
use crate::config::{AuthenticatorConfig, StaticMappings};
use crate::mapping::{render_template, TemplateValues};
use crate::token::{Identity, TokenVerifier};

/// Largest `TokenReview` body accepted.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// `apiVersion` answered when the request does not name one.
const DEFAULT_API_VERSION: &str = "authentication.k8s.io/v1beta1";

/// Pause after a failed accept so a full file table does not spin the loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TokenReviewRequest {
    #[serde(default)]
    api_version: Option<String>,
    #[serde(default)]
    spec: TokenReviewSpec,
}

#[derive(Deserialize, Debug, Default)]
struct TokenReviewSpec {
    #[serde(default)]
    token: String,
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct TokenReviewResponse {
    api_version: String,
    kind: &'static str,
    status: TokenReviewStatus,
}

/// Kubernetes user an identity was mapped to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MappedUser {
    username: String,
    groups: Vec<String>,
}

struct State {
    lister: Lister,
    verifier: Arc<dyn TokenVerifier>,
    mappings: StaticMappings,
}

/// The webhook server, not yet listening.
pub struct AuthServer {
    bind_addr: String,
    state: Arc<State>,
}

impl std::fmt::Debug for AuthServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthServer")
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}

impl AuthServer {
    /// Creates a server answering from `lister` and the static mappings in
    /// `config`.
    pub fn new(config: &AuthenticatorConfig, lister: Lister, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            bind_addr: config.server.bind_addr(),
            state: Arc::new(State {
                lister,
                verifier,
                mappings: config.mappings.clone(),
            }),
        }
    }

    /// Binds the listener.
    pub async fn bind(self) -> anyhow::Result<BoundServer> {
        let listener = TcpListener::bind(&self.bind_addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "webhook server listening");
        Ok(BoundServer {
            listener,
            state: self.state,
        })
    }
}

/// A server whose listener is bound.
pub struct BoundServer {
    listener: TcpListener,
    state: Arc<State>,
}

impl BoundServer {
    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `cancel` fires, then closes the listener
    /// and waits for open connections to finish their current request.
    pub async fn serve(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut connections = JoinSet::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let state = Arc::clone(&self.state);
            let cancel = cancel.clone();
            connections.spawn(async move {
                let service = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(state.handle(req).await) }
                });
                let conn = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
                tokio::pin!(conn);

                let result = tokio::select! {
                    result = conn.as_mut() => result,
                    _ = cancel.cancelled() => {
                        conn.as_mut().graceful_shutdown();
                        conn.await
                    }
                };
                if let Err(e) = result {
                    tracing::debug!(%peer, error = %e, "connection error");
                }
            });

            // Reap finished connections.
            while connections.try_join_next().is_some() {}
        }

        drop(self.listener);
        tracing::info!(open = connections.len(), "webhook server draining connections");
        while connections.join_next().await.is_some() {}
        tracing::info!("webhook server stopped");
        Ok(())
    }
}

impl State {
    async fn handle<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        match (req.method(), req.uri().path()) {
            (&Method::POST, "/authenticate") => self.authenticate(req.into_body()).await,
            (&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
            (&Method::GET, "/readyz") => {
                if self.lister.has_synced() {
                    text(StatusCode::OK, "ok")
                } else {
                    text(StatusCode::SERVICE_UNAVAILABLE, "identity mapping cache not synced")
                }
            }
            _ => text(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn authenticate<B>(&self, body: B) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let bytes = match Limited::new(body, MAX_BODY_BYTES).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<LengthLimitError>() => {
                return text(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
            }
            Err(e) => {
                tracing::debug!(error = %e, "failed to read request body");
                return text(StatusCode::BAD_REQUEST, "failed to read request body");
            }
        };

        let review: TokenReviewRequest = match serde_json::from_slice(&bytes) {
            Ok(review) => review,
            Err(e) => {
                tracing::debug!(error = %e, "malformed TokenReview");
                return review_response(
                    StatusCode::BAD_REQUEST,
                    DEFAULT_API_VERSION,
                    failed(format!("malformed TokenReview: {e}")),
                );
            }
        };
        let api_version = review.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION);

        let identity = match self.verifier.verify(&review.spec.token).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(error = %e, "access denied");
                return review_response(StatusCode::FORBIDDEN, api_version, failed(e.to_string()));
            }
        };

        let Some(user) = self.map(&identity) else {
            tracing::warn!(arn = %identity.arn, canonical_arn = %identity.canonical_arn, "access denied: ARN is not mapped");
            return review_response(
                StatusCode::FORBIDDEN,
                api_version,
                failed(format!("ARN is not mapped: {}", identity.canonical_arn)),
            );
        };

        tracing::info!(
            arn = %identity.arn,
            username = %user.username,
            groups = ?user.groups,
            "access granted"
        );
        review_response(StatusCode::OK, api_version, authenticated(&identity, user))
    }

    /// Resolves an identity. Mapping resources win over static role and
    /// user mappings, which win over the account allow-list.
    fn map(&self, identity: &Identity) -> Option<MappedUser> {
        let arn = identity.canonical_arn.as_str();

        let (username, groups) = if let Some(mapping) = self.lister.get_by_canonical_arn(arn) {
            (mapping.spec.username.clone(), mapping.spec.groups.clone())
        } else if let Some(role) = self
            .mappings
            .roles
            .iter()
            .find(|r| r.role_arn.eq_ignore_ascii_case(arn))
        {
            (role.username.clone(), role.groups.clone())
        } else if let Some(user) = self
            .mappings
            .users
            .iter()
            .find(|u| u.user_arn.eq_ignore_ascii_case(arn))
        {
            (user.username.clone(), user.groups.clone())
        } else if self.mappings.accounts.contains(&identity.account_id) {
            (identity.arn.clone(), Vec::new())
        } else {
            return None;
        };

        let values = TemplateValues {
            account_id: &identity.account_id,
            session_name: &identity.session_name,
        };
        Some(MappedUser {
            username: render_template(&username, &values),
            groups: groups.iter().map(|g| render_template(g, &values)).collect(),
        })
    }
}

fn authenticated(identity: &Identity, user: MappedUser) -> TokenReviewStatus {
    let extra = BTreeMap::from([
        ("accessKeyId".to_string(), vec![identity.access_key_id.clone()]),
        ("arn".to_string(), vec![identity.arn.clone()]),
        ("canonicalArn".to_string(), vec![identity.canonical_arn.clone()]),
        ("sessionName".to_string(), vec![identity.session_name.clone()]),
    ]);

    TokenReviewStatus {
        authenticated: Some(true),
        user: Some(UserInfo {
            username: Some(user.username),
            uid: Some(format!(
                "aws-iam-authenticator:{}:{}",
                identity.account_id, identity.user_id
            )),
            groups: Some(user.groups),
            extra: Some(extra),
        }),
        ..Default::default()
    }
}

fn failed(error: String) -> TokenReviewStatus {
    TokenReviewStatus {
        authenticated: Some(false),
        error: Some(error),
        ..Default::default()
    }
}

fn review_response(status: StatusCode, api_version: &str, review: TokenReviewStatus) -> Response<Full<Bytes>> {
    let body = TokenReviewResponse {
        api_version: api_version.to_string(),
        kind: "TokenReview",
        status: review,
    };
    match serde_json::to_vec(&body) {
        Ok(json) => {
            let mut response = Response::new(Full::new(Bytes::from(json)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode TokenReview");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
