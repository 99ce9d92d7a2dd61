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

//! Configuration structures for the authenticator.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default webhook port.
pub const DEFAULT_PORT: u16 = 21362;

/// Main configuration for the authenticator server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorConfig {
    /// Identifies the cluster to STS. Presigned tokens must name it.
    #[serde(default)]
    pub cluster_id: String,

    /// Webhook listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// How to reach the Kubernetes API server.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Feature gate overrides, by gate name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,

    /// Mappings declared in the configuration file.
    #[serde(default)]
    pub mappings: StaticMappings,

    /// The maximum time to wait for background tasks to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            server: ServerConfig::default(),
            connection: ConnectionConfig::default(),
            feature_gates: BTreeMap::new(),
            mappings: StaticMappings::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Webhook listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// IP address to bind to. Usually 127.0.0.1 or 0.0.0.0.
    #[serde(default = "default_address")]
    pub address: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Returns `address:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Connection parameters for the Kubernetes API server.
///
/// When both fields are empty the in-cluster service account is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// URL of the API server. Overrides the kubeconfig's server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Kubeconfig file to load credentials from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

impl ConnectionConfig {
    /// Returns true if neither an endpoint nor a kubeconfig was given.
    pub fn is_in_cluster(&self) -> bool {
        self.master.as_deref().map_or(true, str::is_empty) && self.kubeconfig.is_none()
    }
}

/// Mappings declared statically in the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticMappings {
    /// IAM roles mapped to users.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleMapping>,

    /// IAM users mapped to users.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<UserMapping>,

    /// AWS accounts whose identities are allowed in with their ARN as username.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accounts: Vec<String>,
}

/// Maps an IAM role to a Kubernetes user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMapping {
    /// ARN of the role.
    #[serde(rename = "rolearn")]
    pub role_arn: String,

    /// Username template.
    pub username: String,

    /// Group templates.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Maps an IAM user to a Kubernetes user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMapping {
    /// ARN of the user.
    #[serde(rename = "userarn")]
    pub user_arn: String,

    /// Username template.
    pub username: String,

    /// Group templates.
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Duration fields in human-readable form ("30s", "10m").
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AuthenticatorConfig::default();
        assert_eq!(config.server.bind_addr(), "127.0.0.1:21362");
        assert!(config.connection.is_in_cluster());
        assert!(config.feature_gates.is_empty());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r#"
clusterId: prod
server:
  address: 0.0.0.0
connection:
  master: https://10.0.0.1:6443
featureGates:
  IAMIdentityMappingCRD: true
mappings:
  roles:
    - rolearn: arn:aws:iam::000000000000:role/KubernetesAdmin
      username: admin:{{SessionName}}
      groups: [system:masters]
  users:
    - userarn: arn:aws:iam::000000000000:user/Alice
      username: alice
  accounts: ["000000000000"]
shutdownTimeout: 5s
"#;

        let config: AuthenticatorConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cluster_id, "prod");
        assert_eq!(config.server.bind_addr(), "0.0.0.0:21362");
        assert!(!config.connection.is_in_cluster());
        assert_eq!(config.feature_gates.get("IAMIdentityMappingCRD"), Some(&true));
        assert_eq!(config.mappings.roles[0].groups, vec!["system:masters"]);
        assert!(config.mappings.users[0].groups.is_empty());
        assert_eq!(config.mappings.accounts, vec!["000000000000"]);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_empty_master_is_in_cluster() {
        let connection = ConnectionConfig {
            master: Some(String::new()),
            kubeconfig: None,
        };
        assert!(connection.is_in_cluster());
    }
}
