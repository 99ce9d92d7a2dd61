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

//! iam-authenticator - Kubernetes authentication with AWS IAM credentials
//!
//! This library provides the pieces of the authenticator server:
//! - Startup and shutdown orchestration
//! - Identity mapping resources, clients and a watch cache over them
//! - The mapping controller
//! - Token verification against STS
//! - The TokenReview webhook server
//! - Configuration and feature gates

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bootstrap;
pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod feature;
pub mod mapping;
pub mod server;
pub mod token;

// Re-export commonly used types
pub use bootstrap::{Bootstrap, BootstrapError, Mode};
pub use cache::{Lister, WatchCache};
pub use client::{ClientFactory, ClientPair};
pub use config::AuthenticatorConfig;
pub use controller::{Controller, ControllerError, FunctionController, MappingController};
pub use feature::{FeatureGate, MemoryFeatureGate};
pub use server::AuthServer;
pub use token::{Identity, StsVerifier, TokenVerifier};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
