// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Traefik custom resources used for routing middlewares.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Traefik `Middleware` spec. Only the middlewares the engine emits are modelled.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(group = "traefik.io", version = "v1alpha1", kind = "Middleware", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct MiddlewareSpec {
    /// Credential gate backed by an htpasswd secret.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic_auth: Option<BasicAuthMiddleware>,
    /// Scheme redirect.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_scheme: Option<RedirectSchemeMiddleware>,
}

/// `basicAuth` middleware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BasicAuthMiddleware {
    /// Secret holding a `users` key with htpasswd lines.
    pub secret: String,
}

/// `redirectScheme` middleware.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RedirectSchemeMiddleware {
    /// Target scheme.
    pub scheme: String,
    /// Use a permanent redirect.
    pub permanent: bool,
}

/// Reference to a middleware from an `Ingress` annotation.
pub fn middleware_ref(namespace: &str, name: &str) -> String {
    format!("{namespace}-{name}@kubernetescrd")
}
