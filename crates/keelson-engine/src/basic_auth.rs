// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Basic-auth middleware and credential secrets.
//!
//! An app gated by basic auth owns three objects:
//!
//! - `basic-auth-<app_id>` Secret with bcrypt htpasswd lines under `users`,
//!   read by the ingress router.
//! - `basic-auth-plain-<app_id>` Secret with the credentials as AES-256-GCM
//!   encrypted JSON, only ever decrypted to show them to an operator.
//! - `basic-auth-<app_id>` Traefik `Middleware` pointing at the first secret.
//!
//! bcrypt salts differ on every hash, so unchanged credentials are detected
//! by decrypting the plain secret (or verifying the htpasswd lines when no
//! credential key is configured) instead of comparing secret content.

use std::collections::BTreeMap;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, info, warn};

use crate::cluster::crd::{BasicAuthMiddleware, Middleware, MiddlewareSpec};
use crate::cluster::{Cluster, app_labels};
use crate::error::{Error, Result};
use crate::model::BasicAuthEntry;

/// bcrypt cost of htpasswd lines.
const HASH_COST: u32 = 10;
const NONCE_LEN: usize = 12;
const USERS_KEY: &str = "users";
const CREDENTIALS_KEY: &str = "credentials";

/// Name of the htpasswd secret and of the middleware.
pub fn basic_auth_name(app_id: &str) -> String {
    format!("basic-auth-{app_id}")
}

/// Name of the encrypted plain-credentials secret.
pub fn plain_secret_name(app_id: &str) -> String {
    format!("basic-auth-plain-{app_id}")
}

/// Render htpasswd lines, one per entry.
pub fn htpasswd(entries: &[BasicAuthEntry]) -> Result<String> {
    entries
        .iter()
        .map(|entry| {
            let hash = bcrypt::hash_with_result(&entry.password, HASH_COST)
                .map_err(|_| Error::External("failed to hash basic-auth password".to_string()))?
                .format_for_version(bcrypt::Version::TwoY);
            Ok(format!("{}:{hash}", entry.username))
        })
        .collect::<Result<Vec<_>>>()
        .map(|lines| lines.join("\n"))
}

/// Whether existing htpasswd lines accept exactly these credentials.
pub fn htpasswd_matches(existing: &str, entries: &[BasicAuthEntry]) -> bool {
    let lines: Vec<(&str, &str)> = existing
        .lines()
        .filter_map(|line| line.split_once(':'))
        .collect();
    lines.len() == entries.len()
        && entries.iter().all(|entry| {
            lines.iter().any(|(user, hash)| {
                *user == entry.username && bcrypt::verify(&entry.password, hash).unwrap_or(false)
            })
        })
}

/// Encrypt credentials as `nonce || ciphertext`.
pub fn seal(key: &[u8; 32], entries: &[BasicAuthEntry]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let plaintext = serde_json::to_vec(entries)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
        .map_err(|_| Error::External("failed to encrypt basic-auth credentials".to_string()))?;

    let mut sealed = nonce_bytes.to_vec();
    sealed.extend(ciphertext);
    Ok(sealed)
}

/// Decrypt credentials produced by [`seal`].
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<BasicAuthEntry>> {
    if sealed.len() <= NONCE_LEN {
        return Err(Error::External("basic-auth credentials are truncated".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::External("failed to decrypt basic-auth credentials".to_string()))?;
    Ok(serde_json::from_slice(&plaintext)?)
}

fn secret(namespace: &str, app_id: &str, name: String, key: &str, value: Vec<u8>) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            labels: Some(app_labels(app_id)),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(key.to_string(), ByteString(value))])),
        ..Default::default()
    }
}

fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret.data.as_ref()?.get(key).map(|bytes| bytes.0.clone())
}

/// Whether the stored secrets already hold exactly `entries`.
async fn credentials_unchanged(
    cluster: &Cluster,
    namespace: &str,
    app_id: &str,
    entries: &[BasicAuthEntry],
    credential_key: Option<&[u8; 32]>,
) -> Result<bool> {
    let Some(hashed) = cluster
        .get::<Secret>(namespace, &basic_auth_name(app_id))
        .await?
    else {
        return Ok(false);
    };

    match credential_key {
        Some(key) => {
            let Some(plain) = cluster
                .get::<Secret>(namespace, &plain_secret_name(app_id))
                .await?
            else {
                return Ok(false);
            };
            let Some(sealed) = secret_value(&plain, CREDENTIALS_KEY) else {
                return Ok(false);
            };
            match open(key, &sealed) {
                Ok(stored) => Ok(stored == entries),
                Err(_) => {
                    // Key was rotated; rewrite with the current one
                    warn!(app_id, namespace, "Stored basic-auth credentials do not decrypt");
                    Ok(false)
                }
            }
        }
        None => {
            let users = secret_value(&hashed, USERS_KEY).unwrap_or_default();
            Ok(htpasswd_matches(&String::from_utf8_lossy(&users), entries))
        }
    }
}

/// Reconcile the app's basic-auth objects.
///
/// Returns the middleware name when basic auth is enabled. An empty entry list
/// removes both secrets and the middleware.
pub async fn reconcile_basic_auth(
    cluster: &Cluster,
    namespace: &str,
    app_id: &str,
    entries: &[BasicAuthEntry],
    credential_key: Option<&[u8; 32]>,
) -> Result<Option<String>> {
    let name = basic_auth_name(app_id);

    if entries.is_empty() {
        let removed = cluster.delete::<Middleware>(namespace, &name).await?
            | cluster.delete::<Secret>(namespace, &name).await?
            | cluster
                .delete::<Secret>(namespace, &plain_secret_name(app_id))
                .await?;
        if removed {
            info!(app_id, namespace, "Removed basic auth");
        }
        return Ok(None);
    }

    if credentials_unchanged(cluster, namespace, app_id, entries, credential_key).await? {
        debug!(app_id, namespace, "Basic-auth credentials unchanged");
    } else {
        let users = htpasswd(entries)?;
        cluster
            .apply(
                namespace,
                &secret(namespace, app_id, name.clone(), USERS_KEY, users.into_bytes()),
            )
            .await?;

        match credential_key {
            Some(key) => {
                cluster
                    .apply(
                        namespace,
                        &secret(
                            namespace,
                            app_id,
                            plain_secret_name(app_id),
                            CREDENTIALS_KEY,
                            seal(key, entries)?,
                        ),
                    )
                    .await?;
            }
            None => {
                warn!(
                    app_id,
                    namespace, "No credential key configured; basic-auth credentials cannot be revealed later"
                );
            }
        }
        info!(app_id, namespace, users = entries.len(), "Updated basic-auth credentials");
    }

    let mut middleware = Middleware::new(
        &name,
        MiddlewareSpec {
            basic_auth: Some(BasicAuthMiddleware {
                secret: name.clone(),
            }),
            redirect_scheme: None,
        },
    );
    middleware.metadata.namespace = Some(namespace.to_string());
    middleware.metadata.labels = Some(app_labels(app_id));
    cluster.apply(namespace, &middleware).await?;

    Ok(Some(name))
}

/// Decrypt the credentials of an app for display to an operator.
pub async fn reveal_basic_auth(
    cluster: &Cluster,
    namespace: &str,
    app_id: &str,
    credential_key: Option<&[u8; 32]>,
) -> Result<Vec<BasicAuthEntry>> {
    let key = credential_key
        .ok_or_else(|| Error::validation("no credential key configured"))?;
    let plain = cluster
        .get::<Secret>(namespace, &plain_secret_name(app_id))
        .await?
        .ok_or_else(|| Error::NotFound(format!("basic-auth credentials of app {app_id}")))?;
    let sealed = secret_value(&plain, CREDENTIALS_KEY)
        .ok_or_else(|| Error::NotFound(format!("basic-auth credentials of app {app_id}")))?;
    open(key, &sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MockCluster;
    use std::sync::Arc;

    const KEY: [u8; 32] = [7; 32];

    fn entry(username: &str, password: &str) -> BasicAuthEntry {
        BasicAuthEntry {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn test_seal_open() {
        let entries = vec![entry("admin", "s3cret")];
        let sealed = seal(&KEY, &entries).unwrap();
        assert!(!String::from_utf8_lossy(&sealed).contains("s3cret"));
        assert_eq!(open(&KEY, &sealed).unwrap(), entries);
        assert!(open(&[8; 32], &sealed).is_err());
    }

    #[test]
    fn test_htpasswd_lines_verify() {
        let entries = vec![entry("admin", "s3cret"), entry("ops", "hunter2")];
        let users = htpasswd(&entries).unwrap();
        assert!(users.lines().all(|l| l.contains(":$2y$")));
        assert!(htpasswd_matches(&users, &entries));
        assert!(!htpasswd_matches(&users, &[entry("admin", "s3cret")]));
        assert!(!htpasswd_matches(&users, &[entry("admin", "other"), entry("ops", "hunter2")]));
    }

    #[tokio::test]
    async fn test_redeploy_does_not_rewrite_secrets() {
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        let entries = vec![entry("admin", "s3cret")];

        let name = reconcile_basic_auth(&cluster, "ns", "a1", &entries, Some(&KEY))
            .await
            .unwrap();
        assert_eq!(name.as_deref(), Some("basic-auth-a1"));

        mock.clear_calls().await;
        reconcile_basic_auth(&cluster, "ns", "a1", &entries, Some(&KEY))
            .await
            .unwrap();
        assert!(mock.mutations().await.is_empty());

        let revealed = reveal_basic_auth(&cluster, "ns", "a1", Some(&KEY)).await.unwrap();
        assert_eq!(revealed, entries);
    }

    #[tokio::test]
    async fn test_removing_last_entry_removes_everything() {
        let mock = Arc::new(MockCluster::new());
        let cluster = Cluster::new(mock.clone());
        reconcile_basic_auth(&cluster, "ns", "a1", &[entry("admin", "x")], Some(&KEY))
            .await
            .unwrap();
        assert_eq!(mock.names("Secret", "ns").await.len(), 2);
        assert_eq!(mock.names("Middleware", "ns").await.len(), 1);

        assert!(reconcile_basic_auth(&cluster, "ns", "a1", &[], Some(&KEY))
            .await
            .unwrap()
            .is_none());
        assert!(mock.names("Secret", "ns").await.is_empty());
        assert!(mock.names("Middleware", "ns").await.is_empty());
    }

    #[tokio::test]
    async fn test_reveal_without_key_is_rejected() {
        let cluster = Cluster::new(Arc::new(MockCluster::new()));
        let err = reveal_basic_auth(&cluster, "ns", "a1", None).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
