//! Credential providers: where `user -> password` pairs come from.
//!
//! | kind             | source                                       | reload |
//! |------------------|----------------------------------------------|--------|
//! | `env`            | `USER:PASS` pairs in a single string         | no     |
//! | `file`           | JSON, optionally AES-256-GCM sealed          | yes    |
//! | `mounted-secret` | `user:password` lines in a mounted directory | yes    |
//! | `remote-kv`, `cloud-secret`, `http` | externally defined        | yes    |

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use serde::Deserialize;
use tracing::{info, warn};

use super::CredentialStore;
use crate::error::{ProxyError, ProxyResult};

#[derive(Debug, Deserialize)]
struct CredentialFile {
    users: Vec<CredentialFileUser>,
}

#[derive(Debug, Deserialize)]
struct CredentialFileUser {
    username: String,
    password: String,
}

/// A configured credential source.
#[derive(Debug)]
pub enum CredentialProvider {
    /// `USER:PASS[,USER:PASS...]` pairs carried in configuration
    Env { users: String },
    /// JSON file, optionally sealed with AES-256-GCM
    File {
        path: PathBuf,
        key: Option<[u8; 32]>,
    },
    /// Newline-delimited `user:password` text in a mounted directory
    MountedSecret { dir: PathBuf },
    /// Externally defined providers, not available in the baseline
    RemoteKv,
    CloudSecret,
    Http,
}

impl CredentialProvider {
    pub fn supports_reload(&self) -> bool {
        !matches!(self, CredentialProvider::Env { .. })
    }

    /// Fetch the current `user -> password` mapping from the source.
    pub async fn fetch(&self) -> ProxyResult<HashMap<String, String>> {
        match self {
            CredentialProvider::Env { users } => parse_user_pairs(users),
            CredentialProvider::File { path, key } => {
                let mut data = tokio::fs::read(path).await?;
                if let Some(key) = key {
                    data = open_credentials(key, &data)?;
                }
                let parsed: CredentialFile = serde_json::from_slice(&data)
                    .map_err(|e| ProxyError::CredentialProvider(e.to_string()))?;
                Ok(parsed
                    .users
                    .into_iter()
                    .map(|u| (u.username, u.password))
                    .collect())
            }
            CredentialProvider::MountedSecret { dir } => {
                let data = tokio::fs::read_to_string(dir.join("users")).await?;
                let mut credentials = HashMap::new();
                for line in data.lines() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let (user, password) = line.split_once(':').ok_or_else(|| {
                        ProxyError::CredentialProvider(format!(
                            "malformed mounted-secret line: {line:?}"
                        ))
                    })?;
                    credentials.insert(user.trim().to_owned(), password.trim().to_owned());
                }
                Ok(credentials)
            }
            CredentialProvider::RemoteKv => Err(ProxyError::CredentialProvider(
                "remote-kv provider is not available in this build".to_owned(),
            )),
            CredentialProvider::CloudSecret => Err(ProxyError::CredentialProvider(
                "cloud-secret provider is not available in this build".to_owned(),
            )),
            CredentialProvider::Http => Err(ProxyError::CredentialProvider(
                "http provider is not available in this build".to_owned(),
            )),
        }
    }
}

fn parse_user_pairs(raw: &str) -> ProxyResult<HashMap<String, String>> {
    let mut credentials = HashMap::new();
    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let (user, password) = pair.split_once(':').ok_or_else(|| {
            ProxyError::CredentialProvider(format!("malformed user pair: {pair:?}"))
        })?;
        credentials.insert(user.trim().to_owned(), password.trim().to_owned());
    }
    Ok(credentials)
}

/// Derive the 32-byte file key from a configured passphrase: the passphrase
/// bytes, truncated or zero-padded.
pub fn derive_file_key(passphrase: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    let bytes = passphrase.as_bytes();
    let n = bytes.len().min(32);
    key[..n].copy_from_slice(&bytes[..n]);
    key
}

/// Seal a credential file with AES-256-GCM. The 12-byte random nonce is
/// prepended to the ciphertext.
pub fn seal_credentials(key: &[u8; 32], plaintext: &[u8]) -> ProxyResult<Vec<u8>> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| ProxyError::CredentialProvider("invalid encryption key".to_owned()))?;
    let sealing_key = LessSafeKey::new(unbound);

    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| ProxyError::CredentialProvider("encryption failed".to_owned()))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&in_out);
    Ok(sealed)
}

/// Reverse of [`seal_credentials`].
pub fn open_credentials(key: &[u8; 32], sealed: &[u8]) -> ProxyResult<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(ProxyError::CredentialProvider(
            "encrypted credential file too short".to_owned(),
        ));
    }

    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| ProxyError::CredentialProvider("invalid encryption key".to_owned()))?;
    let opening_key = LessSafeKey::new(unbound);

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::try_assume_unique_for_key(nonce_bytes)
        .map_err(|_| ProxyError::CredentialProvider("invalid nonce".to_owned()))?;

    let mut in_out = ciphertext.to_vec();
    let plaintext = opening_key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| ProxyError::CredentialProvider("decryption failed".to_owned()))?;
    Ok(plaintext.to_vec())
}

/// Poll the provider on an interval, atomically replacing the store on each
/// successful fetch. A failed fetch keeps the previous set.
pub fn spawn_reload(
    store: Arc<CredentialStore>,
    provider: Arc<CredentialProvider>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick fires immediately; the initial load already happened
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match provider.fetch().await {
                Ok(credentials) => {
                    store.replace(&credentials);
                    info!(users = credentials.len(), "credentials reloaded");
                }
                Err(e) => {
                    warn!(error = %e, "credential reload failed, keeping previous set");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_env_provider() {
        let provider = CredentialProvider::Env {
            users: "alice:wonderland, bob:builder".to_owned(),
        };
        assert!(!provider.supports_reload());

        let creds = provider.fetch().await.unwrap();
        assert_eq!(creds.get("alice").map(String::as_str), Some("wonderland"));
        assert_eq!(creds.get("bob").map(String::as_str), Some("builder"));

        let malformed = CredentialProvider::Env {
            users: "alice".to_owned(),
        };
        assert!(malformed.fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_file_provider_plaintext() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"users": [{"username": "alice", "password": "wonderland"}]}"#)
            .unwrap();

        let provider = CredentialProvider::File {
            path: file.path().to_path_buf(),
            key: None,
        };
        assert!(provider.supports_reload());

        let creds = provider.fetch().await.unwrap();
        assert_eq!(creds.get("alice").map(String::as_str), Some("wonderland"));
    }

    #[tokio::test]
    async fn test_file_provider_sealed() {
        let key = derive_file_key("s3cret");
        let plaintext = br#"{"users": [{"username": "alice", "password": "wonderland"}]}"#;
        let sealed = seal_credentials(&key, plaintext).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&sealed).unwrap();

        let provider = CredentialProvider::File {
            path: file.path().to_path_buf(),
            key: Some(key),
        };
        let creds = provider.fetch().await.unwrap();
        assert_eq!(creds.get("alice").map(String::as_str), Some("wonderland"));

        // wrong key fails closed
        let provider = CredentialProvider::File {
            path: file.path().to_path_buf(),
            key: Some(derive_file_key("wrong")),
        };
        assert!(provider.fetch().await.is_err());
    }

    #[tokio::test]
    async fn test_mounted_secret_provider() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("users"),
            "# managed by the platform\nalice:wonderland\n\nbob:builder\n",
        )
        .unwrap();

        let provider = CredentialProvider::MountedSecret {
            dir: dir.path().to_path_buf(),
        };
        let creds = provider.fetch().await.unwrap();
        assert_eq!(creds.len(), 2);
        assert_eq!(creds.get("bob").map(String::as_str), Some("builder"));
    }

    #[tokio::test]
    async fn test_external_providers_error_in_baseline() {
        for provider in [
            CredentialProvider::RemoteKv,
            CredentialProvider::CloudSecret,
            CredentialProvider::Http,
        ] {
            assert!(provider.fetch().await.is_err());
        }
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = derive_file_key("correct horse battery staple");
        let plaintext = b"{\"users\": []}";

        let sealed = seal_credentials(&key, plaintext).unwrap();
        assert_ne!(&sealed[NONCE_LEN..], plaintext.as_slice());

        let opened = open_credentials(&key, &sealed).unwrap();
        assert_eq!(opened, plaintext);

        // tampering is detected
        let mut tampered = sealed.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert!(open_credentials(&key, &tampered).is_err());
    }
}
