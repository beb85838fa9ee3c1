//! Key and certificate cache
//!
//! Persists the ACME account credentials, the per-domain private key and the
//! issued certificate chain in a single owner-only directory.
//!
//! # Directory Structure
//!
//! ```text
//! cache/
//! ├── acme_account.json     # ACME account credentials (key + account URL)
//! ├── example.com.key       # Domain private key (PEM, P-256)
//! └── example.com.crt       # Certificate chain (PEM)
//! ```

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use rustls::pki_types::CertificateDer;
use tracing::{debug, info, trace};

use crate::error::StorageError;

/// Account credentials file name
pub const ACCOUNT_FILE: &str = "acme_account.json";
/// Domain key file suffix
pub const KEY_SUFFIX: &str = ".key";
/// Certificate chain file suffix
pub const CERT_SUFFIX: &str = ".crt";

/// A certificate chain loaded from PEM, with the leaf's validity bounds
#[derive(Debug, Clone)]
pub struct CachedCertificate {
    /// PEM-encoded chain as stored on disk
    pub chain_pem: String,
    /// DER-encoded chain, leaf first
    pub chain: Vec<CertificateDer<'static>>,
    /// Leaf `notBefore`
    pub not_before: DateTime<Utc>,
    /// Leaf `notAfter`
    pub not_after: DateTime<Utc>,
}

impl CachedCertificate {
    /// Decode a PEM chain and read the leaf's validity period
    pub fn from_pem(chain_pem: &str) -> Result<Self, String> {
        let chain = rustls_pemfile::certs(&mut chain_pem.as_bytes())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("invalid PEM: {}", e))?;

        let leaf = chain
            .first()
            .ok_or_else(|| "no certificates in PEM data".to_string())?;

        let (_, cert) = x509_parser::parse_x509_certificate(leaf.as_ref())
            .map_err(|e| format!("invalid leaf certificate: {}", e))?;

        let validity = cert.validity();
        let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
            .ok_or_else(|| "notBefore out of range".to_string())?;
        let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
            .ok_or_else(|| "notAfter out of range".to_string())?;

        Ok(Self {
            chain_pem: chain_pem.to_string(),
            chain,
            not_before,
            not_after,
        })
    }
}

/// Filesystem cache for key material
///
/// The directory is assumed to have a single writer; concurrent managers
/// sharing one cache directory race on file writes.
#[derive(Debug, Clone)]
pub struct KeyMaterialStore {
    cache_dir: PathBuf,
}

impl KeyMaterialStore {
    /// Create a store rooted at `cache_dir`
    ///
    /// Nothing touches the filesystem until the first write.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Get the cache directory
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of the serialized account credentials
    pub fn account_path(&self) -> PathBuf {
        self.cache_dir.join(ACCOUNT_FILE)
    }

    /// Path of a domain's private key
    pub fn key_path(&self, domain: &str) -> PathBuf {
        self.cache_dir.join(format!("{}{}", domain, KEY_SUFFIX))
    }

    /// Path of a domain's certificate chain
    pub fn cert_path(&self, domain: &str) -> PathBuf {
        self.cache_dir.join(format!("{}{}", domain, CERT_SUFFIX))
    }

    // =========================================================================
    // Keys
    // =========================================================================

    /// Load a PEM P-256 key from `path`, generating and persisting one if absent
    ///
    /// The parent directory is created owner-only and the key file written
    /// owner read/write only. Any error other than "not found" is fatal.
    pub fn load_or_create_key(&self, path: &Path) -> Result<KeyPair, StorageError> {
        match fs::read_to_string(path) {
            Ok(pem) => {
                let key = KeyPair::from_pem(&pem).map_err(|e| StorageError::Malformed {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                trace!(path = %path.display(), "Loaded private key");
                Ok(key)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).map_err(|e| {
                    StorageError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        format!("failed to generate key: {}", e),
                    ))
                })?;
                write_private(path, key.serialize_pem().as_bytes())?;
                info!(path = %path.display(), "Generated new P-256 private key");
                Ok(key)
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    // =========================================================================
    // Certificates
    // =========================================================================

    /// Load a PEM certificate chain
    ///
    /// Fails with [`StorageError::NotFound`] when the file is absent and
    /// [`StorageError::Malformed`] when it cannot be decoded.
    pub fn load_certificate(&self, path: &Path) -> Result<CachedCertificate, StorageError> {
        let pem = match fs::read_to_string(path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound {
                    path: path.to_path_buf(),
                });
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let cert = CachedCertificate::from_pem(&pem).map_err(|reason| StorageError::Malformed {
            path: path.to_path_buf(),
            reason,
        })?;

        debug!(
            path = %path.display(),
            not_after = %cert.not_after,
            "Loaded cached certificate"
        );

        Ok(cert)
    }

    /// Persist a PEM certificate chain
    ///
    /// Written to a temporary file in the same directory and renamed into
    /// place, so a reader sees either the old chain or the new one.
    pub fn save_certificate(&self, path: &Path, chain_pem: &str) -> Result<(), StorageError> {
        write_private(path, chain_pem.as_bytes())?;
        info!(path = %path.display(), "Saved certificate chain");
        Ok(())
    }

    // =========================================================================
    // Account
    // =========================================================================

    /// Load the serialized account credentials, if any
    pub fn load_account_json(&self) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.account_path()) {
            Ok(json) => Ok(Some(json)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    /// Save the serialized account credentials
    pub fn save_account_json(&self, json: &str) -> Result<(), StorageError> {
        write_private(&self.account_path(), json.as_bytes())?;
        info!("Saved ACME account credentials");
        Ok(())
    }
}

/// Create `path`'s parent directory (0700) if missing
fn ensure_parent(path: &Path) -> Result<PathBuf, StorageError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };

    if !dir.exists() {
        fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        }

        debug!(dir = %dir.display(), "Created cache directory");
    }

    Ok(dir)
}

/// Atomically write an owner read/write only file
fn write_private(path: &Path, contents: &[u8]) -> Result<(), StorageError> {
    let dir = ensure_parent(path)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(contents)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
    }

    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn self_signed(key: &KeyPair, days: i64) -> String {
        let mut params = rcgen::CertificateParams::new(vec!["example.com".to_string()]).unwrap();
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(days);
        params.self_signed(key).unwrap().pem()
    }

    #[test]
    fn test_paths() {
        let store = KeyMaterialStore::new("/var/lib/autocert");
        assert_eq!(
            store.account_path(),
            PathBuf::from("/var/lib/autocert/acme_account.json")
        );
        assert_eq!(
            store.key_path("example.com"),
            PathBuf::from("/var/lib/autocert/example.com.key")
        );
        assert_eq!(
            store.cert_path("example.com"),
            PathBuf::from("/var/lib/autocert/example.com.crt")
        );
    }

    #[test]
    fn test_key_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::new(dir.path().join("nested"));
        let path = store.key_path("example.com");

        let created = store.load_or_create_key(&path).unwrap();
        let loaded = store.load_or_create_key(&path).unwrap();

        assert_eq!(created.serialize_der(), loaded.serialize_der());
        assert_eq!(created.public_key_raw(), loaded.public_key_raw());
        assert!(loaded.is_compatible(&rcgen::PKCS_ECDSA_P256_SHA256));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let cache = dir.path().join("cache");
        let store = KeyMaterialStore::new(&cache);
        let path = store.key_path("example.com");
        store.load_or_create_key(&path).unwrap();

        let dir_mode = fs::metadata(&cache).unwrap().permissions().mode() & 0o777;
        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }

    #[test]
    fn test_malformed_key_is_not_replaced() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::new(dir.path());
        let path = store.key_path("example.com");
        fs::write(&path, "not a key").unwrap();

        let err = store.load_or_create_key(&path).unwrap_err();
        assert!(matches!(err, StorageError::Malformed { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "not a key");
    }

    #[test]
    fn test_certificate_not_found_vs_malformed() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::new(dir.path());
        let path = store.cert_path("example.com");

        let err = store.load_certificate(&path).unwrap_err();
        assert!(err.is_not_found());

        fs::write(&path, "-----BEGIN GARBAGE-----\n").unwrap();
        let err = store.load_certificate(&path).unwrap_err();
        assert!(matches!(err, StorageError::Malformed { .. }));
    }

    #[test]
    fn test_certificate_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::new(dir.path());
        let key = store
            .load_or_create_key(&store.key_path("example.com"))
            .unwrap();
        let pem = self_signed(&key, 30);

        let path = store.cert_path("example.com");
        store.save_certificate(&path, &pem).unwrap();
        let cert = store.load_certificate(&path).unwrap();

        assert_eq!(cert.chain.len(), 1);
        assert_eq!(cert.chain_pem, pem);
        let remaining = cert.not_after - Utc::now();
        assert!(remaining > chrono::Duration::days(29));
        assert!(remaining <= chrono::Duration::days(30));
        assert!(cert.not_before < Utc::now());
    }

    #[test]
    fn test_save_replaces_existing_chain() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::new(dir.path());
        let key = store
            .load_or_create_key(&store.key_path("example.com"))
            .unwrap();
        let path = store.cert_path("example.com");

        store.save_certificate(&path, &self_signed(&key, 10)).unwrap();
        store.save_certificate(&path, &self_signed(&key, 90)).unwrap();

        let cert = store.load_certificate(&path).unwrap();
        assert!(cert.not_after - Utc::now() > chrono::Duration::days(80));

        // Only the final file remains; no temp files linger
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_account_json() {
        let dir = TempDir::new().unwrap();
        let store = KeyMaterialStore::new(dir.path());

        assert!(store.load_account_json().unwrap().is_none());
        store.save_account_json(r#"{"id":"acct"}"#).unwrap();
        assert_eq!(
            store.load_account_json().unwrap().as_deref(),
            Some(r#"{"id":"acct"}"#)
        );
    }
}
