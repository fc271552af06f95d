//! Participant identities
//!
//! An identity is an ed25519 key pair. Peers are named by the identity hash,
//! the first 16 bytes of the SHA-256 digest of the public key. Identity files
//! hold the 32-byte secret key as hex and are generated on first use.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::ConfigError;
use crate::types::{DestinationHash, IdentityHash};

pub use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

/// A local identity, including the secret key
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    hash: IdentityHash,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild an identity from its secret key bytes
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let hash = IdentityHash::from_public_key(signing_key.verifying_key().as_bytes());
        Self { signing_key, hash }
    }

    /// Load an identity file, generating and saving a new identity if it is missing
    pub fn load_or_generate(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            return Self::load(path);
        }

        let identity = Self::generate();
        identity.save(path)?;
        info!("Generated new identity {} at {}", identity.hash(), path.display());
        Ok(identity)
    }

    /// Load an identity file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let err = |reason: String| ConfigError::Identity {
            path: path.to_path_buf(),
            reason,
        };

        let content = std::fs::read_to_string(path).map_err(|e| err(e.to_string()))?;
        let mut secret = [0u8; 32];
        hex::decode_to_slice(content.trim(), &mut secret)
            .map_err(|e| err(format!("expected 64 hex characters: {}", e)))?;

        Ok(Self::from_secret_bytes(&secret))
    }

    /// Save the secret key to a file readable only by the owner
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let err = |e: std::io::Error| ConfigError::Identity {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(err)?;
            }
        }

        let content = format!("{}\n", hex::encode(self.signing_key.to_bytes()));

        #[cfg(unix)]
        {
            use std::io::Write;
            use std::os::unix::fs::OpenOptionsExt;

            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path)
                .map_err(err)?;
            file.write_all(content.as_bytes()).map_err(err)?;
        }

        #[cfg(not(unix))]
        std::fs::write(path, content).map_err(err)?;

        Ok(())
    }

    /// The identity hash
    pub fn hash(&self) -> IdentityHash {
        self.hash
    }

    /// The public key bytes
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Destination for a service under this identity
    pub fn destination(&self, service: &str) -> DestinationHash {
        DestinationHash::derive(service, &self.hash)
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("hash", &self.hash)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Check a signature made by the holder of `public_key`
pub fn verify_signature(
    public_key: &[u8; PUBLIC_KEY_LENGTH],
    message: &[u8],
    signature: &[u8; SIGNATURE_LENGTH],
) -> bool {
    let Ok(key) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}

/// Default identity file location
pub fn default_identity_path(listener: bool) -> PathBuf {
    let name = if listener {
        "identity_listener"
    } else {
        "identity"
    };
    crate::config::default_config_dir().join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_matches_public_key() {
        let identity = Identity::generate();
        assert_eq!(
            identity.hash(),
            IdentityHash::from_public_key(&identity.public_key())
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = Identity::generate();
        let signature = identity.sign(b"challenge");

        assert!(verify_signature(&identity.public_key(), b"challenge", &signature));
        assert!(!verify_signature(&identity.public_key(), b"other", &signature));

        let stranger = Identity::generate();
        assert!(!verify_signature(&stranger.public_key(), b"challenge", &signature));
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identity");

        let first = Identity::load_or_generate(&path).unwrap();
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.hash(), second.hash());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity");
        std::fs::write(&path, "not hex").unwrap();

        assert!(matches!(
            Identity::load(&path),
            Err(ConfigError::Identity { .. })
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let identity = Identity::from_secret_bytes(&[9u8; 32]);
        let debug = format!("{:?}", identity);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode([9u8; 32])));
    }
}
