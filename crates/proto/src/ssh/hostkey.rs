//! SSH public keys and signatures (RFC 4253 Section 6.6).
//!
//! The client verifies server host key signatures for:
//!
//! - `ssh-ed25519` (RFC 8709)
//! - `ecdsa-sha2-nistp256` (RFC 5656)
//! - `rsa-sha2-512` and `rsa-sha2-256` (RFC 8332)
//!
//! [`PublicHostKey`] parses a key blob and checks a signature blob against it.
//! [`Ed25519KeyPair`] is the one signing key type, used both for client
//! public-key authentication and by test servers to sign the exchange hash.
//!
//! # Example
//!
//! ```rust
//! use wisp_proto::ssh::hostkey::{Ed25519KeyPair, KeyPair, PublicHostKey};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let key = Ed25519KeyPair::generate();
//! let signature = key.sign(b"exchange hash")?;
//!
//! let public = PublicHostKey::from_blob(&key.public_key_blob())?;
//! public.verify("ssh-ed25519", b"exchange hash", &signature)?;
//! assert!(public.fingerprint().starts_with("SHA256:"));
//! # Ok(())
//! # }
//! ```

use crate::ssh::wire::{put_string, read_mpint, read_string, read_utf8};
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use bytes::BytesMut;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH};
use ring::signature::{
    RsaPublicKeyComponents, UnparsedPublicKey, ECDSA_P256_SHA256_FIXED,
    RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_2048_8192_SHA512,
};
use sha2::{Digest, Sha256};
use wisp_platform::{WispError, WispResult};
use zeroize::Zeroizing;

/// Host key signature algorithm identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    /// ssh-ed25519
    SshEd25519,
    /// ecdsa-sha2-nistp256
    EcdsaSha2Nistp256,
    /// rsa-sha2-256
    RsaSha2_256,
    /// rsa-sha2-512
    RsaSha2_512,
}

impl HostKeyAlgorithm {
    /// Get the algorithm name as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::RsaSha2_256 => "rsa-sha2-256",
            HostKeyAlgorithm::RsaSha2_512 => "rsa-sha2-512",
        }
    }

    /// Parse algorithm from name
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ssh-ed25519" => Some(HostKeyAlgorithm::SshEd25519),
            "ecdsa-sha2-nistp256" => Some(HostKeyAlgorithm::EcdsaSha2Nistp256),
            "rsa-sha2-256" => Some(HostKeyAlgorithm::RsaSha2_256),
            "rsa-sha2-512" => Some(HostKeyAlgorithm::RsaSha2_512),
            _ => None,
        }
    }

    /// Key type carried in the public key blob for this algorithm
    pub fn key_type(&self) -> &'static str {
        match self {
            HostKeyAlgorithm::SshEd25519 => "ssh-ed25519",
            HostKeyAlgorithm::EcdsaSha2Nistp256 => "ecdsa-sha2-nistp256",
            HostKeyAlgorithm::RsaSha2_256 | HostKeyAlgorithm::RsaSha2_512 => "ssh-rsa",
        }
    }
}

fn bad_key(msg: impl Into<String>) -> WispError {
    WispError::HostKeyVerificationFailed(msg.into())
}

/// A parsed server public key.
#[derive(Clone, PartialEq, Eq)]
pub enum PublicHostKey {
    /// ssh-ed25519 (32-byte point)
    Ed25519([u8; 32]),
    /// ecdsa-sha2-nistp256 (uncompressed SEC1 point)
    EcdsaP256(Vec<u8>),
    /// ssh-rsa (public exponent, modulus)
    Rsa {
        /// Public exponent
        e: Vec<u8>,
        /// Modulus
        n: Vec<u8>,
    },
}

impl PublicHostKey {
    /// Parses an SSH public key blob.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] for truncated blobs and
    /// [`WispError::HostKeyVerificationFailed`] for unsupported key types.
    pub fn from_blob(blob: &[u8]) -> WispResult<Self> {
        let mut offset = 0;
        let key_type = read_utf8(blob, &mut offset)?;

        let key = match key_type.as_str() {
            "ssh-ed25519" => {
                let point = read_string(blob, &mut offset)?;
                let point: [u8; 32] = point
                    .try_into()
                    .map_err(|_| bad_key("Ed25519 public key must be 32 bytes"))?;
                PublicHostKey::Ed25519(point)
            }
            "ecdsa-sha2-nistp256" => {
                let curve = read_utf8(blob, &mut offset)?;
                if curve != "nistp256" {
                    return Err(bad_key(format!("Unexpected ECDSA curve: {}", curve)));
                }
                let point = read_string(blob, &mut offset)?;
                if point.len() != 65 || point[0] != 0x04 {
                    return Err(bad_key("ECDSA P-256 key must be an uncompressed point"));
                }
                PublicHostKey::EcdsaP256(point.to_vec())
            }
            "ssh-rsa" => {
                let e = read_mpint(blob, &mut offset)?.to_vec();
                let n = read_mpint(blob, &mut offset)?.to_vec();
                PublicHostKey::Rsa { e, n }
            }
            other => return Err(bad_key(format!("Unsupported host key type: {}", other))),
        };

        if offset != blob.len() {
            return Err(WispError::ProtocolViolation(
                "Trailing bytes after public key".to_string(),
            ));
        }
        Ok(key)
    }

    /// Returns the key type name stored in the blob.
    pub fn key_type(&self) -> &'static str {
        match self {
            PublicHostKey::Ed25519(_) => "ssh-ed25519",
            PublicHostKey::EcdsaP256(_) => "ecdsa-sha2-nistp256",
            PublicHostKey::Rsa { .. } => "ssh-rsa",
        }
    }

    /// Encodes the key back into its blob form.
    pub fn to_blob(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        put_string(&mut buf, self.key_type().as_bytes());
        match self {
            PublicHostKey::Ed25519(point) => put_string(&mut buf, point),
            PublicHostKey::EcdsaP256(point) => {
                put_string(&mut buf, b"nistp256");
                put_string(&mut buf, point);
            }
            PublicHostKey::Rsa { e, n } => {
                crate::ssh::wire::put_mpint(&mut buf, e);
                crate::ssh::wire::put_mpint(&mut buf, n);
            }
        }
        buf.to_vec()
    }

    /// Returns the OpenSSH-style fingerprint (`SHA256:<base64>`).
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.to_blob())
    }

    /// Verifies `signature_blob` over `data` using the negotiated `algorithm`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::HostKeyVerificationFailed`] if the algorithm does
    /// not match the key, or the signature is invalid.
    pub fn verify(&self, algorithm: &str, data: &[u8], signature_blob: &[u8]) -> WispResult<()> {
        let expected = HostKeyAlgorithm::from_name(algorithm)
            .ok_or_else(|| bad_key(format!("Unsupported signature algorithm: {}", algorithm)))?;
        if expected.key_type() != self.key_type() {
            return Err(bad_key(format!(
                "Algorithm {} does not match {} key",
                algorithm,
                self.key_type()
            )));
        }

        let mut offset = 0;
        let sig_algorithm = read_utf8(signature_blob, &mut offset)?;
        if sig_algorithm != algorithm {
            return Err(bad_key(format!(
                "Signature uses {}, expected {}",
                sig_algorithm, algorithm
            )));
        }
        let signature = read_string(signature_blob, &mut offset)?;

        match (self, expected) {
            (PublicHostKey::Ed25519(point), _) => {
                let key = VerifyingKey::from_bytes(point)
                    .map_err(|e| bad_key(format!("Invalid Ed25519 public key: {}", e)))?;
                let signature: [u8; 64] = signature
                    .try_into()
                    .map_err(|_| bad_key("Ed25519 signature must be 64 bytes"))?;
                key.verify(data, &Signature::from_bytes(&signature))
                    .map_err(|_| bad_key("Ed25519 signature verification failed"))
            }
            (PublicHostKey::EcdsaP256(point), _) => {
                let mut inner = 0;
                let r = read_mpint(signature, &mut inner)?;
                let s = read_mpint(signature, &mut inner)?;
                if r.len() > 32 || s.len() > 32 {
                    return Err(bad_key("ECDSA signature component too long"));
                }
                let mut fixed = [0u8; 64];
                fixed[32 - r.len()..32].copy_from_slice(r);
                fixed[64 - s.len()..].copy_from_slice(s);

                UnparsedPublicKey::new(&ECDSA_P256_SHA256_FIXED, point)
                    .verify(data, &fixed)
                    .map_err(|_| bad_key("ECDSA signature verification failed"))
            }
            (PublicHostKey::Rsa { e, n }, algorithm) => {
                let params = if algorithm == HostKeyAlgorithm::RsaSha2_512 {
                    &RSA_PKCS1_2048_8192_SHA512
                } else {
                    &RSA_PKCS1_2048_8192_SHA256
                };
                RsaPublicKeyComponents { n, e }
                    .verify(params, data, signature)
                    .map_err(|_| bad_key("RSA signature verification failed"))
            }
        }
    }
}

impl std::fmt::Debug for PublicHostKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicHostKey")
            .field("type", &self.key_type())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Computes `SHA256:<base64>` over a public key blob.
pub fn fingerprint(blob: &[u8]) -> String {
    format!("SHA256:{}", STANDARD_NO_PAD.encode(Sha256::digest(blob)))
}

/// A private key that can sign in SSH wire format.
pub trait KeyPair: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> HostKeyAlgorithm;

    /// Get the public key blob (`string type, ...`)
    fn public_key_blob(&self) -> Vec<u8>;

    /// Sign data and return the signature blob (`string alg, string sig`)
    fn sign(&self, data: &[u8]) -> WispResult<Vec<u8>>;
}

/// Ed25519 key pair (ssh-ed25519)
#[derive(Clone)]
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret: Zeroizing<[u8; SECRET_KEY_LENGTH]> =
            Zeroizing::new(rand::Rng::gen(&mut rand::thread_rng()));
        Self {
            signing_key: SigningKey::from_bytes(&secret),
        }
    }

    /// Create from the 32-byte seed
    ///
    /// # Errors
    ///
    /// Returns [`WispError::InvalidParameters`] if `seed` is not 32 bytes.
    pub fn from_seed(seed: &[u8]) -> WispResult<Self> {
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(seed.try_into().map_err(|_| {
            WispError::InvalidParameters("Ed25519 secret key must be 32 bytes".to_string())
        })?);
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Raw 32-byte public key
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The 32-byte seed. Exposes private key material.
    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }
}

impl KeyPair for Ed25519KeyPair {
    fn algorithm(&self) -> HostKeyAlgorithm {
        HostKeyAlgorithm::SshEd25519
    }

    fn public_key_blob(&self) -> Vec<u8> {
        PublicHostKey::Ed25519(self.public_key()).to_blob()
    }

    fn sign(&self, data: &[u8]) -> WispResult<Vec<u8>> {
        let signature = self.signing_key.sign(data);

        let mut buf = BytesMut::new();
        put_string(&mut buf, b"ssh-ed25519");
        put_string(&mut buf, &signature.to_bytes());
        Ok(buf.to_vec())
    }
}

impl std::fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ring::rand::SystemRandom;
    use ring::signature::{EcdsaKeyPair, KeyPair as _, ECDSA_P256_SHA256_FIXED_SIGNING};

    #[test]
    fn test_algorithm_from_name() {
        for alg in [
            HostKeyAlgorithm::SshEd25519,
            HostKeyAlgorithm::EcdsaSha2Nistp256,
            HostKeyAlgorithm::RsaSha2_256,
            HostKeyAlgorithm::RsaSha2_512,
        ] {
            assert_eq!(HostKeyAlgorithm::from_name(alg.name()), Some(alg));
        }
        assert_eq!(HostKeyAlgorithm::from_name("ssh-dss"), None);
        assert_eq!(HostKeyAlgorithm::RsaSha2_512.key_type(), "ssh-rsa");
    }

    #[test]
    fn test_ed25519_sign_verify() {
        let key = Ed25519KeyPair::generate();
        let signature = key.sign(b"data to sign").unwrap();
        let public = PublicHostKey::from_blob(&key.public_key_blob()).unwrap();

        public.verify("ssh-ed25519", b"data to sign", &signature).unwrap();
        assert!(matches!(
            public.verify("ssh-ed25519", b"wrong data", &signature),
            Err(WispError::HostKeyVerificationFailed(_))
        ));
    }

    #[test]
    fn test_ed25519_from_seed_is_deterministic() {
        let a = Ed25519KeyPair::from_seed(&[9u8; 32]).unwrap();
        let b = Ed25519KeyPair::from_seed(&[9u8; 32]).unwrap();
        assert_eq!(a.public_key(), b.public_key());
        assert!(Ed25519KeyPair::from_seed(&[0u8; 31]).is_err());
    }

    #[test]
    fn test_algorithm_mismatch_rejected() {
        let key = Ed25519KeyPair::generate();
        let signature = key.sign(b"h").unwrap();
        let public = PublicHostKey::from_blob(&key.public_key_blob()).unwrap();

        assert!(public.verify("rsa-sha2-256", b"h", &signature).is_err());
    }

    fn ecdsa_signature_blob(raw: &[u8]) -> Vec<u8> {
        let mut inner = BytesMut::new();
        crate::ssh::wire::put_mpint(&mut inner, &raw[..32]);
        crate::ssh::wire::put_mpint(&mut inner, &raw[32..]);

        let mut blob = BytesMut::new();
        put_string(&mut blob, b"ecdsa-sha2-nistp256");
        put_string(&mut blob, &inner);
        blob.to_vec()
    }

    #[test]
    fn test_ecdsa_p256_verify() {
        let rng = SystemRandom::new();
        let pkcs8 = EcdsaKeyPair::generate_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, &rng).unwrap();
        let pair =
            EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8.as_ref(), &rng)
                .unwrap();

        let mut blob = BytesMut::new();
        put_string(&mut blob, b"ecdsa-sha2-nistp256");
        put_string(&mut blob, b"nistp256");
        put_string(&mut blob, pair.public_key().as_ref());
        let public = PublicHostKey::from_blob(&blob).unwrap();
        assert_eq!(public.to_blob(), blob.to_vec());

        let raw = pair.sign(&rng, b"exchange hash").unwrap();
        let signature = ecdsa_signature_blob(raw.as_ref());
        public
            .verify("ecdsa-sha2-nistp256", b"exchange hash", &signature)
            .unwrap();
        assert!(public
            .verify("ecdsa-sha2-nistp256", b"other hash", &signature)
            .is_err());
    }

    #[test]
    fn test_rsa_blob_round_trip_and_bad_signature() {
        let mut blob = BytesMut::new();
        put_string(&mut blob, b"ssh-rsa");
        crate::ssh::wire::put_mpint(&mut blob, &[0x01, 0x00, 0x01]);
        crate::ssh::wire::put_mpint(&mut blob, &[0xc3; 256]);

        let public = PublicHostKey::from_blob(&blob).unwrap();
        assert_eq!(public.key_type(), "ssh-rsa");
        assert_eq!(public.to_blob(), blob.to_vec());

        let mut signature = BytesMut::new();
        put_string(&mut signature, b"rsa-sha2-512");
        put_string(&mut signature, &[0x55; 256]);
        assert!(public.verify("rsa-sha2-512", b"h", &signature).is_err());
    }

    #[test]
    fn test_unknown_key_type_rejected() {
        let mut blob = BytesMut::new();
        put_string(&mut blob, b"ssh-dss");
        put_string(&mut blob, &[0; 8]);
        assert!(matches!(
            PublicHostKey::from_blob(&blob),
            Err(WispError::HostKeyVerificationFailed(_))
        ));
    }

    #[test]
    fn test_fingerprint_format() {
        let key = Ed25519KeyPair::from_seed(&[1u8; 32]).unwrap();
        let fp = fingerprint(&key.public_key_blob());
        assert!(fp.starts_with("SHA256:"));
        assert_eq!(fp.len(), "SHA256:".len() + 43);
        assert!(!fp.ends_with('='));
    }
}
