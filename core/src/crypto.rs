use crate::types::KdfParams;
use crate::{Error, Result};
use argon2::Argon2;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Bytes added to every sealed object: nonce plus Poly1305 tag.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

pub struct MasterKey {
    key: Vec<u8>,
}

impl MasterKey {
    /// Stretches a password with Argon2id.
    pub fn derive_from_password(password: &str, params: &KdfParams) -> Result<Self> {
        if params.algorithm != "argon2id" {
            return Err(Error::Encryption(format!(
                "unsupported key derivation: {}",
                params.algorithm
            )));
        }
        let argon2 = Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            argon2::Params::new(
                params.memory,
                params.iterations,
                params.parallelism,
                Some(KEY_LEN),
            )
            .map_err(|e| Error::Encryption(e.to_string()))?,
        );

        let mut key = vec![0u8; KEY_LEN];
        argon2
            .hash_password_into(password.as_bytes(), &params.salt, &mut key)
            .map_err(|e| Error::Encryption(e.to_string()))?;

        Ok(Self { key })
    }

    pub fn generate() -> Self {
        let mut key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self { key }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.key
    }
}

pub struct Encryptor {
    cipher: ChaCha20Poly1305,
}

impl Encryptor {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(Error::Encryption("Key must be 32 bytes".to_string()));
        }

        let key = Key::from_slice(key);
        let cipher = ChaCha20Poly1305::new(key);
        Ok(Self { cipher })
    }

    /// Encrypts `plaintext`, authenticating `aad` alongside it.
    /// Output layout: `nonce || ciphertext || tag`.
    pub fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| Error::Encryption(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    /// Verifies and decrypts. Any tampering with the nonce, ciphertext, tag or
    /// `aad` fails without yielding plaintext.
    pub fn open(&self, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(Error::Encryption("Ciphertext too short".to_string()));
        }

        let (nonce_bytes, encrypted) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, Payload { msg: encrypted, aad })
            .map_err(|e| Error::Encryption(e.to_string()))
    }
}

/// The password marker: a random data key sealed under the password-derived key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyFile {
    pub created: chrono::DateTime<chrono::Utc>,
    pub hostname: String,
    pub kdf_params: KdfParams,
    pub encrypted_key: Vec<u8>,
}

const KEY_FILE_AAD: &[u8] = b"snapvault-key";

impl KeyFile {
    pub fn create(password: &str, data_key: &MasterKey, kdf_params: KdfParams) -> Result<Self> {
        let master_key = MasterKey::derive_from_password(password, &kdf_params)?;
        let key_encryptor = Encryptor::new(master_key.as_bytes())?;
        let encrypted_key = key_encryptor.seal(data_key.as_bytes(), KEY_FILE_AAD)?;

        Ok(Self {
            created: chrono::Utc::now(),
            hostname: crate::snapshot::local_hostname(),
            kdf_params,
            encrypted_key,
        })
    }

    /// Recovers the data key; a wrong password is reported as `InvalidPassword`.
    pub fn unlock(&self, password: &str) -> Result<Encryptor> {
        let master_key = MasterKey::derive_from_password(password, &self.kdf_params)?;
        let key_encryptor = Encryptor::new(master_key.as_bytes())?;
        let data_key = key_encryptor
            .open(&self.encrypted_key, KEY_FILE_AAD)
            .map_err(|_| Error::InvalidPassword)?;
        Encryptor::new(&data_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap_kdf() -> KdfParams {
        KdfParams::with_cost(1024, 1, 1)
    }

    #[test]
    fn test_encryption_roundtrip() {
        let key = MasterKey::generate();
        let encryptor = Encryptor::new(key.as_bytes()).unwrap();

        let plaintext = b"Hello, snapvault!";
        let ciphertext = encryptor.seal(plaintext, &[]).unwrap();
        let decrypted = encryptor.open(&ciphertext, &[]).unwrap();

        assert_eq!(plaintext.to_vec(), decrypted);
        assert_eq!(ciphertext.len(), plaintext.len() + SEAL_OVERHEAD);
    }

    #[test]
    fn test_tamper_and_wrong_aad_rejected() {
        let key = MasterKey::generate();
        let encryptor = Encryptor::new(key.as_bytes()).unwrap();

        let mut sealed = encryptor.seal(b"payload", b"blob-a").unwrap();
        assert!(encryptor.open(&sealed, b"blob-b").is_err());

        sealed[NONCE_LEN + 1] ^= 0x01;
        assert!(encryptor.open(&sealed, b"blob-a").is_err());
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let params = cheap_kdf();
        let a = MasterKey::derive_from_password("pw123", &params).unwrap();
        let b = MasterKey::derive_from_password("pw123", &params).unwrap();
        let c = MasterKey::derive_from_password("pw124", &params).unwrap();

        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_key_file_unlock() {
        let data_key = MasterKey::generate();
        let key_file = KeyFile::create("pw123", &data_key, cheap_kdf()).unwrap();

        let encryptor = key_file.unlock("pw123").unwrap();
        let reference = Encryptor::new(data_key.as_bytes()).unwrap();
        let sealed = reference.seal(b"marker", b"").unwrap();
        assert_eq!(encryptor.open(&sealed, b"").unwrap(), b"marker");

        assert!(matches!(key_file.unlock("wrong"), Err(Error::InvalidPassword)));
    }
}
