//! Block encryption
//!
//! AES-CBC with PKCS#7 padding. The data key and a separate HMAC key are
//! derived with PBKDF2-HMAC-SHA256 from the passphrase and the per-bucket
//! salt persisted in the store parameter object. The IV is derived
//! deterministically from the block index, so rewriting a block never
//! reuses an IV with different data under a different key, and there is
//! nothing extra to store. An HMAC-SHA256 over the index and ciphertext
//! is appended and verified before decryption.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use s3bd_common::{Error, KeyLength, Result};

type HmacSha256 = Hmac<Sha256>;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// PBKDF2 iteration count
const PBKDF2_ROUNDS: u32 = 10_000;

/// Appended authentication tag length
const MAC_LEN: usize = 32;

/// AES block / IV length
const IV_LEN: usize = 16;

/// Cipher selection, named as persisted in object metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherSuite {
    Aes128Cbc,
    Aes256Cbc,
}

impl CipherSuite {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Aes128Cbc => "aes-128-cbc",
            Self::Aes256Cbc => "aes-256-cbc",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "aes-128-cbc" => Ok(Self::Aes128Cbc),
            "aes-256-cbc" => Ok(Self::Aes256Cbc),
            other => Err(Error::config(format!("unknown cipher {other:?}"))),
        }
    }

    fn key_len(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes256Cbc => 32,
        }
    }
}

impl From<KeyLength> for CipherSuite {
    fn from(k: KeyLength) -> Self {
        match k {
            KeyLength::Aes128 => Self::Aes128Cbc,
            KeyLength::Aes256 => Self::Aes256Cbc,
        }
    }
}

/// Per-store encryptor/decryptor
#[derive(Debug)]
pub struct BlockCrypter {
    suite: CipherSuite,
    key: Vec<u8>,
    hmac_key: [u8; 32],
}

impl BlockCrypter {
    /// Derive keys from the passphrase and the per-bucket salt.
    #[must_use]
    pub fn new(password: &str, salt: &[u8], suite: CipherSuite) -> Self {
        let key_len = suite.key_len();
        let mut derived = vec![0u8; key_len + 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut derived);
        let mut hmac_key = [0u8; 32];
        hmac_key.copy_from_slice(&derived[key_len..]);
        Self {
            suite,
            key: derived[..key_len].to_vec(),
            hmac_key,
        }
    }

    #[must_use]
    pub fn suite(&self) -> CipherSuite {
        self.suite
    }

    /// Deterministic IV for a block index
    fn iv(&self, idx: u64) -> [u8; IV_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).expect("any key size");
        mac.update(b"s3bd-iv");
        mac.update(&idx.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&digest[..IV_LEN]);
        iv
    }

    fn tag(&self, idx: u64, ciphertext: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).expect("any key size");
        mac.update(&idx.to_be_bytes());
        mac.update(ciphertext);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; MAC_LEN];
        tag.copy_from_slice(&digest);
        tag
    }

    /// Encrypt a payload for block `idx`: ciphertext followed by the tag.
    #[must_use]
    pub fn encrypt(&self, idx: u64, plaintext: &[u8]) -> Vec<u8> {
        let iv = self.iv(idx);
        let mut out = match self.suite {
            CipherSuite::Aes128Cbc => Aes128CbcEnc::new_from_slices(&self.key, &iv)
                .expect("derived key and IV have fixed lengths")
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            CipherSuite::Aes256Cbc => Aes256CbcEnc::new_from_slices(&self.key, &iv)
                .expect("derived key and IV have fixed lengths")
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
        };
        let tag = self.tag(idx, &out);
        out.extend_from_slice(&tag);
        out
    }

    /// Verify and decrypt a stored payload for block `idx`.
    pub fn decrypt(&self, idx: u64, stored: &[u8]) -> Result<Vec<u8>> {
        if stored.len() < MAC_LEN + IV_LEN {
            return Err(Error::integrity(format!(
                "encrypted block {idx} is too short ({} bytes)",
                stored.len()
            )));
        }
        let (ciphertext, tag) = stored.split_at(stored.len() - MAC_LEN);

        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).expect("any key size");
        mac.update(&idx.to_be_bytes());
        mac.update(ciphertext);
        mac.verify_slice(tag)
            .map_err(|_| Error::integrity(format!("HMAC verification failed for block {idx}")))?;

        let iv = self.iv(idx);
        let plaintext = match self.suite {
            CipherSuite::Aes128Cbc => Aes128CbcDec::new_from_slices(&self.key, &iv)
                .expect("derived key and IV have fixed lengths")
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
            CipherSuite::Aes256Cbc => Aes256CbcDec::new_from_slices(&self.key, &iv)
                .expect("derived key and IV have fixed lengths")
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext),
        }
        .map_err(|_| Error::integrity(format!("padding check failed for block {idx}")))?;
        Ok(plaintext)
    }

    /// Authenticate arbitrary bytes with the store's HMAC key. Used for
    /// the parameter object.
    #[must_use]
    pub fn authenticate(&self, data: &[u8]) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.hmac_key).expect("any key size");
        mac.update(data);
        let digest = mac.finalize().into_bytes();
        let mut tag = [0u8; MAC_LEN];
        tag.copy_from_slice(&digest);
        tag
    }
}
