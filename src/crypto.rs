//! Protocol encryption, hashing and key-derivation primitives.
//! AES-128-ECB for v3.1/v3.3/v3.4 payloads, AES-128-GCM for v3.5,
//! HMAC-SHA256 trailers, CRC32 checksums and the legacy MD5 signing hash.

use crate::error::{Result, TuyaError};
use crate::protocol::Version;
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::block_padding::{NoPadding, Pkcs7};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use crc::{CRC_32_ISO_HDLC, Crc};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use rand::RngCore;
use sha2::Sha256;

type EcbEnc = ecb::Encryptor<Aes128>;
type EcbDec = ecb::Decryptor<Aes128>;
type HmacSha256 = Hmac<Sha256>;

/// GCM nonce length on the wire (v3.5 frames carry it before the ciphertext).
pub const GCM_NONCE_LEN: usize = 12;
/// GCM authentication tag length, appended to the ciphertext.
pub const GCM_TAG_LEN: usize = 16;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// AES-128 cipher bound to a 16-byte key, covering both the ECB and GCM
/// modes used by the wire protocol.
pub struct Cipher {
    key: [u8; 16],
    gcm: Aes128Gcm,
}

impl Cipher {
    /// Create a cipher from a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 16 {
            return Err(TuyaError::InvalidKeyLength);
        }
        let mut k = [0u8; 16];
        k.copy_from_slice(key);
        let gcm = Aes128Gcm::new(&k.into());
        Ok(Self { key: k, gcm })
    }

    /// AES-128-ECB encryption. With `pad` the input is PKCS#7 padded,
    /// otherwise its length must already be a multiple of the block size.
    pub fn ecb_encrypt(&self, data: &[u8], pad: bool) -> Result<Vec<u8>> {
        let enc = EcbEnc::new(&self.key.into());
        if pad {
            Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(data))
        } else {
            if !data.len().is_multiple_of(16) {
                return Err(TuyaError::EncryptionFailed);
            }
            Ok(enc.encrypt_padded_vec_mut::<NoPadding>(data))
        }
    }

    /// AES-128-ECB decryption. With `padded` the PKCS#7 padding is validated
    /// and stripped; a bad padding byte sequence is rejected.
    pub fn ecb_decrypt(&self, data: &[u8], padded: bool) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(TuyaError::InvalidPadding);
        }
        let dec = EcbDec::new(&self.key.into());
        if padded {
            dec.decrypt_padded_vec_mut::<Pkcs7>(data)
                .map_err(|_| TuyaError::InvalidPadding)
        } else {
            dec.decrypt_padded_vec_mut::<NoPadding>(data)
                .map_err(|_| TuyaError::InvalidPadding)
        }
    }

    /// AES-128-GCM encryption with additional authenticated data.
    /// Returns `nonce || ciphertext || tag`. A random 12-byte nonce is
    /// generated when none is supplied.
    pub fn gcm_encrypt(&self, plaintext: &[u8], aad: &[u8], nonce: Option<&[u8]>) -> Result<Vec<u8>> {
        let nonce_bytes: [u8; GCM_NONCE_LEN] = match nonce {
            Some(n) if n.len() >= GCM_NONCE_LEN => {
                let mut b = [0u8; GCM_NONCE_LEN];
                b.copy_from_slice(&n[..GCM_NONCE_LEN]);
                b
            }
            Some(_) => return Err(TuyaError::EncryptionFailed),
            None => {
                let mut b = [0u8; GCM_NONCE_LEN];
                rand::rng().fill_bytes(&mut b);
                b
            }
        };

        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = self
            .gcm
            .encrypt(Nonce::from_slice(&nonce_bytes), payload)
            .map_err(|_| TuyaError::EncryptionFailed)?;

        let mut out = Vec::with_capacity(GCM_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// AES-128-GCM decryption. `data` is `ciphertext || tag`; fails closed on
    /// tag mismatch without returning any plaintext.
    pub fn gcm_decrypt(&self, nonce: &[u8], data: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() < GCM_NONCE_LEN || data.len() < GCM_TAG_LEN {
            return Err(TuyaError::AuthenticationFailed);
        }
        let payload = Payload { msg: data, aad };
        self.gcm
            .decrypt(Nonce::from_slice(&nonce[..GCM_NONCE_LEN]), payload)
            .map_err(|_| TuyaError::AuthenticationFailed)
    }
}

/// HMAC-SHA256 of `message` under `key`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Result<[u8; 32]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| TuyaError::InvalidKeyLength)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time HMAC-SHA256 verification.
pub fn hmac_sha256_verify(key: &[u8], message: &[u8], expected: &[u8]) -> Result<()> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| TuyaError::InvalidKeyLength)?;
    mac.update(message);
    mac.verify_slice(expected)
        .map_err(|_| TuyaError::HmacMismatch)
}

/// CRC32 (ISO-HDLC polynomial) as used by the device firmware.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// MD5 digest. Legacy, required only for the v3.1 signing scheme.
pub fn md5(message: &[u8]) -> [u8; 16] {
    Md5::digest(message).into()
}

/// Fresh random nonce for handshakes and GCM IVs.
pub fn random_nonce<const N: usize>() -> [u8; N] {
    let mut b = [0u8; N];
    rand::rng().fill_bytes(&mut b);
    b
}

/// Derive the post-negotiation session key from the two random contributions.
///
/// Both variants start from the byte-wise XOR of local and remote nonces.
/// v3.4 runs it through AES-ECB under the base key; v3.5 instead runs it
/// through AES-GCM with `local_nonce[..12]` as the nonce, keeping ciphertext
/// bytes only. No other variants exist on the wire.
pub fn derive_session_key(
    local_nonce: &[u8],
    remote_nonce: &[u8],
    base_key: &[u8],
    version: Version,
) -> Result<Vec<u8>> {
    if local_nonce.len() != 16 || remote_nonce.is_empty() {
        return Err(TuyaError::NegotiationFailed("bad nonce length".into()));
    }

    let xored: Vec<u8> = local_nonce
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ remote_nonce[i % remote_nonce.len()])
        .collect();

    let cipher = Cipher::new(base_key)?;
    match version {
        Version::V3_4 => cipher.ecb_encrypt(&xored, false),
        Version::V3_5 => {
            let out = cipher.gcm_encrypt(&xored, &[], Some(&local_nonce[..GCM_NONCE_LEN]))?;
            Ok(out[GCM_NONCE_LEN..GCM_NONCE_LEN + 16].to_vec())
        }
        _ => Err(TuyaError::NegotiationFailed(format!(
            "version {} does not negotiate session keys",
            version
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8; 16] = b"0123456789abcdef";

    #[test]
    fn ecb_roundtrip_padded() {
        let cipher = Cipher::new(KEY).unwrap();
        let plain = b"hello tuya device";
        let ct = cipher.ecb_encrypt(plain, true).unwrap();
        assert!(ct.len().is_multiple_of(16));
        assert_eq!(cipher.ecb_decrypt(&ct, true).unwrap(), plain);
    }

    #[test]
    fn ecb_unpadded_requires_block_multiple() {
        let cipher = Cipher::new(KEY).unwrap();
        assert!(matches!(
            cipher.ecb_encrypt(b"short", false),
            Err(TuyaError::EncryptionFailed)
        ));
        let ct = cipher.ecb_encrypt(&[0u8; 32], false).unwrap();
        assert_eq!(ct.len(), 32);
        assert_eq!(cipher.ecb_decrypt(&ct, false).unwrap(), vec![0u8; 32]);
    }

    #[test]
    fn ecb_bad_padding_rejected() {
        let cipher = Cipher::new(KEY).unwrap();
        let mut ct = cipher.ecb_encrypt(b"some payload bytes", true).unwrap();
        // Corrupt the last block so the padding no longer validates.
        let last = ct.len() - 1;
        ct[last] ^= 0xff;
        assert!(matches!(
            cipher.ecb_decrypt(&ct, true),
            Err(TuyaError::InvalidPadding)
        ));
    }

    #[test]
    fn gcm_roundtrip_with_aad() {
        let cipher = Cipher::new(KEY).unwrap();
        let aad = b"header-bytes";
        let out = cipher.gcm_encrypt(b"secret", aad, None).unwrap();
        let (nonce, ct) = out.split_at(GCM_NONCE_LEN);
        assert_eq!(cipher.gcm_decrypt(nonce, ct, aad).unwrap(), b"secret");
    }

    #[test]
    fn gcm_fails_closed_on_tamper() {
        let cipher = Cipher::new(KEY).unwrap();
        let mut out = cipher.gcm_encrypt(b"secret", b"aad", None).unwrap();
        let last = out.len() - 1;
        out[last] ^= 0x01; // flip one tag bit
        let (nonce, ct) = out.split_at(GCM_NONCE_LEN);
        assert!(matches!(
            cipher.gcm_decrypt(nonce, ct, b"aad"),
            Err(TuyaError::AuthenticationFailed)
        ));
        // Wrong AAD must also fail.
        let good = cipher.gcm_encrypt(b"secret", b"aad", None).unwrap();
        let (nonce, ct) = good.split_at(GCM_NONCE_LEN);
        assert!(cipher.gcm_decrypt(nonce, ct, b"other").is_err());
    }

    #[test]
    fn crc32_reference_vector() {
        // ISO-HDLC check value
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }

    #[test]
    fn md5_reference_vector() {
        assert_eq!(
            hex::encode(md5(b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }

    #[test]
    fn hmac_sha256_reference_vector() {
        // RFC 4231 test case 2
        let digest = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(digest),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
        assert!(hmac_sha256_verify(b"Jefe", b"what do ya want for nothing?", &digest).is_ok());
        assert!(matches!(
            hmac_sha256_verify(b"Jefe", b"tampered", &digest),
            Err(TuyaError::HmacMismatch)
        ));
    }

    #[test]
    fn session_key_derivation_v34() {
        let local = [0x11u8; 16];
        let remote = [0x22u8; 16];
        let derived = derive_session_key(&local, &remote, KEY, Version::V3_4).unwrap();

        // Reference: AES-ECB(base_key) over the XOR of the nonces.
        let xored: Vec<u8> = local.iter().zip(remote.iter()).map(|(a, b)| a ^ b).collect();
        let reference = Cipher::new(KEY).unwrap().ecb_encrypt(&xored, false).unwrap();
        assert_eq!(derived, reference);
        assert_eq!(derived.len(), 16);
    }

    #[test]
    fn session_key_derivation_v35() {
        let local = [0x31u8; 16];
        let remote = [0x47u8; 16];
        let derived = derive_session_key(&local, &remote, KEY, Version::V3_5).unwrap();
        assert_eq!(derived.len(), 16);

        // Reference: GCM ciphertext bytes under nonce = local[..12].
        let xored: Vec<u8> = local.iter().zip(remote.iter()).map(|(a, b)| a ^ b).collect();
        let out = Cipher::new(KEY)
            .unwrap()
            .gcm_encrypt(&xored, &[], Some(&local[..12]))
            .unwrap();
        assert_eq!(derived, out[12..28].to_vec());
    }

    #[test]
    fn no_derivation_for_legacy_versions() {
        let local = [0u8; 16];
        let remote = [0u8; 16];
        assert!(derive_session_key(&local, &remote, KEY, Version::V3_3).is_err());
    }
}
