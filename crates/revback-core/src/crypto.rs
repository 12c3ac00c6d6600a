use crate::error::AppError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD as b64, Engine};
use rand::RngCore;

const IV_LEN: usize = 12;
const PREFIX: &str = "enc:";

/// Encrypt a credential for storage using the current key.
///
/// Persisted format: `enc:<iv-b64>:<tag-b64>:<ciphertext-b64>`, AES-256-GCM
/// with a random 12-byte IV per call.
pub fn encrypt(plaintext: &str, key: &[u8; 32]) -> Result<String, AppError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let mut combined = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| AppError::Internal(format!("encryption failed: {e}")))?;
    // aes-gcm appends the 16-byte tag to the ciphertext; split it back out so
    // the persisted format keeps tag and ciphertext as separate fields.
    let tag = combined.split_off(combined.len() - 16);

    Ok(format!(
        "{PREFIX}{}:{}:{}",
        b64.encode(iv),
        b64.encode(tag),
        b64.encode(combined),
    ))
}

/// Which key successfully decrypted a credential — used by the key-rotation
/// background task to decide whether a row needs re-encryption.
pub enum DecryptedWith {
    Current,
    Previous,
}

/// Decrypt a persisted credential. Values without the `enc:` prefix are
/// treated as plaintext for migration compatibility. Tries the current key
/// first, then the previous key if one is configured.
pub fn decrypt(
    stored: &str,
    current_key: &[u8; 32],
    previous_key: Option<&[u8; 32]>,
) -> Result<(String, DecryptedWith), AppError> {
    let Some(body) = stored.strip_prefix(PREFIX) else {
        return Ok((stored.to_string(), DecryptedWith::Current));
    };

    let mut parts = body.splitn(3, ':');
    let iv_b64 = parts
        .next()
        .ok_or_else(|| AppError::Internal("malformed credential: missing iv".to_string()))?;
    let tag_b64 = parts
        .next()
        .ok_or_else(|| AppError::Internal("malformed credential: missing tag".to_string()))?;
    let ct_b64 = parts
        .next()
        .ok_or_else(|| AppError::Internal("malformed credential: missing ciphertext".to_string()))?;

    let iv = b64
        .decode(iv_b64)
        .map_err(|e| AppError::Internal(format!("malformed credential iv: {e}")))?;
    let tag = b64
        .decode(tag_b64)
        .map_err(|e| AppError::Internal(format!("malformed credential tag: {e}")))?;
    let ciphertext = b64
        .decode(ct_b64)
        .map_err(|e| AppError::Internal(format!("malformed credential ciphertext: {e}")))?;

    let mut combined = ciphertext;
    combined.extend_from_slice(&tag);

    if let Ok(plain) = try_decrypt(current_key, &iv, &combined) {
        return Ok((plain, DecryptedWith::Current));
    }

    if let Some(previous) = previous_key {
        if let Ok(plain) = try_decrypt(previous, &iv, &combined) {
            return Ok((plain, DecryptedWith::Previous));
        }
    }

    Err(AppError::Internal(
        "credential could not be decrypted with current or previous key".to_string(),
    ))
}

fn try_decrypt(key: &[u8; 32], iv: &[u8], combined: &[u8]) -> Result<String, AppError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(iv);
    let plain = cipher
        .decrypt(nonce, combined)
        .map_err(|e| AppError::Internal(format!("decryption failed: {e}")))?;
    String::from_utf8(plain).map_err(|e| AppError::Internal(format!("decrypted bytes not utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> [u8; 32] {
        [byte; 32]
    }

    #[test]
    fn round_trips_with_current_key() {
        let k = key(7);
        let encrypted = encrypt("super-secret-value", &k).unwrap();
        assert!(encrypted.starts_with("enc:"));
        let (plain, _) = decrypt(&encrypted, &k, None).unwrap();
        assert_eq!(plain, "super-secret-value");
    }

    #[test]
    fn decrypts_with_previous_key_when_current_fails() {
        let old_key = key(1);
        let new_key = key(2);
        let encrypted = encrypt("rotate-me", &old_key).unwrap();

        let (plain, via) = decrypt(&encrypted, &new_key, Some(&old_key)).unwrap();
        assert_eq!(plain, "rotate-me");
        assert!(matches!(via, DecryptedWith::Previous));
    }

    #[test]
    fn plaintext_without_prefix_passes_through() {
        let k = key(3);
        let (plain, _) = decrypt("sk_live_plainvalue", &k, None).unwrap();
        assert_eq!(plain, "sk_live_plainvalue");
    }

    #[test]
    fn fails_when_neither_key_matches() {
        let k1 = key(4);
        let k2 = key(5);
        let k3 = key(6);
        let encrypted = encrypt("value", &k1).unwrap();
        assert!(decrypt(&encrypted, &k2, Some(&k3)).is_err());
    }
}
