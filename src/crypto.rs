//! Symmetric encryption of buffers and files with
//! AES-{128,192,256}-{CBC,CTR}.
//!
//! Key and IV come from the legacy OpenSSL `EVP_BytesToKey` construction
//! with SHA-1, a single iteration and no salt. This is not a KDF for
//! cold-storage passwords. It is retained only because the persisted
//! user file format depends on it; a different derivation could not
//! decrypt existing files.

use aes::{Aes128, Aes192, Aes256};
use cipher::block_padding::Pkcs7;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, StreamCipher};
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::error;

use crate::error::{Error, Result};

/// Chunk size for file encryption.
const ENC_BUF_SIZE: usize = 1024 * 1024;

const AES_BLOCK_SIZE: usize = 16;

/// The supported cipher modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encryption {
    Aes256Cbc,
    Aes192Cbc,
    Aes128Cbc,
    Aes256Ctr,
    Aes192Ctr,
    Aes128Ctr,
}

impl Encryption {
    pub fn key_length(self) -> usize {
        match self {
            Encryption::Aes256Cbc | Encryption::Aes256Ctr => 32,
            Encryption::Aes192Cbc | Encryption::Aes192Ctr => 24,
            Encryption::Aes128Cbc | Encryption::Aes128Ctr => 16,
        }
    }

    pub fn iv_length(self) -> usize {
        AES_BLOCK_SIZE
    }

    pub fn block_size(self) -> usize {
        AES_BLOCK_SIZE
    }
}

/// Derives an AES key and IV from `password`: `D1 = SHA1(password)`,
/// `Dn = SHA1(Dn-1 || password)`, concatenated until key and IV are
/// filled. One iteration, no salt, byte-for-byte what the file format
/// expects.
pub fn derive_key_iv(password: &str, mode: Encryption) -> (Vec<u8>, Vec<u8>) {
    let needed = mode.key_length() + mode.iv_length();
    let mut derived = Vec::with_capacity(needed + 20);
    let mut block: Vec<u8> = Vec::new();

    while derived.len() < needed {
        let mut hasher = Sha1::new();
        hasher.update(&block);
        hasher.update(password.as_bytes());
        block = hasher.finalize().to_vec();
        derived.extend_from_slice(&block);
    }

    let iv = derived[mode.key_length()..needed].to_vec();
    derived.truncate(mode.key_length());

    (derived, iv)
}

/// Encrypts `plaintext` with a key derived from `password`. CBC output
/// is PKCS#7-padded (at most `block_size` longer than the input); CTR is
/// length-preserving.
pub fn encrypt(plaintext: &[u8], password: &str, mode: Encryption) -> Result<Vec<u8>> {
    let (key, iv) = derive_key_iv(password, mode);

    match mode {
        Encryption::Aes256Cbc => cbc_encrypt::<Aes256>(plaintext, &key, &iv),
        Encryption::Aes192Cbc => cbc_encrypt::<Aes192>(plaintext, &key, &iv),
        Encryption::Aes128Cbc => cbc_encrypt::<Aes128>(plaintext, &key, &iv),
        Encryption::Aes256Ctr => ctr_apply::<Aes256>(plaintext, &key, &iv),
        Encryption::Aes192Ctr => ctr_apply::<Aes192>(plaintext, &key, &iv),
        Encryption::Aes128Ctr => ctr_apply::<Aes128>(plaintext, &key, &iv),
    }
}

/// Decrypts `ciphertext` with a key derived from `password`, returning
/// exactly the plaintext bytes.
pub fn decrypt(ciphertext: &[u8], password: &str, mode: Encryption) -> Result<Vec<u8>> {
    let (key, iv) = derive_key_iv(password, mode);

    match mode {
        Encryption::Aes256Cbc => cbc_decrypt::<Aes256>(ciphertext, &key, &iv),
        Encryption::Aes192Cbc => cbc_decrypt::<Aes192>(ciphertext, &key, &iv),
        Encryption::Aes128Cbc => cbc_decrypt::<Aes128>(ciphertext, &key, &iv),
        Encryption::Aes256Ctr => ctr_apply::<Aes256>(ciphertext, &key, &iv),
        Encryption::Aes192Ctr => ctr_apply::<Aes192>(ciphertext, &key, &iv),
        Encryption::Aes128Ctr => ctr_apply::<Aes128>(ciphertext, &key, &iv),
    }
}

fn cbc_encrypt<C>(plaintext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>>
where
    C: cipher::BlockCipher + cipher::BlockEncrypt + cipher::KeyInit,
{
    let enc = cbc::Encryptor::<C>::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;

    Ok(enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

fn cbc_decrypt<C>(ciphertext: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>>
where
    C: cipher::BlockCipher + cipher::BlockDecrypt + cipher::KeyInit,
{
    let dec = cbc::Decryptor::<C>::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;

    dec.decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))
}

fn ctr_apply<C>(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>>
where
    C: cipher::BlockCipher + cipher::BlockEncrypt + cipher::KeyInit,
    C: cipher::BlockSizeUser<BlockSize = cipher::consts::U16>,
    ctr::Ctr128BE<C>: KeyIvInit + StreamCipher,
{
    let mut cipher = ctr::Ctr128BE::<C>::new_from_slices(key, iv)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;

    let mut out = data.to_vec();
    cipher.apply_keystream(&mut out);
    Ok(out)
}

/// Encrypts `from` into `to` (or `<from>.aes` when `to` is `None`) and
/// deletes the source on success. The file format is fixed AES-256-CBC.
pub fn encrypt_file(from: &Path, to: Option<&Path>, password: &str) -> Result<()> {
    if !from.exists() {
        error!("encrypt_file: file does not exist: {}", from.display());
        return Err(Error::Crypto(format!(
            "file does not exist: {}",
            from.display()
        )));
    }

    let to = match to {
        Some(to) => to.to_path_buf(),
        None => {
            let mut name = from.as_os_str().to_owned();
            name.push(".aes");
            PathBuf::from(name)
        }
    };

    stream_encrypt_file(from, &to, password)?;
    std::fs::remove_file(from)?;

    Ok(())
}

/// Decrypts `from` into `to` (or `from` with one trailing extension
/// stripped) and deletes the source on success.
pub fn decrypt_file(from: &Path, to: Option<&Path>, password: &str) -> Result<()> {
    if !from.exists() {
        error!("decrypt_file: file does not exist: {}", from.display());
        return Err(Error::Crypto(format!(
            "file does not exist: {}",
            from.display()
        )));
    }

    let to = match to {
        Some(to) => to.to_path_buf(),
        None => from.with_extension(""),
    };

    stream_decrypt_file(from, &to, password)?;
    std::fs::remove_file(from)?;

    Ok(())
}

/// Streaming CBC encryption in [`ENC_BUF_SIZE`] chunks, carrying cipher
/// state across chunks and padding only the final block. Bounded chunks
/// keep every cipher call well under any 32-bit length limit.
fn stream_encrypt_file(from: &Path, to: &Path, password: &str) -> Result<()> {
    let (key, iv) = derive_key_iv(password, Encryption::Aes256Cbc);
    let mut enc = cbc::Encryptor::<Aes256>::new_from_slices(&key, &iv)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;

    let mut input = File::open(from)?;
    let mut output = File::create(to)?;

    let mut inbuf = vec![0u8; ENC_BUF_SIZE];
    let mut carry: Vec<u8> = Vec::with_capacity(AES_BLOCK_SIZE);

    loop {
        let n = input.read(&mut inbuf)?;
        if n == 0 {
            break;
        }

        let mut chunk = Vec::with_capacity(carry.len() + n);
        chunk.extend_from_slice(&carry);
        chunk.extend_from_slice(&inbuf[..n]);

        let full = chunk.len() - chunk.len() % AES_BLOCK_SIZE;
        for block in chunk[..full].chunks_exact_mut(AES_BLOCK_SIZE) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        output.write_all(&chunk[..full])?;

        carry.clear();
        carry.extend_from_slice(&chunk[full..]);
    }

    // PKCS#7 final block: pad value 1..=16, a full pad block when the
    // input is block-aligned.
    let pad = AES_BLOCK_SIZE - carry.len();
    carry.resize(AES_BLOCK_SIZE, pad as u8);
    enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut carry));
    output.write_all(&carry)?;
    output.flush()?;

    Ok(())
}

/// Streaming CBC decryption; the last decrypted block is held back until
/// end of input so its padding can be stripped.
fn stream_decrypt_file(from: &Path, to: &Path, password: &str) -> Result<()> {
    let (key, iv) = derive_key_iv(password, Encryption::Aes256Cbc);
    let mut dec = cbc::Decryptor::<Aes256>::new_from_slices(&key, &iv)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {e}")))?;

    let mut input = File::open(from)?;
    let mut output = File::create(to)?;

    let mut inbuf = vec![0u8; ENC_BUF_SIZE];
    let mut carry: Vec<u8> = Vec::with_capacity(AES_BLOCK_SIZE);
    let mut held: Option<[u8; AES_BLOCK_SIZE]> = None;

    loop {
        let n = input.read(&mut inbuf)?;
        if n == 0 {
            break;
        }

        let mut chunk = Vec::with_capacity(carry.len() + n);
        chunk.extend_from_slice(&carry);
        chunk.extend_from_slice(&inbuf[..n]);

        let full = chunk.len() - chunk.len() % AES_BLOCK_SIZE;
        for block in chunk[..full].chunks_exact_mut(AES_BLOCK_SIZE) {
            dec.decrypt_block_mut(GenericArray::from_mut_slice(block));

            let decrypted: [u8; AES_BLOCK_SIZE] = (&*block).try_into().expect("block size");
            if let Some(prev) = held.replace(decrypted) {
                output.write_all(&prev)?;
            }
        }

        carry.clear();
        carry.extend_from_slice(&chunk[full..]);
    }

    if !carry.is_empty() {
        return Err(Error::Crypto(
            "ciphertext is not a multiple of the block size".into(),
        ));
    }

    let Some(last) = held else {
        return Err(Error::Crypto("ciphertext is empty".into()));
    };

    let pad = last[AES_BLOCK_SIZE - 1] as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE {
        return Err(Error::Crypto("invalid padding".into()));
    }
    output.write_all(&last[..AES_BLOCK_SIZE - pad])?;
    output.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [Encryption; 6] = [
        Encryption::Aes256Cbc,
        Encryption::Aes192Cbc,
        Encryption::Aes128Cbc,
        Encryption::Aes256Ctr,
        Encryption::Aes192Ctr,
        Encryption::Aes128Ctr,
    ];

    #[test]
    fn test_derive_key_iv_is_deterministic() {
        for mode in MODES {
            let (k1, iv1) = derive_key_iv("topsecret", mode);
            let (k2, iv2) = derive_key_iv("topsecret", mode);
            assert_eq!(k1, k2);
            assert_eq!(iv1, iv2);
            assert_eq!(mode.key_length(), k1.len());
            assert_eq!(mode.iv_length(), iv1.len());
        }
    }

    #[test]
    fn test_derive_key_iv_chains_digests() {
        // AES-256-CBC needs 48 bytes: D1 = SHA1(pw), D2 = SHA1(D1 || pw),
        // D3 = SHA1(D2 || pw); key = D1 || D2[..12], iv = D2[12..] || D3[..8].
        let pw = b"topsecret";
        let d1 = Sha1::digest(pw);
        let d2 = Sha1::digest([&d1[..], pw].concat());
        let d3 = Sha1::digest([&d2[..], pw].concat());

        let (key, iv) = derive_key_iv("topsecret", Encryption::Aes256Cbc);
        assert_eq!([&d1[..], &d2[..12]].concat(), key);
        assert_eq!([&d2[12..], &d3[..8]].concat(), iv);
    }

    #[test]
    fn test_encrypt_decrypt_identity_all_modes() {
        let inputs: [&[u8]; 4] = [b"", b"x", b"secret", &[0u8; 1000]];

        for mode in MODES {
            for input in inputs {
                let ciphertext = encrypt(input, "master", mode).unwrap();
                let plaintext = decrypt(&ciphertext, "master", mode).unwrap();
                assert_eq!(input, &plaintext[..], "{mode:?}");
            }
        }
    }

    #[test]
    fn test_cbc_pads_ctr_preserves_length() {
        let ciphertext = encrypt(b"0123456789abcdef", "pw", Encryption::Aes256Cbc).unwrap();
        assert_eq!(32, ciphertext.len());

        let ciphertext = encrypt(b"0123456789abcdef", "pw", Encryption::Aes256Ctr).unwrap();
        assert_eq!(16, ciphertext.len());
    }

    #[test]
    fn test_decrypt_with_wrong_password_never_round_trips() {
        let ciphertext = encrypt(b"secret", "right", Encryption::Aes256Cbc).unwrap();
        // A wrong key either trips the padding check or yields garbage.
        if let Ok(plaintext) = decrypt(&ciphertext, "wrong", Encryption::Aes256Cbc) {
            assert_ne!(b"secret", &plaintext[..]);
        }
    }

    #[test]
    fn test_file_round_trip_deletes_source() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("users.conf");
        std::fs::write(&plain, b"alice:secret\n").unwrap();

        encrypt_file(&plain, None, "master").unwrap();
        assert!(!plain.exists());

        let encrypted = dir.path().join("users.conf.aes");
        assert!(encrypted.exists());

        decrypt_file(&encrypted, None, "master").unwrap();
        assert!(!encrypted.exists());
        assert_eq!(b"alice:secret\n", &std::fs::read(&plain).unwrap()[..]);
    }

    #[test]
    fn test_file_crypto_crosses_chunk_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("big.dat");
        let payload: Vec<u8> = (0..ENC_BUF_SIZE + 12345).map(|i| (i % 251) as u8).collect();
        std::fs::write(&plain, &payload).unwrap();

        let encrypted = dir.path().join("big.aes");
        encrypt_file(&plain, Some(&encrypted), "master").unwrap();
        assert!(!plain.exists());

        let restored = dir.path().join("big.out");
        decrypt_file(&encrypted, Some(&restored), "master").unwrap();
        assert_eq!(payload, std::fs::read(&restored).unwrap());
    }

    #[test]
    fn test_file_matches_buffer_encryption() {
        // The file path is fixed AES-256-CBC; a whole-file decrypt of the
        // streamed output must equal the buffer API's result.
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("small.txt");
        std::fs::write(&plain, b"stream me").unwrap();

        let encrypted = dir.path().join("small.aes");
        encrypt_file(&plain, Some(&encrypted), "pw").unwrap();

        let streamed = std::fs::read(&encrypted).unwrap();
        let buffered = encrypt(b"stream me", "pw", Encryption::Aes256Cbc).unwrap();
        assert_eq!(buffered, streamed);
    }

    #[test]
    fn test_encrypt_missing_file() {
        assert!(encrypt_file(Path::new("/nonexistent/f"), None, "pw").is_err());
    }
}
