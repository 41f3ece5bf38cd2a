//! Encrypt-then-MAC block protection for records.
//!
//! A [`RecordEncryptor`] and a [`RecordDecryptor`] each own one direction of
//! a channel. The CBC chaining state carries over from one record to the
//! next, so the IV of a record is the last ciphertext block of the previous
//! record in the same key epoch.

use aes::Aes256;
use cbc::cipher::generic_array::GenericArray;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::CryptoError;

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Length of the MAC trailer in bytes.
pub const MAC_SIZE: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Key material for one direction of a channel.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct TrafficKeys {
    /// AES-256 key.
    pub cipher_key: [u8; 32],
    /// Initial CBC vector.
    pub iv: [u8; BLOCK_SIZE],
    /// HMAC-SHA256 key.
    pub mac_key: [u8; 32],
}

/// Sending half: encrypts whole blocks and tags the ciphertext.
pub struct RecordEncryptor {
    cipher: Aes256CbcEnc,
    mac_key: Zeroizing<[u8; 32]>,
}

impl RecordEncryptor {
    pub fn new(keys: &TrafficKeys) -> Result<Self, CryptoError> {
        let cipher = Aes256CbcEnc::new_from_slices(&keys.cipher_key, &keys.iv)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            cipher,
            mac_key: Zeroizing::new(keys.mac_key),
        })
    }

    /// Encrypt `buf` in place and return the MAC over the produced ciphertext.
    ///
    /// `buf` must be a non-empty multiple of [`BLOCK_SIZE`].
    pub fn seal_in_place(&mut self, buf: &mut [u8]) -> Result<[u8; MAC_SIZE], CryptoError> {
        check_alignment(buf.len())?;
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        compute_mac(&self.mac_key, buf)
    }
}

/// Receiving half: verifies the tag, then decrypts.
pub struct RecordDecryptor {
    cipher: Aes256CbcDec,
    mac_key: Zeroizing<[u8; 32]>,
}

impl RecordDecryptor {
    pub fn new(keys: &TrafficKeys) -> Result<Self, CryptoError> {
        let cipher = Aes256CbcDec::new_from_slices(&keys.cipher_key, &keys.iv)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            cipher,
            mac_key: Zeroizing::new(keys.mac_key),
        })
    }

    /// Decrypt a copy of the first ciphertext block of a record.
    ///
    /// The chaining state is left untouched so the record can still be
    /// authenticated and decrypted as a whole afterwards.
    pub fn peek_first_block(&self, block: &[u8; BLOCK_SIZE]) -> Zeroizing<[u8; BLOCK_SIZE]> {
        let mut cipher = self.cipher.clone();
        let mut plain = Zeroizing::new(*block);
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut plain[..]));
        plain
    }

    /// Verify `tag` over `ciphertext`, then decrypt it in place.
    ///
    /// Nothing is decrypted, and the chaining state does not advance, when
    /// the tag does not match.
    pub fn open_in_place(&mut self, ciphertext: &mut [u8], tag: &[u8]) -> Result<(), CryptoError> {
        check_alignment(ciphertext.len())?;

        let mut mac = HmacSha256::new_from_slice(&self.mac_key[..])
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        mac.update(ciphertext);
        mac.verify_slice(tag)
            .map_err(|_| CryptoError::IntegrityFailure)?;

        for block in ciphertext.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

fn compute_mac(key: &[u8; 32], data: &[u8]) -> Result<[u8; MAC_SIZE], CryptoError> {
    let mut mac =
        HmacSha256::new_from_slice(&key[..]).map_err(|_| CryptoError::InvalidKeyLength)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn check_alignment(len: usize) -> Result<(), CryptoError> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(CryptoError::Misaligned(len));
    }
    Ok(())
}

/// Length of `len` rounded up to a whole number of blocks.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(seed: u8) -> TrafficKeys {
        TrafficKeys {
            cipher_key: [seed; 32],
            iv: [seed.wrapping_add(1); BLOCK_SIZE],
            mac_key: [seed.wrapping_add(2); 32],
        }
    }

    #[test]
    fn test_seal_and_open() {
        let k = keys(7);
        let mut enc = RecordEncryptor::new(&k).unwrap();
        let mut dec = RecordDecryptor::new(&k).unwrap();

        let plain = [0x42u8; 48];
        let mut buf = plain;
        let tag = enc.seal_in_place(&mut buf).unwrap();
        assert_ne!(buf, plain);

        dec.open_in_place(&mut buf, &tag).unwrap();
        assert_eq!(buf, plain);
    }

    #[test]
    fn test_chaining_continues_across_records() {
        let k = keys(1);
        let mut enc = RecordEncryptor::new(&k).unwrap();
        let mut dec = RecordDecryptor::new(&k).unwrap();

        let mut first = [9u8; 16];
        let mut second = [9u8; 16];
        let tag1 = enc.seal_in_place(&mut first).unwrap();
        let tag2 = enc.seal_in_place(&mut second).unwrap();
        assert_ne!(first, second);

        dec.open_in_place(&mut first, &tag1).unwrap();
        dec.open_in_place(&mut second, &tag2).unwrap();
        assert_eq!(second, [9u8; 16]);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let k = keys(3);
        let mut enc = RecordEncryptor::new(&k).unwrap();
        let mut dec = RecordDecryptor::new(&k).unwrap();

        let mut buf = [0u8; 32];
        buf[0] = 0xAB;
        let tag = enc.seal_in_place(&mut buf).unwrap();

        let first: [u8; BLOCK_SIZE] = buf[..BLOCK_SIZE].try_into().unwrap();
        assert_eq!(dec.peek_first_block(&first)[0], 0xAB);

        dec.open_in_place(&mut buf, &tag).unwrap();
        assert_eq!(buf[0], 0xAB);
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let k = keys(5);
        let mut enc = RecordEncryptor::new(&k).unwrap();
        let mut dec = RecordDecryptor::new(&k).unwrap();

        let mut buf = [1u8; 32];
        let tag = enc.seal_in_place(&mut buf).unwrap();
        buf[17] ^= 0x01;

        assert!(matches!(
            dec.open_in_place(&mut buf, &tag),
            Err(CryptoError::IntegrityFailure)
        ));
    }

    #[test]
    fn test_misaligned_input_rejected() {
        let mut enc = RecordEncryptor::new(&keys(0)).unwrap();
        assert!(matches!(
            enc.seal_in_place(&mut [0u8; 15]),
            Err(CryptoError::Misaligned(15))
        ));
        assert!(matches!(
            enc.seal_in_place(&mut []),
            Err(CryptoError::Misaligned(0))
        ));
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(3), 16);
        assert_eq!(padded_len(16), 16);
        assert_eq!(padded_len(17), 32);
    }
}
