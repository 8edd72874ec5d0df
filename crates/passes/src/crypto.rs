//! XOR cipher for string globals.
//!
//! A single-byte XOR keeps the runtime decryption stub tiny; the point is
//! removing plaintext from the binary image, not cryptographic strength.

/// Encrypt a byte string with a single-byte key.
pub fn xor_encrypt(plaintext: &[u8], key: u8) -> Vec<u8> {
    plaintext.iter().map(|&b| b ^ key).collect()
}

/// Invert [`xor_encrypt`].
pub fn xor_decrypt(ciphertext: &[u8], key: u8) -> Vec<u8> {
    ciphertext.iter().map(|&b| b ^ key).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let plain = b"Enterprise-Grade-Security-2024";
        for key in [1u8, 0x42, 255] {
            let cipher = xor_encrypt(plain, key);
            assert_ne!(cipher.as_slice(), plain.as_slice());
            assert_eq!(xor_decrypt(&cipher, key), plain);
        }
    }

    #[test]
    fn test_every_byte_changes_under_nonzero_key() {
        let plain = b"hi\0";
        let cipher = xor_encrypt(plain, 0x5A);
        for (p, c) in plain.iter().zip(&cipher) {
            assert_ne!(p, c);
        }
    }
}
