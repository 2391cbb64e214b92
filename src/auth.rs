// Copyright 2025 The rfbserver Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! VNC authentication: DES challenge/response and password files.
//!
//! VNC authentication encrypts a random 16-byte challenge with a DES key
//! derived from the password. The derivation is VNC-specific: the
//! password is truncated or zero-padded to 8 bytes and each byte's bit
//! order is reversed before it is used as the key. The challenge is then
//! encrypted as two independent ECB blocks.
//!
//! Password files hold the same 8 password bytes obfuscated under a
//! fixed, well-known DES key. This hides the password from a casual
//! directory listing, nothing more.

use des::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use des::Des;
use rand::RngCore;
use std::io;
use std::path::Path;

/// Length of the authentication challenge in bytes.
pub const CHALLENGE_SIZE: usize = 16;

/// The fixed key used to obfuscate stored passwords.
const PASSWORD_FILE_KEY: [u8; 8] = [23, 82, 107, 6, 35, 78, 88, 7];

/// Builds the DES cipher for a password, applying the VNC key quirks.
fn password_cipher(password: &str) -> Des {
    let mut key = [0u8; 8];
    for (i, &b) in password.as_bytes().iter().take(8).enumerate() {
        key[i] = b.reverse_bits();
    }
    // An 8-byte key can never be rejected.
    Des::new_from_slice(&key).expect("DES key is always 8 bytes")
}

/// Encrypts a challenge with the key derived from `password`.
#[must_use]
pub fn encrypt_challenge(password: &str, challenge: &[u8; CHALLENGE_SIZE]) -> [u8; CHALLENGE_SIZE] {
    let cipher = password_cipher(password);
    let mut out = *challenge;
    for chunk in out.chunks_exact_mut(8) {
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
    }
    out
}

/// Server-side state for VNC authentication.
pub struct VncAuth {
    password: Option<String>,
}

impl VncAuth {
    /// Creates the authenticator. `None` disables authentication.
    #[must_use]
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }

    /// Whether a password is configured.
    #[must_use]
    pub fn required(&self) -> bool {
        self.password.is_some()
    }

    /// Produces a fresh random challenge.
    #[must_use]
    pub fn generate_challenge(&self) -> [u8; CHALLENGE_SIZE] {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        rand::thread_rng().fill_bytes(&mut challenge);
        challenge
    }

    /// Checks the client's response against the expected encryption.
    ///
    /// Returns `false` when no password is configured; callers should not
    /// have offered VNC authentication in that case.
    #[must_use]
    pub fn verify_response(&self, response: &[u8], challenge: &[u8; CHALLENGE_SIZE]) -> bool {
        let Some(password) = &self.password else {
            return false;
        };
        if response.len() != CHALLENGE_SIZE {
            return false;
        }
        let expected = encrypt_challenge(password, challenge);
        expected == response
    }
}

/// Writes a password file: 8 obfuscated bytes under the fixed VNC key.
///
/// # Errors
///
/// Returns any I/O error from writing the file.
pub fn store_password_file(path: &Path, password: &str) -> io::Result<()> {
    let cipher = Des::new_from_slice(&PASSWORD_FILE_KEY).expect("DES key is always 8 bytes");
    let mut block = [0u8; 8];
    for (i, &b) in password.as_bytes().iter().take(8).enumerate() {
        block[i] = b;
    }
    cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
    std::fs::write(path, block)
}

/// Reads a password file written by [`store_password_file`].
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not exactly 8 bytes.
pub fn load_password_file(path: &Path) -> io::Result<String> {
    let data = std::fs::read(path)?;
    if data.len() != 8 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "password file must be exactly 8 bytes",
        ));
    }
    let cipher = Des::new_from_slice(&PASSWORD_FILE_KEY).expect("DES key is always 8 bytes");
    let mut block = [0u8; 8];
    block.copy_from_slice(&data);
    cipher.decrypt_block(GenericArray::from_mut_slice(&mut block));
    let end = block.iter().position(|&b| b == 0).unwrap_or(8);
    Ok(block[..end].iter().map(|&b| b as char).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_response_verifies() {
        let auth = VncAuth::new(Some("secret".to_string()));
        let challenge = auth.generate_challenge();
        let response = encrypt_challenge("secret", &challenge);
        assert!(auth.verify_response(&response, &challenge));
    }

    #[test]
    fn wrong_password_fails() {
        let auth = VncAuth::new(Some("secret".to_string()));
        let challenge = auth.generate_challenge();
        let response = encrypt_challenge("hunter2", &challenge);
        assert!(!auth.verify_response(&response, &challenge));
    }

    #[test]
    fn only_first_eight_bytes_matter() {
        let auth = VncAuth::new(Some("longpassword".to_string()));
        let challenge = auth.generate_challenge();
        let response = encrypt_challenge("longpass", &challenge);
        assert!(auth.verify_response(&response, &challenge));
    }

    #[test]
    fn no_password_never_verifies() {
        let auth = VncAuth::new(None);
        let challenge = [0u8; CHALLENGE_SIZE];
        assert!(!auth.verify_response(&[0u8; CHALLENGE_SIZE], &challenge));
    }

    #[test]
    fn known_vector() {
        // DES of an all-zero block under the bit-reversed "pa" key must be
        // deterministic and split into two identical halves for an
        // all-zero challenge.
        let challenge = [0u8; CHALLENGE_SIZE];
        let response = encrypt_challenge("pa", &challenge);
        assert_eq!(&response[..8], &response[8..]);
        assert_ne!(&response[..8], &[0u8; 8]);
    }

    #[test]
    fn password_file_roundtrip() {
        let dir = std::env::temp_dir().join("rfbserver-auth-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("passwd");
        store_password_file(&path, "secret").unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
        assert_eq!(load_password_file(&path).unwrap(), "secret");
        std::fs::remove_file(&path).unwrap();
    }
}
