//! SCRAM-SHA-256 client (RFC 5802 / RFC 7677), no channel binding.

use base64::Engine;
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const NONCE_LEN: usize = 18;
const NONCE_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

/// Drives one SCRAM-SHA-256 exchange for a single authentication attempt.
///
/// No channel binding is supported (`gs2-cbind-flag` is always `n`).
pub struct ScramClient {
    nonce: String,
    user: String,
    password: String,
    auth_message: Option<String>,
    salted_password: Option<Vec<u8>>,
}

impl ScramClient {
    /// Create a new client for `user`/`password`, generating a fresh nonce.
    pub fn new(user: &str, password: &str) -> Self {
        let mut rng = rand::rng();
        let nonce: String = (0..NONCE_LEN)
            .map(|_| NONCE_ALPHABET[rng.random_range(0..NONCE_ALPHABET.len())] as char)
            .collect();

        Self {
            nonce,
            user: user.to_string(),
            password: password.to_string(),
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_message_bare(&self) -> String {
        format!("n={},r={}", self.user, self.nonce)
    }

    /// Build the client-first-message (`SASLInitialResponse` payload).
    pub fn client_first_message(&self) -> String {
        format!("n,,{}", self.client_first_message_bare())
    }

    /// Consume the server-first-message and produce the client-final-message
    /// (`SASLResponse` payload).
    pub fn process_server_first(&mut self, server_first: &str) -> Result<String> {
        let mut combined_nonce = None;
        let mut salt_b64 = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                combined_nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt_b64 = Some(value);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = value.parse().ok();
            }
        }

        let combined_nonce = combined_nonce
            .ok_or_else(|| Error::Auth("SCRAM server-first-message is missing r=".into()))?;
        let salt_b64 = salt_b64
            .ok_or_else(|| Error::Auth("SCRAM server-first-message is missing s=".into()))?;
        let iterations: u32 = iterations
            .ok_or_else(|| Error::Auth("SCRAM server-first-message is missing i=".into()))?;

        if !combined_nonce.starts_with(&self.nonce) {
            return Err(Error::Auth(
                "SCRAM server nonce does not extend the client nonce".into(),
            ));
        }

        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt_b64)
            .map_err(|e| Error::Auth(format!("SCRAM salt is not valid base64: {e}")))?;

        let mut salted_password = vec![0u8; 32];
        pbkdf2_hmac::<Sha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        );
        self.salted_password = Some(salted_password.clone());

        let client_key = hmac_sha256(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);

        let channel_binding_b64 = base64::engine::general_purpose::STANDARD.encode("n,,");
        let client_final_without_proof = format!("c={channel_binding_b64},r={combined_nonce}");

        let auth_message = format!(
            "{},{},{}",
            self.client_first_message_bare(),
            server_first,
            client_final_without_proof
        );
        self.auth_message = Some(auth_message.clone());

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());

        let mut client_proof = [0u8; 32];
        for i in 0..32 {
            client_proof[i] = client_key[i] ^ client_signature[i];
        }
        let proof_b64 = base64::engine::general_purpose::STANDARD.encode(client_proof);

        Ok(format!("{client_final_without_proof},p={proof_b64}"))
    }

    /// Verify the server-final-message's signature against the expected
    /// value. Authentication MUST fail if this does not succeed: a mismatch
    /// means the server does not know the password (or a man-in-the-middle
    /// is present).
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let server_signature_b64 = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("SCRAM server-final-message is missing v=".into()))?;

        let server_signature = base64::engine::general_purpose::STANDARD
            .decode(server_signature_b64)
            .map_err(|e| Error::Auth(format!("SCRAM server signature is not valid base64: {e}")))?;

        let salted_password = self
            .salted_password
            .as_ref()
            .ok_or_else(|| Error::Auth("SCRAM exchange did not complete the client step".into()))?;
        let auth_message = self
            .auth_message
            .as_ref()
            .ok_or_else(|| Error::Auth("SCRAM exchange did not complete the client step".into()))?;

        let server_key = hmac_sha256(salted_password, b"Server Key");
        let expected_signature = hmac_sha256(&server_key, auth_message.as_bytes());

        if server_signature.as_slice() != expected_signature.as_slice() {
            return Err(Error::Auth(
                "SCRAM server signature verification failed".into(),
            ));
        }

        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_is_18_lowercase_letters() {
        let client = ScramClient::new("postgres", "password");
        assert_eq!(client.nonce.len(), NONCE_LEN);
        assert!(client.nonce.bytes().all(|b| b.is_ascii_lowercase()));
    }

    #[test]
    fn client_first_message_includes_username() {
        let client = ScramClient::new("alice", "password");
        let msg = client.client_first_message();
        assert!(msg.starts_with("n,,n=alice,r="));
    }

    #[test]
    fn rejects_malformed_server_first() {
        let mut client = ScramClient::new("postgres", "password");
        assert!(client.process_server_first("garbage").is_err());
    }

    #[test]
    fn rejects_server_nonce_not_extending_client_nonce() {
        let mut client = ScramClient::new("postgres", "password");
        let result = client.process_server_first("r=totally-different,s=AAAA,i=4096");
        assert!(result.is_err());
    }

    #[test]
    fn full_exchange_round_trip_matches_rfc_shape() {
        let mut client = ScramClient::new("user", "pencil");
        let first = client.client_first_message();
        let nonce = first.rsplit("r=").next().unwrap();
        let salt_b64 = base64::engine::general_purpose::STANDARD.encode(b"saltsalt");
        let server_first = format!("r={nonce}extra,s={salt_b64},i=4096");

        let final_msg = client.process_server_first(&server_first).unwrap();
        assert!(final_msg.contains("c="));
        assert!(final_msg.contains(",p="));

        // A forged server signature must fail verification.
        assert!(client.verify_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=").is_err());
    }
}
