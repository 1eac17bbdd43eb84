//! Password authentication: MD5 and SCRAM-SHA-256 (RFC 5802, RFC 7677).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use super::error::{PgError, PgResult};

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// `md5` + hex(MD5(hex(MD5(password + user)) + salt))
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

/// Client side of one SCRAM-SHA-256 exchange.
///
/// `client_first` → server-first → `client_final` → server-final → `verify`.
pub struct ScramExchange {
    password: String,
    client_first_bare: String,
    client_nonce: String,
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramExchange {
    pub fn new(username: &str, password: &str) -> Self {
        let nonce: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce))
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        // PostgreSQL ignores the SCRAM user name in favor of the startup user.
        let client_first_bare = format!("n={},r={}", username, client_nonce);
        Self {
            password: password.to_string(),
            client_first_bare,
            client_nonce,
            auth_message: None,
            salted_password: None,
        }
    }

    /// client-first-message: GS2 header without channel binding.
    pub fn client_first(&self) -> Vec<u8> {
        format!("n,,{}", self.client_first_bare).into_bytes()
    }

    /// Answer server-first-message (`r=..,s=..,i=..`) with client-final-message.
    pub fn client_final(&mut self, server_first: &[u8]) -> PgResult<Vec<u8>> {
        let server_first = std::str::from_utf8(server_first)
            .map_err(|_| scram_error("server-first-message is not UTF-8"))?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => {
                    salt = Some(BASE64.decode(v).map_err(|_| scram_error("invalid salt"))?)
                }
                Some(("i", v)) => {
                    iterations = Some(
                        v.parse::<u32>()
                            .map_err(|_| scram_error("invalid iteration count"))?,
                    )
                }
                _ => {}
            }
        }
        let nonce = nonce.ok_or_else(|| scram_error("missing nonce"))?;
        let salt = salt.ok_or_else(|| scram_error("missing salt"))?;
        let iterations = iterations.ok_or_else(|| scram_error("missing iteration count"))?;
        if !nonce.starts_with(&self.client_nonce) {
            return Err(scram_error("server nonce does not extend client nonce"));
        }

        let mut salted_password = [0u8; 32];
        pbkdf2::pbkdf2::<HmacSha256>(
            self.password.as_bytes(),
            &salt,
            iterations,
            &mut salted_password,
        )
        .map_err(|_| scram_error("key derivation failed"))?;

        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c=biws,r={}", nonce);
        let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);
        let signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);
        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)).into_bytes())
    }

    /// Check the server signature in server-final-message (`v=..`).
    pub fn verify(&self, server_final: &[u8]) -> PgResult<()> {
        let (Some(auth_message), Some(salted_password)) =
            (&self.auth_message, &self.salted_password)
        else {
            return Err(scram_error("server-final-message before client-final-message"));
        };
        let verifier = std::str::from_utf8(server_final)
            .ok()
            .and_then(|s| s.strip_prefix("v="))
            .and_then(|v| BASE64.decode(v.trim_end_matches('\0')).ok())
            .ok_or_else(|| scram_error("invalid server signature"))?;

        let server_key = hmac_sha256(salted_password, b"Server Key")?;
        let expected = hmac_sha256(&server_key, auth_message.as_bytes())?;
        if verifier != expected {
            return Err(scram_error("server signature mismatch"));
        }
        Ok(())
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> PgResult<[u8; 32]> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| scram_error("invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn scram_error(what: &str) -> PgError {
    PgError::Auth(format!("SCRAM: {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password_shape() {
        let hash = md5_password("postgres", "secret", &[1, 2, 3, 4]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 35);
        assert_ne!(hash, md5_password("postgres", "secret", &[4, 3, 2, 1]));
    }

    #[test]
    fn test_rfc7677_vector() {
        // Test vector from RFC 7677 section 3.
        let mut scram = ScramExchange::with_nonce("user", "pencil", "rOprNGfwEbeRWgbNEkqO".into());
        assert_eq!(scram.client_first(), b"n,,n=user,r=rOprNGfwEbeRWgbNEkqO".to_vec());

        let server_first = b"r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";
        let client_final = scram.client_final(server_first).unwrap();
        assert_eq!(
            String::from_utf8(client_final).unwrap(),
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        scram
            .verify(b"v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
        assert!(scram.verify(b"v=AAAA").is_err());
    }

    #[test]
    fn test_foreign_nonce_rejected() {
        let mut scram = ScramExchange::new("user", "pencil");
        let err = scram
            .client_final(b"r=somebody-else,s=c2FsdA==,i=4096")
            .unwrap_err();
        assert!(matches!(err, PgError::Auth(_)));
    }
}
