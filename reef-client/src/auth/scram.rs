//! SCRAM client-side exchange (RFC 5802).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};

use reef_core::error::{CoreError, Result};

/// Hash function underlying a SCRAM mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
    /// SHA-512.
    Sha512,
}

fn hmac(hash: ScramHash, key: &[u8], data: &[u8]) -> Vec<u8> {
    match hash {
        ScramHash::Sha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        ScramHash::Sha256 => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        ScramHash::Sha512 => {
            let mut mac =
                Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn digest(hash: ScramHash, data: &[u8]) -> Vec<u8> {
    match hash {
        ScramHash::Sha1 => Sha1::digest(data).to_vec(),
        ScramHash::Sha256 => Sha256::digest(data).to_vec(),
        ScramHash::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// The `Hi` function from RFC 5802: iterated, salted HMAC.
fn hi(hash: ScramHash, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut salted = Vec::with_capacity(salt.len() + 4);
    salted.extend_from_slice(salt);
    salted.extend_from_slice(&1u32.to_be_bytes());

    let mut current = hmac(hash, password, &salted);
    let mut result = current.clone();
    for _ in 1..iterations {
        current = hmac(hash, password, &current);
        for (acc, byte) in result.iter_mut().zip(&current) {
            *acc ^= byte;
        }
    }
    result
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Escapes `=` and `,` in a SCRAM username per RFC 5802.
fn saslname(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn random_nonce() -> String {
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..24)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

fn parse_attributes(payload: &str) -> Vec<(char, String)> {
    payload
        .split(',')
        .filter_map(|part| {
            let mut chars = part.chars();
            let key = chars.next()?;
            if chars.next() != Some('=') {
                return None;
            }
            Some((key, part[2..].to_string()))
        })
        .collect()
}

fn attribute(attrs: &[(char, String)], key: char) -> Result<&str> {
    attrs
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.as_str())
        .ok_or_else(|| {
            CoreError::AuthenticationFailure {
                message: format!("SCRAM server message is missing the '{}' attribute", key),
                ctx: Default::default(),
            }
        })
}

fn auth_error(message: impl Into<String>) -> CoreError {
    CoreError::AuthenticationFailure {
        message: message.into(),
        ctx: Default::default(),
    }
}

/// State of the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScramState {
    Initial,
    SentClientFirst,
    SentClientFinal,
    Done,
}

/// A SCRAM client for one authentication exchange.
#[derive(Debug)]
pub struct ScramClient {
    hash: ScramHash,
    username: String,
    password: String,
    client_nonce: String,
    client_first_bare: String,
    state: ScramState,
    server_signature: Option<Vec<u8>>,
}

impl ScramClient {
    /// Creates a client with a fresh random nonce.
    pub fn new(hash: ScramHash, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::with_nonce(hash, username, password, random_nonce())
    }

    /// Creates a client with an explicit nonce.
    pub fn with_nonce(
        hash: ScramHash,
        username: impl Into<String>,
        password: impl Into<String>,
        nonce: impl Into<String>,
    ) -> Self {
        Self {
            hash,
            username: username.into(),
            password: password.into(),
            client_nonce: nonce.into(),
            client_first_bare: String::new(),
            state: ScramState::Initial,
            server_signature: None,
        }
    }

    /// Produces the client-first message.
    pub fn client_first(&mut self) -> Result<Vec<u8>> {
        if self.state != ScramState::Initial {
            return Err(auth_error("client-first already produced"));
        }
        self.client_first_bare = format!(
            "n={},r={}",
            saslname(&self.username),
            self.client_nonce
        );
        self.state = ScramState::SentClientFirst;
        Ok(format!("n,,{}", self.client_first_bare).into_bytes())
    }

    /// Consumes the server-first message and produces the client-final message.
    pub fn handle_server_first(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        if self.state != ScramState::SentClientFirst {
            return Err(auth_error("unexpected server-first message"));
        }

        let server_first = std::str::from_utf8(payload)
            .map_err(|_| auth_error("server-first message is not UTF-8"))?;
        let attrs = parse_attributes(server_first);

        let combined_nonce = attribute(&attrs, 'r')?.to_string();
        if !combined_nonce.starts_with(&self.client_nonce) {
            return Err(auth_error("server nonce does not extend the client nonce"));
        }
        let salt = BASE64
            .decode(attribute(&attrs, 's')?)
            .map_err(|_| auth_error("server salt is not valid base64"))?;
        let iterations: u32 = attribute(&attrs, 'i')?
            .parse()
            .map_err(|_| auth_error("server iteration count is not a number"))?;
        if iterations == 0 {
            return Err(auth_error("server iteration count must be positive"));
        }

        let salted_password = hi(self.hash, self.password.as_bytes(), &salt, iterations);
        let client_key = hmac(self.hash, &salted_password, b"Client Key");
        let stored_key = digest(self.hash, &client_key);

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, server_first, client_final_without_proof
        );

        let client_signature = hmac(self.hash, &stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        let server_key = hmac(self.hash, &salted_password, b"Server Key");
        self.server_signature = Some(hmac(self.hash, &server_key, auth_message.as_bytes()));

        self.state = ScramState::SentClientFinal;
        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verifies the server-final message against the expected signature.
    pub fn verify_server_final(&mut self, payload: &[u8]) -> Result<()> {
        if self.state != ScramState::SentClientFinal {
            return Err(auth_error("unexpected server-final message"));
        }

        let server_final = std::str::from_utf8(payload)
            .map_err(|_| auth_error("server-final message is not UTF-8"))?;
        let attrs = parse_attributes(server_final);
        if let Ok(error) = attribute(&attrs, 'e') {
            return Err(auth_error(format!("server rejected authentication: {}", error)));
        }

        let verifier = BASE64
            .decode(attribute(&attrs, 'v')?)
            .map_err(|_| auth_error("server signature is not valid base64"))?;
        let expected = self
            .server_signature
            .as_ref()
            .ok_or_else(|| auth_error("missing computed server signature"))?;

        if &verifier != expected {
            return Err(auth_error("server signature mismatch"));
        }
        self.state = ScramState::Done;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test vectors from RFC 5802 §5 (SCRAM-SHA-1, user "user", pass "pencil").
    const CLIENT_NONCE: &str = "fyko+d2lbbFgONRv9qkxdawL";
    const SERVER_FIRST: &str =
        "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
    const SERVER_FINAL: &str = "v=rmF9pqV8S7suAoZWja4dJRkFsKQ=";

    #[test]
    fn test_rfc5802_exchange() {
        let mut client =
            ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", CLIENT_NONCE);

        let first = client.client_first().unwrap();
        assert_eq!(
            std::str::from_utf8(&first).unwrap(),
            "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL"
        );

        let final_message = client.handle_server_first(SERVER_FIRST.as_bytes()).unwrap();
        assert_eq!(
            std::str::from_utf8(&final_message).unwrap(),
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );

        client.verify_server_final(SERVER_FINAL.as_bytes()).unwrap();
    }

    #[test]
    fn test_server_signature_mismatch_rejected() {
        let mut client =
            ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", CLIENT_NONCE);
        client.client_first().unwrap();
        client.handle_server_first(SERVER_FIRST.as_bytes()).unwrap();

        let result = client.verify_server_final(b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAA=");
        assert!(result.is_err());
    }

    #[test]
    fn test_server_error_attribute_surfaced() {
        let mut client =
            ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", CLIENT_NONCE);
        client.client_first().unwrap();
        client.handle_server_first(SERVER_FIRST.as_bytes()).unwrap();

        let err = client
            .verify_server_final(b"e=invalid-proof")
            .unwrap_err();
        assert!(err.to_string().contains("invalid-proof"));
    }

    #[test]
    fn test_tampered_nonce_rejected() {
        let mut client =
            ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", CLIENT_NONCE);
        client.client_first().unwrap();

        let tampered = "r=attacker-nonce,s=QSXCR+Q6sek8bf92,i=4096";
        assert!(client.handle_server_first(tampered.as_bytes()).is_err());
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let mut client =
            ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", CLIENT_NONCE);
        client.client_first().unwrap();

        let bogus = "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=0";
        assert!(client.handle_server_first(bogus.as_bytes()).is_err());
    }

    #[test]
    fn test_username_escaping() {
        assert_eq!(saslname("us=er,name"), "us=3Der=2Cname");
        assert_eq!(saslname("plain"), "plain");
    }

    #[test]
    fn test_sha256_and_sha512_exchanges_differ() {
        // Same inputs must yield different proofs across hash functions.
        let server_first =
            "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096";
        let mut sha256 =
            ScramClient::with_nonce(ScramHash::Sha256, "user", "pencil", CLIENT_NONCE);
        let mut sha512 =
            ScramClient::with_nonce(ScramHash::Sha512, "user", "pencil", CLIENT_NONCE);
        sha256.client_first().unwrap();
        sha512.client_first().unwrap();

        let final256 = sha256.handle_server_first(server_first.as_bytes()).unwrap();
        let final512 = sha512.handle_server_first(server_first.as_bytes()).unwrap();
        assert_ne!(final256, final512);
    }

    #[test]
    fn test_random_nonce_charset() {
        let nonce = random_nonce();
        assert_eq!(nonce.len(), 24);
        assert!(nonce.chars().all(|c| c.is_ascii_alphanumeric()));
    }
}
