//! SASL mechanism selection and authentication exchanges.

mod scram;

pub use scram::{ScramClient, ScramHash};

/// SASL mechanisms the client can perform, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    /// SCRAM with SHA-512.
    ScramSha512,
    /// SCRAM with SHA-256.
    ScramSha256,
    /// SCRAM with SHA-1.
    ScramSha1,
    /// Cleartext; only permitted on TLS channels.
    Plain,
}

impl SaslMechanism {
    /// Preference order, strongest first.
    pub const PREFERENCE: [SaslMechanism; 4] = [
        Self::ScramSha512,
        Self::ScramSha256,
        Self::ScramSha1,
        Self::Plain,
    ];

    /// Returns the wire name of the mechanism.
    pub fn name(self) -> &'static str {
        match self {
            Self::ScramSha512 => "SCRAM-SHA512",
            Self::ScramSha256 => "SCRAM-SHA256",
            Self::ScramSha1 => "SCRAM-SHA1",
            Self::Plain => "PLAIN",
        }
    }

    /// Returns the SCRAM hash for SCRAM mechanisms.
    pub fn scram_hash(self) -> Option<ScramHash> {
        match self {
            Self::ScramSha512 => Some(ScramHash::Sha512),
            Self::ScramSha256 => Some(ScramHash::Sha256),
            Self::ScramSha1 => Some(ScramHash::Sha1),
            Self::Plain => None,
        }
    }

    /// Selects the strongest mechanism offered by the server that is
    /// compatible with the channel security.
    ///
    /// `server_mechs` is the space-separated list from `SASL_LIST_MECHS`.
    /// PLAIN is only eligible when the channel is secured with TLS.
    pub fn select(server_mechs: &str, tls: bool) -> Option<Self> {
        let offered: Vec<&str> = server_mechs.split_whitespace().collect();
        Self::PREFERENCE.into_iter().find(|mech| {
            if *mech == Self::Plain && !tls {
                return false;
            }
            offered.iter().any(|name| *name == mech.name())
        })
    }
}

/// Builds the PLAIN initial response: `authzid NUL authcid NUL passwd`.
pub fn plain_payload(username: &str, password: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(username.len() + password.len() + 2);
    payload.push(0);
    payload.extend_from_slice(username.as_bytes());
    payload.push(0);
    payload.extend_from_slice(password.as_bytes());
    payload
}
