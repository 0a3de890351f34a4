//! Connection string parsing.
//!
//! Grammar: `[scheme://]host[,host]*[:port][/bucket][?opt=val&...]` where
//! the scheme is `couchbase` (plain, default KV port 11210) or `couchbases`
//! (TLS, default KV port 11207).

use std::collections::HashMap;

use reef_core::error::{CoreError, Result};
use reef_core::service::ServiceType;

/// Connection scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain connections.
    Couchbase,
    /// TLS connections.
    Couchbases,
}

impl Scheme {
    /// Returns true if this scheme implies TLS.
    pub fn is_tls(self) -> bool {
        matches!(self, Self::Couchbases)
    }
}

/// One seed host from the connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedHost {
    /// Hostname or address.
    pub host: String,
    /// Explicit port, when the host carried one.
    pub port: Option<u16>,
}

impl SeedHost {
    /// Resolves the effective KV port for this seed.
    pub fn kv_port(&self, tls: bool) -> u16 {
        self.port
            .unwrap_or_else(|| ServiceType::Kv.default_port(tls))
    }
}

/// A parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    scheme: Scheme,
    hosts: Vec<SeedHost>,
    bucket: Option<String>,
    params: HashMap<String, String>,
}

impl ConnectionString {
    /// Parses a connection string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CoreError::Config(
                "connection string must not be empty".to_string(),
            ));
        }

        let (scheme, rest) = match input.split_once("://") {
            Some(("couchbase", rest)) => (Scheme::Couchbase, rest),
            Some(("couchbases", rest)) => (Scheme::Couchbases, rest),
            Some((other, _)) => {
                return Err(CoreError::Config(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
            None => (Scheme::Couchbase, input),
        };

        let (rest, params) = match rest.split_once('?') {
            Some((rest, query)) => {
                let params = url::form_urlencoded::parse(query.as_bytes())
                    .into_owned()
                    .collect();
                (rest, params)
            }
            None => (rest, HashMap::new()),
        };

        let (host_part, bucket) = match rest.split_once('/') {
            Some((hosts, bucket)) if !bucket.is_empty() => {
                (hosts, Some(bucket.to_string()))
            }
            Some((hosts, _)) => (hosts, None),
            None => (rest, None),
        };

        if host_part.is_empty() {
            return Err(CoreError::Config(
                "connection string carries no hosts".to_string(),
            ));
        }

        let mut hosts = Vec::new();
        for entry in host_part.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let seed = match entry.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse::<u16>().map_err(|_| {
                        CoreError::Config(format!("invalid port in '{}'", entry))
                    })?;
                    SeedHost {
                        host: host.to_string(),
                        port: Some(port),
                    }
                }
                None => SeedHost {
                    host: entry.to_string(),
                    port: None,
                },
            };
            if seed.host.is_empty() {
                return Err(CoreError::Config(format!("invalid host in '{}'", entry)));
            }
            hosts.push(seed);
        }

        if hosts.is_empty() {
            return Err(CoreError::Config(
                "connection string carries no hosts".to_string(),
            ));
        }

        Ok(Self {
            scheme,
            hosts,
            bucket,
            params,
        })
    }

    /// Returns the parsed scheme.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Returns true if the scheme implies TLS.
    pub fn is_tls(&self) -> bool {
        self.scheme.is_tls()
    }

    /// Returns the seed hosts.
    pub fn hosts(&self) -> &[SeedHost] {
        &self.hosts
    }

    /// Returns the bucket, when the path names one.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns a query option by name.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(|v| v.as_str())
    }

    /// Returns all query options.
    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }
}
