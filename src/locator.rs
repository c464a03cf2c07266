// Copyright 2020 Joyent, Inc.

//! Locators: the address and transport configuration of a remote endpoint.
//!
//! A locator has the conceptual form
//! `transport://host:port/path?key1=val1&key2=val2`.  It is immutable once
//! built, and equality covers every component including the parameter map,
//! which makes it usable as a registry or pool key.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use url::form_urlencoded;
use url::Url;

use crate::error::{RemotingError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Locator {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    parameters: BTreeMap<String, String>,
}

impl Locator {
    pub fn new<P: Into<String>, H: Into<String>>(protocol: P, host: H, port: u16) -> Locator {
        Locator {
            protocol: protocol.into().to_ascii_lowercase(),
            host: host.into(),
            port,
            path: String::new(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn parse(uri: &str) -> Result<Locator> {
        let malformed = |reason: &str| RemotingError::MalformedLocator {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let url = Url::parse(uri.trim()).map_err(|e| malformed(&e.to_string()))?;
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']'),
            _ => return Err(malformed("missing host")),
        };
        if !url.username().is_empty() || url.password().is_some() {
            return Err(malformed("user information is not supported"));
        }

        let parameters = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        Ok(Locator {
            protocol: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port_or_known_default().unwrap_or(0),
            path: url.path().trim_start_matches('/').to_string(),
            parameters,
        })
    }

    pub fn with_path<P: Into<String>>(mut self, path: P) -> Locator {
        self.path = path.into().trim_start_matches('/').to_string();
        self
    }

    pub fn with_parameter<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Locator {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Same endpoint, different port.  Used once a server bound an ephemeral
    /// port and needs to publish the address it actually listens on.
    pub fn with_port(mut self, port: u16) -> Locator {
        self.port = port;
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Transport-independent endpoint identity: everything except parameters.
    pub fn endpoint(&self) -> String {
        format!("{}://{}/{}", self.protocol, self.address(), self.path)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| RemotingError::CannotConnect {
                locator: self.locator_uri(),
                source: e,
            })?
            .next()
            .ok_or_else(|| RemotingError::MalformedLocator {
                uri: self.locator_uri(),
                reason: String::from("host did not resolve to any address"),
            })
    }

    pub fn locator_uri(&self) -> String {
        let mut uri = format!("{}://{}/{}", self.protocol, self.address(), self.path);
        if !self.parameters.is_empty() {
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(self.parameters.iter())
                .finish();
            uri.push('?');
            uri.push_str(&query);
        }
        uri
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.locator_uri())
    }
}

impl FromStr for Locator {
    type Err = RemotingError;

    fn from_str(s: &str) -> Result<Locator> {
        Locator::parse(s)
    }
}

impl Serialize for Locator {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Locator {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Locator, D::Error> {
        let uri = String::deserialize(deserializer)?;
        Locator::parse(&uri).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{quickcheck, Arbitrary, Gen};

    #[test]
    fn parse_components() {
        let l = Locator::parse("socket://Localhost:5400/invoker?timeout=3000&clientLease=true").unwrap();
        assert_eq!(l.protocol(), "socket");
        assert_eq!(l.host(), "Localhost");
        assert_eq!(l.port(), 5400);
        assert_eq!(l.path(), "invoker");
        assert_eq!(l.parameter("timeout"), Some("3000"));
        assert_eq!(l.parameter("clientLease"), Some("true"));
        assert_eq!(l.address(), "Localhost:5400");
    }

    #[test]
    fn parameter_order_does_not_matter() {
        let a = Locator::parse("http://h:80/?a=1&b=2").unwrap();
        let b = Locator::parse("http://h:80?b=2&a=1").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn ipv6_hosts() {
        let l = Locator::parse("socket://[::1]:7000/").unwrap();
        assert_eq!(l.host(), "::1");
        assert_eq!(l.locator_uri(), "socket://[::1]:7000/");
        assert_eq!(Locator::parse(&l.locator_uri()).unwrap(), l);
    }

    #[test]
    fn malformed() {
        for uri in &["", "no scheme here", "socket:///path", "socket:opaque", "socket://user@h:1/"] {
            match Locator::parse(uri) {
                Err(RemotingError::MalformedLocator { .. }) => (),
                other => panic!("{:?} parsed as {:?}", uri, other),
            }
        }
    }

    #[test]
    fn serde_as_uri_string() {
        let l = Locator::new("socket", "127.0.0.1", 4446).with_parameter("a", "b c");
        let json = serde_json::to_string(&l).unwrap();
        let back: Locator = serde_json::from_str(&json).unwrap();
        assert_eq!(l, back);
    }

    #[derive(Clone, Debug)]
    struct ArbitraryLocator(Locator);

    // Labels start with a letter so that special schemes never read them as
    // IPv4 components.
    fn alnum(g: &mut Gen, min: usize) -> String {
        let letters: Vec<char> = "abcdefghijklmnopqrstuvwxyz".chars().collect();
        let chars: Vec<char> = "abcdefghijklmnopqrstuvwxyz0123456789".chars().collect();
        let len = min + usize::arbitrary(g) % 8;
        let mut s: String = g.choose(&letters).into_iter().collect();
        s.extend((1..len.max(1)).map(|_| *g.choose(&chars).unwrap()));
        s
    }

    impl Arbitrary for ArbitraryLocator {
        fn arbitrary(g: &mut Gen) -> ArbitraryLocator {
            let protocol = *g.choose(&["socket", "http", "bisocket", "multiplex", "local"]).unwrap();
            let labels = 1 + usize::arbitrary(g) % 3;
            let host = (0..labels).map(|_| alnum(g, 1)).collect::<Vec<_>>().join(".");
            let segments = usize::arbitrary(g) % 3;
            let path = (0..segments).map(|_| alnum(g, 1)).collect::<Vec<_>>().join("/");
            let mut locator = Locator::new(protocol, host, u16::arbitrary(g)).with_path(path);
            for _ in 0..(usize::arbitrary(g) % 4) {
                let value: String = String::arbitrary(g).chars().filter(|c| *c != '\0').collect();
                locator = locator.with_parameter(alnum(g, 1), value);
            }
            ArbitraryLocator(locator)
        }
    }

    quickcheck! {
        fn locator_uri_round_trips(l: ArbitraryLocator) -> bool {
            let uri = l.0.locator_uri();
            let parsed = Locator::parse(&uri).unwrap();
            parsed == l.0 && Locator::parse(&parsed.locator_uri()).unwrap() == parsed
        }
    }
}
