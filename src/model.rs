//! Data model shared by the store adapter, the center, and the pools.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Anonymity level reported by the validation endpoint.
///
/// The numeric values match the wire contract in `validator`: `1`
/// (transparent), `2` (anonymous), `3` (high).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Anonymity {
    Transparent = 1,
    Anonymous = 2,
    High = 3,
}

impl Anonymity {
    pub fn from_i64(v: i64) -> Option<Anonymity> {
        match v {
            1 => Some(Anonymity::Transparent),
            2 => Some(Anonymity::Anonymous),
            3 => Some(Anonymity::High),
            _ => None,
        }
    }
}

impl fmt::Display for Anonymity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Anonymity::Transparent => "transparent",
            Anonymity::Anonymous => "anonymous",
            Anonymity::High => "high",
        };
        write!(f, "{s}")
    }
}

/// A proxy address, always rendered as `"ip:port"` when used as a store
/// member. Parsing is intentionally permissive about the host part (an
/// IPv4 literal or a hostname, per spec) and strict about the port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyAddr {
    pub ip: String,
    pub port: String,
}

#[derive(Debug)]
pub struct ParseProxyAddrError(pub String);

impl fmt::Display for ParseProxyAddrError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "not a valid \"host:port\" proxy address: {}", self.0)
    }
}
impl std::error::Error for ParseProxyAddrError {}

impl std::str::FromStr for ProxyAddr {
    type Err = ParseProxyAddrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ParseProxyAddrError(s.to_string()))?;
        if ip.is_empty() || port.is_empty() {
            return Err(ParseProxyAddrError(s.to_string()));
        }
        if port.parse::<u16>().is_err() {
            return Err(ParseProxyAddrError(s.to_string()));
        }
        Ok(ProxyAddr {
            ip: ip.to_string(),
            port: port.to_string(),
        })
    }
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A validated proxy record, as stored in the global inventory hash
/// `proxy_<ip>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRecord {
    pub ip: String,
    pub port: String,
    pub anonymity: Anonymity,
    pub rtt_ms: u64,
    pub validated_at: i64,
}

impl ProxyRecord {
    pub fn addr(&self) -> ProxyAddr {
        ProxyAddr {
            ip: self.ip.clone(),
            port: self.port.clone(),
        }
    }

    pub fn key(&self) -> String {
        proxy_hash_key(&self.ip, &self.port)
    }
}

pub fn proxy_hash_key(ip: &str, port: &str) -> String {
    format!("proxy_{ip}:{port}")
}

pub const PROXY_KEY_PREFIX: &str = "proxy_";
pub const GLOBAL_BLOCKED_SET: &str = "proxy_blocked";

pub fn channel_pool_key(channel: &str) -> String {
    format!("proxypool_{channel}")
}

pub fn channel_blocked_key(channel: &str) -> String {
    format!("proxypool_blocked_{channel}")
}

/// Members currently leased out of `pool(c)` — popped by a `take()` but
/// not yet returned via `free()`/`delete()`. Internal bookkeeping, not
/// part of the external key layout in spec §6: it exists so replenishment
/// doesn't hand the same member to a second caller while it's checked out
/// (spec §8 "Lease exclusivity" must hold across a replenish, not just
/// across a single `zpop_max`).
pub fn channel_leased_key(channel: &str) -> String {
    format!("proxypool_leased_{channel}")
}

/// A member of a sorted set together with its score, returned by
/// `Store::zpop_max` and `Store::zrange_with_scores`.
///
/// Mirrors `original_source/redis.go`'s `Member{Member, Score}`, widened
/// to `i64` since pool scores (usage counts) and block-set scores (unix
/// timestamps) share the same wire representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub member: String,
    pub score: i64,
}

impl Member {
    pub fn new(member: impl Into<String>, score: i64) -> Self {
        Member {
            member: member.into(),
            score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port() {
        let addr: ProxyAddr = "1.2.3.4:8080".parse().unwrap();
        assert_eq!(addr.ip, "1.2.3.4");
        assert_eq!(addr.port, "8080");
    }

    #[test]
    fn parses_hostname_port() {
        let addr: ProxyAddr = "proxy.example.com:3128".parse().unwrap();
        assert_eq!(addr.ip, "proxy.example.com");
        assert_eq!(addr.port, "3128");
    }

    #[test]
    fn rejects_missing_port() {
        assert!("1.2.3.4".parse::<ProxyAddr>().is_err());
    }

    #[test]
    fn rejects_non_numeric_port() {
        assert!("1.2.3.4:http".parse::<ProxyAddr>().is_err());
    }

    #[test]
    fn renders_proxy_hash_key() {
        assert_eq!(proxy_hash_key("1.2.3.4", "80"), "proxy_1.2.3.4:80");
    }
}
