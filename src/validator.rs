//! Given `(ip, port)`, probe the candidate through itself as an HTTP proxy
//! against a fixed ping endpoint, and report whether it forwarded traffic,
//! how fast, and how anonymously (spec §4.B).

use crate::model::Anonymity;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationResult {
    pub ok: bool,
    pub rtt_ms: u64,
    pub anonymity: Anonymity,
}

impl ValidationResult {
    fn failure() -> Self {
        ValidationResult {
            ok: false,
            rtt_ms: 0,
            anonymity: Anonymity::Transparent,
        }
    }
}

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, ip: &str, port: &str) -> ValidationResult;
}

#[derive(Deserialize)]
struct PingResponse {
    #[allow(dead_code)]
    err_code: i64,
    anonymity: i64,
}

/// Validates proxies by tunnelling a real HTTP request through them.
/// Stateless and `Clone`; safe to share across all of the center's
/// worker tasks.
#[derive(Clone)]
pub struct HttpValidator {
    validation_url: url::Url,
    timeout: Duration,
}

impl HttpValidator {
    pub fn new(validation_url: url::Url, timeout: Duration) -> Self {
        HttpValidator {
            validation_url,
            timeout,
        }
    }
}

#[async_trait]
impl Validator for HttpValidator {
    async fn validate(&self, ip: &str, port: &str) -> ValidationResult {
        let proxy_url = format!("http://{ip}:{port}");
        let proxy = match reqwest::Proxy::http(&proxy_url) {
            Ok(p) => p,
            Err(_) => return ValidationResult::failure(),
        };
        let client = match reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
        {
            Ok(c) => c,
            Err(_) => return ValidationResult::failure(),
        };

        let start = Instant::now();
        let response = client
            .get(self.validation_url.clone())
            .query(&[("ip", ip)])
            .send()
            .await;
        let rtt_ms = start.elapsed().as_millis() as u64;

        let response = match response {
            Ok(r) => r,
            Err(_) => return ValidationResult::failure(),
        };

        match response.json::<PingResponse>().await {
            Ok(parsed) => match Anonymity::from_i64(parsed.anonymity) {
                Some(anonymity) => ValidationResult {
                    ok: true,
                    rtt_ms,
                    anonymity,
                },
                None => ValidationResult::failure(),
            },
            Err(_) => ValidationResult::failure(),
        }
    }
}

/// Given the candidate IP and the observed request headers, reproduce the
/// classification the ping endpoint performs (spec §6). The engine never
/// calls this itself — the ping endpoint is an external collaborator — but
/// it documents the contract the engine's test suite relies on.
pub fn classify_anonymity(candidate_ip: &str, remote_addr: &str, via: &str, forwarded_for: &str) -> Anonymity {
    if forwarded_for.is_empty() && via.is_empty() && (remote_addr == candidate_ip || remote_addr.is_empty()) {
        Anonymity::High
    } else if forwarded_for == candidate_ip && via == candidate_ip && remote_addr == candidate_ip {
        Anonymity::Anonymous
    } else {
        Anonymity::Transparent
    }
}

/// A deterministic, non-networked validator for tests: always returns the
/// configured outcome regardless of the candidate.
#[derive(Clone)]
pub struct FixedValidator {
    pub ok: bool,
    pub rtt_ms: u64,
    pub anonymity: Anonymity,
}

impl FixedValidator {
    pub fn always_ok(rtt_ms: u64, anonymity: Anonymity) -> Self {
        FixedValidator {
            ok: true,
            rtt_ms,
            anonymity,
        }
    }

    pub fn always_fails() -> Self {
        FixedValidator {
            ok: false,
            rtt_ms: 0,
            anonymity: Anonymity::Transparent,
        }
    }
}

#[async_trait]
impl Validator for FixedValidator {
    async fn validate(&self, _ip: &str, _port: &str) -> ValidationResult {
        ValidationResult {
            ok: self.ok,
            rtt_ms: self.rtt_ms,
            anonymity: self.anonymity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_high_anonymity() {
        let a = classify_anonymity("1.2.3.4", "1.2.3.4", "", "");
        assert_eq!(a, Anonymity::High);
        let a2 = classify_anonymity("1.2.3.4", "", "", "");
        assert_eq!(a2, Anonymity::High);
    }

    #[test]
    fn classifies_anonymous() {
        let a = classify_anonymity("1.2.3.4", "1.2.3.4", "1.2.3.4", "1.2.3.4");
        assert_eq!(a, Anonymity::Anonymous);
    }

    #[test]
    fn classifies_transparent_otherwise() {
        let a = classify_anonymity("1.2.3.4", "5.6.7.8", "1.2.3.4", "1.2.3.4");
        assert_eq!(a, Anonymity::Transparent);
    }

    #[tokio::test]
    async fn fixed_validator_reports_configured_outcome() {
        let v = FixedValidator::always_ok(42, Anonymity::High);
        let result = v.validate("1.1.1.1", "80").await;
        assert!(result.ok);
        assert_eq!(result.rtt_ms, 42);
        assert_eq!(result.anonymity, Anonymity::High);

        let failing = FixedValidator::always_fails();
        assert!(!failing.validate("2.2.2.2", "80").await.ok);
    }
}
