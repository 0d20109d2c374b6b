// Lease issuer: the remote licensing service

use crate::errors::LeaseError;
use crate::models::{Lease, LicenseCredentials, LicenseTier};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Network capability for obtaining leases. Implementations must be safe to
/// retry; the caller bounds each call with its own timeout.
#[async_trait]
pub trait LeaseIssuer: Send + Sync {
    async fn request_lease(&self, credentials: &LicenseCredentials) -> Result<Lease, LeaseError>;

    async fn renew_lease(&self, token: &str) -> Result<Lease, LeaseError>;
}

#[derive(Debug, Serialize)]
struct LeaseRequest<'a> {
    install_id: &'a str,
    secret: &'a str,
}

#[derive(Debug, Serialize)]
struct RenewRequest<'a> {
    token: &'a str,
}

/// Issuer response body
#[derive(Debug, Deserialize)]
pub struct LeaseResponse {
    pub token: String,
    #[serde(default)]
    pub tier: LicenseTier,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub issued_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub grace_until: Option<DateTime<Utc>>,
}

impl LeaseResponse {
    /// Convert to a lease. Missing `grace_until` defaults to
    /// `expires_at + grace_period`.
    pub fn into_lease(self, now: DateTime<Utc>, grace_period: Duration) -> Result<Lease, LeaseError> {
        if self.token.is_empty() {
            return Err(LeaseError::InvalidLease("empty token".to_string()));
        }
        let issued_at = self.issued_at.unwrap_or(now);
        let expires_at = match (self.expires_at, self.ttl_seconds) {
            (Some(at), _) => at,
            (None, Some(ttl)) => issued_at + TimeDelta::seconds(ttl as i64),
            (None, None) => {
                return Err(LeaseError::InvalidLease(
                    "neither expires_at nor ttl_seconds present".to_string(),
                ))
            }
        };
        if expires_at <= issued_at {
            return Err(LeaseError::InvalidLease(format!(
                "lease expires at {} before it was issued at {}",
                expires_at, issued_at
            )));
        }
        let grace = TimeDelta::from_std(grace_period).unwrap_or(TimeDelta::zero());
        let grace_until = self.grace_until.unwrap_or(expires_at + grace);

        Ok(Lease::new(
            self.token,
            issued_at,
            expires_at,
            grace_until,
            self.tier,
            self.features,
        ))
    }
}

/// HTTP lease issuer
pub struct HttpLeaseIssuer {
    client: Client,
    endpoint: String,
    timeout_seconds: u64,
    grace_period: Duration,
}

impl HttpLeaseIssuer {
    pub fn new(
        endpoint: impl Into<String>,
        timeout_seconds: u64,
        grace_period: Duration,
    ) -> Result<Self, LeaseError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| LeaseError::Request(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            timeout_seconds,
            grace_period,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> LeaseError {
        if err.is_timeout() {
            LeaseError::Timeout(self.timeout_seconds)
        } else {
            err.into()
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Lease, LeaseError> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(LeaseError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: LeaseResponse = response.json().await.map_err(|e| self.map_error(e))?;
        debug!(url = %url, tier = %body.tier, "Lease response received");
        body.into_lease(Utc::now(), self.grace_period)
    }
}

#[async_trait]
impl LeaseIssuer for HttpLeaseIssuer {
    #[instrument(skip(self, credentials), fields(install_id = %credentials.install_id))]
    async fn request_lease(&self, credentials: &LicenseCredentials) -> Result<Lease, LeaseError> {
        self.post(
            "/leases",
            &LeaseRequest {
                install_id: &credentials.install_id,
                secret: &credentials.install_secret,
            },
        )
        .await
    }

    #[instrument(skip(self, token))]
    async fn renew_lease(&self, token: &str) -> Result<Lease, LeaseError> {
        self.post("/leases/renew", &RenewRequest { token }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credentials() -> LicenseCredentials {
        LicenseCredentials {
            install_id: "install-1".to_string(),
            install_secret: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_response_with_ttl_gets_default_grace() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let response = LeaseResponse {
            token: "tok".into(),
            tier: LicenseTier::Premium,
            features: vec![],
            issued_at: None,
            expires_at: None,
            ttl_seconds: Some(3600),
            grace_until: None,
        };
        let lease = response.into_lease(now, Duration::from_secs(300)).unwrap();
        assert_eq!(lease.expires_at, now + TimeDelta::seconds(3600));
        assert_eq!(lease.grace_until, now + TimeDelta::seconds(3900));
    }

    #[test]
    fn test_response_without_expiry_is_invalid() {
        let response = LeaseResponse {
            token: "tok".into(),
            tier: LicenseTier::Basic,
            features: vec![],
            issued_at: None,
            expires_at: None,
            ttl_seconds: None,
            grace_until: None,
        };
        assert!(matches!(
            response.into_lease(Utc::now(), Duration::ZERO),
            Err(LeaseError::InvalidLease(_))
        ));
    }

    #[tokio::test]
    async fn test_request_lease_posts_credentials() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leases"))
            .and(body_json(serde_json::json!({
                "install_id": "install-1",
                "secret": "s3cret"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "lease-token",
                "tier": "ultimate",
                "features": ["multi_destination"],
                "ttl_seconds": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let issuer = HttpLeaseIssuer::new(mock_server.uri(), 5, Duration::from_secs(600)).unwrap();
        let lease = issuer.request_lease(&credentials()).await.unwrap();

        assert_eq!(lease.token, "lease-token");
        assert_eq!(lease.tier, LicenseTier::Ultimate);
        assert!(lease.has_feature("multi_destination"));
        assert!(lease.has_feature("hot_swap_immediate"));
        assert_eq!(lease.grace_until - lease.expires_at, TimeDelta::seconds(600));
    }

    #[tokio::test]
    async fn test_renew_lease_posts_token() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leases/renew"))
            .and(body_json(serde_json::json!({ "token": "old-token" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token": "new-token",
                "tier": "basic",
                "expires_at": "2030-01-01T00:00:00Z",
                "grace_until": "2030-01-01T06:00:00Z"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let issuer = HttpLeaseIssuer::new(mock_server.uri(), 5, Duration::from_secs(600)).unwrap();
        let lease = issuer.renew_lease("old-token").await.unwrap();
        assert_eq!(lease.token, "new-token");
        assert_eq!(
            lease.grace_until,
            Utc.with_ymd_and_hms(2030, 1, 1, 6, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_rejection_surfaces_status() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leases/renew"))
            .respond_with(ResponseTemplate::new(403).set_body_string("revoked"))
            .mount(&mock_server)
            .await;

        let issuer = HttpLeaseIssuer::new(mock_server.uri(), 5, Duration::ZERO).unwrap();
        match issuer.renew_lease("tok").await {
            Err(LeaseError::Rejected { status, message }) => {
                assert_eq!(status, 403);
                assert_eq!(message, "revoked");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_slow_issuer_times_out() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/leases"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&mock_server)
            .await;

        let issuer = HttpLeaseIssuer::new(mock_server.uri(), 1, Duration::ZERO).unwrap();
        assert!(matches!(
            issuer.request_lease(&credentials()).await,
            Err(LeaseError::Timeout(1))
        ));
    }
}
