//! Remote node (repeater/room server) operations.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::event::{Event, Filter, LoginInfo};
use crate::session::Session;
use crate::types::{PublicKey, RemoteNodeStatus, TelemetryReading};

/// Login timeout floor.
const LOGIN_BASE: Duration = Duration::from_secs(5);

/// Extra login allowance per path hop.
const LOGIN_PER_HOP: Duration = Duration::from_secs(10);

/// Login timeout ceiling.
const LOGIN_CAP: Duration = Duration::from_secs(60);

/// Authenticated operations against repeaters and room servers.
pub struct RemoteNodeService {
    session: Session,
}

impl RemoteNodeService {
    /// Creates the service.
    #[must_use]
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self { session })
    }

    /// Timeout for a login expected to traverse `path_hops` repeaters.
    #[must_use]
    pub fn login_timeout(path_hops: u8) -> Duration {
        (LOGIN_BASE + LOGIN_PER_HOP * u32::from(path_hops)).min(LOGIN_CAP)
    }

    /// Logs into a remote node.
    ///
    /// Submits the login, then awaits the node's `loginSuccess` or
    /// `loginFail` push correlated by key prefix, with the timeout scaled
    /// to the path length.
    pub async fn login(
        &self,
        public_key: &PublicKey,
        password: &str,
        path_hops: u8,
    ) -> Result<LoginInfo> {
        let prefix = public_key.prefix();
        let wanted = prefix.as_bytes().to_vec();
        // Subscribe before submitting so a fast response cannot slip by.
        let mut outcomes = self.session.bus().subscribe(Filter::custom(move |event| {
            matches!(
                event,
                Event::LoginSuccess(_) | Event::LoginFail { .. }
            ) && event.prefix().is_some_and(|p| p.starts_with(&wanted))
        }));

        self.session.send_login(public_key, password).await?;

        let timeout = Self::login_timeout(path_hops);
        let outcome = tokio::time::timeout(timeout, outcomes.recv())
            .await
            .map_err(|_| Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?;

        match outcome {
            Some(Event::LoginSuccess(info)) => {
                tracing::info!(node = %prefix, admin = info.is_admin, "login accepted");
                Ok(info)
            }
            Some(Event::LoginFail { .. }) => {
                tracing::info!(node = %prefix, "login rejected");
                Err(Error::Device { code: None })
            }
            _ => Err(Error::Cancelled),
        }
    }

    /// Logs out from a remote node.
    pub async fn logout(&self, public_key: &PublicKey) -> Result<()> {
        self.session.logout(public_key).await
    }

    /// Whether the device still holds a connection to the node.
    pub async fn has_connection(&self, public_key: &PublicKey) -> Result<bool> {
        self.session.has_connection(public_key).await
    }

    /// Requests a remote node's status and awaits its report.
    pub async fn request_status(&self, public_key: &PublicKey) -> Result<RemoteNodeStatus> {
        let prefix = public_key.prefix();
        let mut responses = self
            .session
            .bus()
            .subscribe(Filter::status_response(Some(prefix.as_bytes())));

        let receipt = self.session.send_status_req(public_key).await?;
        let timeout = response_timeout(receipt.suggested_timeout_ms);

        match tokio::time::timeout(timeout, responses.recv()).await {
            Ok(Some(Event::StatusResponse(status))) => Ok(*status),
            Ok(_) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Requests remote telemetry and awaits the readings.
    pub async fn request_telemetry(
        &self,
        public_key: &PublicKey,
    ) -> Result<Vec<TelemetryReading>> {
        let prefix = public_key.prefix();
        let mut responses = self
            .session
            .bus()
            .subscribe(Filter::telemetry_response(Some(prefix.as_bytes())));

        let receipt = self.session.send_telemetry_req(public_key).await?;
        let timeout = response_timeout(receipt.suggested_timeout_ms);

        match tokio::time::timeout(timeout, responses.recv()).await {
            Ok(Some(Event::TelemetryResponse { readings, .. })) => Ok(readings),
            Ok(_) => Err(Error::Cancelled),
            Err(_) => Err(Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Sends a typed binary request; the response arrives on the bus.
    pub async fn send_binary_request(
        &self,
        public_key: &PublicKey,
        request_type: u8,
        data: &[u8],
    ) -> Result<u32> {
        let receipt = self
            .session
            .send_binary_req(public_key, request_type, data)
            .await?;
        Ok(receipt.ack_code())
    }
}

/// Push-response timeout derived from the device's round-trip estimate.
fn response_timeout(suggested_ms: u32) -> Duration {
    Duration::from_millis(u64::from(suggested_ms))
        .max(Duration::from_secs(5))
        .min(Duration::from_secs(60))
}
