//! Block Agent Client
//!
//! Implements [`VolumeBackend`] on top of the block agent gRPC API.
//! Idempotent calls are retried with exponential backoff on transient
//! failures; disk creation is attempted exactly once per request.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, warn};

use crate::agent::{
    AttachDiskRequest, CreateDiskRequest, DeleteDiskRequest, FindDisksByTagRequest,
    block_agent_client::BlockAgentClient,
};
use crate::backend::{BackendCall, BackendError, Result, VolumeBackend};
use crate::config::CloudConfig;
use crate::metrics;

/// Maximum number of retry attempts for transient failures
const MAX_RETRIES: u32 = 3;
/// Initial backoff delay in milliseconds
const INITIAL_BACKOFF_MS: u64 = 100;
/// Maximum backoff delay in milliseconds
const MAX_BACKOFF_MS: u64 = 5000;
/// Backoff multiplier (exponential factor)
const BACKOFF_MULTIPLIER: u64 = 2;

/// TLS configuration for connecting to the block agent
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub domain: String,
}

/// Check if a gRPC status code indicates a retryable error.
///
/// Retryable errors are transient failures that may succeed on retry:
/// - Unavailable: Server temporarily unavailable
/// - ResourceExhausted: Rate limited, may succeed after backoff
/// - Aborted: Operation aborted, can be retried
/// - Unknown: Unknown error, might be transient
fn is_retryable(status: &tonic::Status) -> bool {
    matches!(
        status.code(),
        tonic::Code::Unavailable
            | tonic::Code::ResourceExhausted
            | tonic::Code::Aborted
            | tonic::Code::Unknown
    )
}

/// Map an agent status onto the backend error taxonomy.
fn to_backend_error(status: tonic::Status) -> BackendError {
    match status.code() {
        tonic::Code::NotFound => BackendError::NotFound(status.message().to_string()),
        tonic::Code::Unavailable => BackendError::Unavailable(status.message().to_string()),
        tonic::Code::InvalidArgument => {
            BackendError::InvalidRequest(status.message().to_string())
        }
        _ => BackendError::Api(status.message().to_string()),
    }
}

/// Execute an async operation with exponential backoff retry.
///
/// Retries the operation up to MAX_RETRIES times for retryable errors,
/// with exponential backoff between attempts.
async fn with_retry<T, F, Fut>(call: BackendCall, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, tonic::Status>>,
{
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(status) => {
                attempt += 1;

                if !is_retryable(&status) || attempt > MAX_RETRIES {
                    if attempt > 1 {
                        warn!(
                            call = %call,
                            attempts = attempt,
                            code = ?status.code(),
                            "Backend call failed after retries"
                        );
                    }
                    return Err(to_backend_error(status));
                }

                warn!(
                    call = %call,
                    attempt = attempt,
                    max_retries = MAX_RETRIES,
                    code = ?status.code(),
                    backoff_ms = backoff_ms,
                    "Retryable error, backing off"
                );

                metrics::record_retry(call.as_str());

                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;

                backoff_ms = (backoff_ms * BACKOFF_MULTIPLIER).min(MAX_BACKOFF_MS);
            }
        }
    }
}

/// Block agent backed implementation of [`VolumeBackend`].
#[derive(Debug, Clone)]
pub struct AgentBackend {
    client: BlockAgentClient<Channel>,
    cloud: CloudConfig,
}

impl AgentBackend {
    /// Build a backend over an already established channel.
    pub fn new(channel: Channel, cloud: CloudConfig) -> Self {
        Self {
            client: BlockAgentClient::new(channel),
            cloud,
        }
    }

    /// Connect to the block agent with optional mTLS and robust connection settings.
    ///
    /// Connection settings:
    /// - 10 second connect timeout (fail fast if agent unreachable)
    /// - 30 second request timeout
    /// - TCP keepalive every 60 seconds
    /// - HTTP/2 keepalive every 30 seconds with 10 second timeout
    pub async fn connect(
        endpoint: &str,
        tls: Option<TlsConfig>,
        cloud: CloudConfig,
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let mut endpoint_builder = Endpoint::from_shared(endpoint.to_string())?
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .tcp_nodelay(true)
            .http2_keep_alive_interval(Duration::from_secs(30))
            .keep_alive_timeout(Duration::from_secs(10))
            .keep_alive_while_idle(true);

        if let Some(tls) = tls {
            let cert = tokio::fs::read(&tls.cert_path).await?;
            let key = tokio::fs::read(&tls.key_path).await?;
            let ca = tokio::fs::read(&tls.ca_path).await?;

            let tls_config = ClientTlsConfig::new()
                .identity(Identity::from_pem(cert, key))
                .ca_certificate(Certificate::from_pem(ca))
                .domain_name(&tls.domain);

            endpoint_builder = endpoint_builder.tls_config(tls_config)?;
        }

        // Connection is established on the first backend call
        let channel = endpoint_builder.connect_lazy();
        Ok(Self::new(channel, cloud))
    }

    /// Wrap a message with the credential metadata the agent expects.
    fn request<T>(&self, message: T) -> std::result::Result<tonic::Request<T>, tonic::Status> {
        let mut request = tonic::Request::new(message);
        let metadata = request.metadata_mut();

        let fields = [
            ("x-region", Some(&self.cloud.region)),
            ("x-access-key-id", self.cloud.access_key_id.as_ref()),
            ("x-secret-access-key", self.cloud.secret_access_key.as_ref()),
            ("x-role-arn", self.cloud.role_arn.as_ref()),
        ];
        for (key, value) in fields {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                let value: MetadataValue<_> = value.parse().map_err(|_| {
                    tonic::Status::invalid_argument(format!("{} is not valid metadata", key))
                })?;
                metadata.insert(key, value);
            }
        }

        Ok(request)
    }
}

#[tonic::async_trait]
impl VolumeBackend for AgentBackend {
    async fn create_disk(
        &self,
        capacity_gib: i64,
        tags: HashMap<String, String>,
    ) -> Result<String> {
        debug!(capacity_gib, "Creating disk via agent");

        // Never retried: the agent may have created the disk even when the
        // response is lost. Tag discovery on the next CreateVolume recovers it.
        let request = self
            .request(CreateDiskRequest { capacity_gib, tags })
            .map_err(to_backend_error)?;
        let response = self
            .client
            .clone()
            .create_disk(request)
            .await
            .map_err(to_backend_error)?;

        let volume_id = response.into_inner().volume_id;
        if volume_id.is_empty() {
            return Err(BackendError::Api("agent returned empty volume id".into()));
        }
        Ok(volume_id)
    }

    async fn delete_disk(&self, handle: &str) -> Result<()> {
        debug!(volume_id = handle, "Deleting disk via agent with retry");

        with_retry(BackendCall::DeleteDisk, || {
            let request = self.request(DeleteDiskRequest {
                volume_id: handle.to_string(),
            });
            let mut client = self.client.clone();
            async move {
                client.delete_disk(request?).await?;
                Ok(())
            }
        })
        .await
    }

    async fn attach_disk(&self, handle: &str, node_id: &str) -> Result<String> {
        debug!(volume_id = handle, node_id = node_id, "Attaching disk via agent with retry");

        with_retry(BackendCall::AttachDisk, || {
            let request = self.request(AttachDiskRequest {
                volume_id: handle.to_string(),
                node_id: node_id.to_string(),
            });
            let mut client = self.client.clone();
            async move {
                let response = client.attach_disk(request?).await?;
                let device_path = response.into_inner().device_path;
                if device_path.is_empty() {
                    return Err(tonic::Status::internal("agent returned empty device path"));
                }
                Ok(device_path)
            }
        })
        .await
    }

    async fn find_volumes_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>> {
        debug!(key = key, value = value, "Finding disks by tag via agent with retry");

        with_retry(BackendCall::FindVolumesByTag, || {
            let request = self.request(FindDisksByTagRequest {
                key: key.to_string(),
                value: value.to_string(),
            });
            let mut client = self.client.clone();
            async move {
                let response = client.find_disks_by_tag(request?).await?;
                Ok(response.into_inner().volume_ids)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_is_retryable() {
        // Retryable errors
        assert!(is_retryable(&tonic::Status::unavailable("server down")));
        assert!(is_retryable(&tonic::Status::resource_exhausted(
            "rate limited"
        )));
        assert!(is_retryable(&tonic::Status::aborted("transaction aborted")));
        assert!(is_retryable(&tonic::Status::unknown("unknown error")));

        // Non-retryable errors
        assert!(!is_retryable(&tonic::Status::not_found("not found")));
        assert!(!is_retryable(&tonic::Status::invalid_argument("bad arg")));
        assert!(!is_retryable(&tonic::Status::permission_denied("denied")));
        assert!(!is_retryable(&tonic::Status::internal("internal error")));
    }

    #[test]
    fn test_to_backend_error() {
        assert_eq!(
            to_backend_error(tonic::Status::not_found("vol-1")),
            BackendError::NotFound("vol-1".into())
        );
        assert_eq!(
            to_backend_error(tonic::Status::unavailable("down")),
            BackendError::Unavailable("down".into())
        );
        assert_eq!(
            to_backend_error(tonic::Status::invalid_argument("bad size")),
            BackendError::InvalidRequest("bad size".into())
        );
        // Message is preserved verbatim for the controller to surface
        assert_eq!(
            to_backend_error(tonic::Status::internal("VolumeLimitExceeded")).to_string(),
            "VolumeLimitExceeded"
        );
    }

    #[tokio::test]
    async fn test_with_retry_success_first_attempt() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(BackendCall::DeleteDisk, || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_success_after_retries() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(BackendCall::AttachDisk, || {
            let c = counter_clone.clone();
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt < 3 {
                    Err(tonic::Status::unavailable("temporarily unavailable"))
                } else {
                    Ok("/dev/xvdf")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "/dev/xvdf");
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_non_retryable_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<()> = with_retry(BackendCall::DeleteDisk, || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(tonic::Status::not_found("vol-1"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), BackendError::NotFound("vol-1".into()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<()> = with_retry(BackendCall::FindVolumesByTag, || {
            let c = counter_clone.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(tonic::Status::unavailable("always unavailable"))
            }
        })
        .await;

        assert!(matches!(result, Err(BackendError::Unavailable(_))));
        // Initial attempt plus MAX_RETRIES retries
        assert_eq!(counter.load(Ordering::SeqCst), MAX_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_request_carries_credentials() {
        let channel = Endpoint::from_static("http://127.0.0.1:1").connect_lazy();
        let backend = AgentBackend::new(
            channel,
            CloudConfig {
                region: "eu-central-1".into(),
                access_key_id: Some("AKID".into()),
                secret_access_key: Some("secret".into()),
                role_arn: None,
            },
        );

        let request = backend.request(()).unwrap();
        let metadata = request.metadata();
        let get = |key: &str| metadata.get(key).and_then(|v| v.to_str().ok());
        assert_eq!(get("x-region"), Some("eu-central-1"));
        assert_eq!(get("x-access-key-id"), Some("AKID"));
        assert_eq!(get("x-secret-access-key"), Some("secret"));
        assert!(metadata.get("x-role-arn").is_none());
    }
}
