use crate::{CallSpec, ProviderPayload, ValuationError};
use async_trait::async_trait;

/// Capability to fetch one normalized payload from the upstream provider.
/// Implementations own transport, auth, and wire-format concerns; callers
/// only rely on payload fields being addressable by rawField path strings.
#[async_trait]
pub trait ProviderFetch: Send + Sync {
    async fn fetch(
        &self,
        subject: &str,
        call: &CallSpec,
    ) -> Result<ProviderPayload, ValuationError>;
}
