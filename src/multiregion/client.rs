use async_trait::async_trait;

use crate::api::ApiClient;
use crate::error::{OrchError, Result};
use crate::model::Deployment;
use crate::multiregion::RegionClient;

/// A peer region reached over its HTTP API.
pub struct HttpRegionClient {
    region: String,
    api: ApiClient,
}

impl HttpRegionClient {
    pub fn new(region: impl Into<String>, api: ApiClient) -> Self {
        Self {
            region: region.into(),
            api,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Transport failures become `RegionUnavailable`; answers from the peer
    /// keep their own error.
    fn unavailable(&self, err: OrchError) -> OrchError {
        match err {
            OrchError::Http(e) => OrchError::RegionUnavailable {
                region: self.region.clone(),
                reason: e.to_string(),
            },
            other => other,
        }
    }
}

#[async_trait]
impl RegionClient for HttpRegionClient {
    async fn latest_deployment(&self, job_id: &str) -> Result<Option<Deployment>> {
        match self.api.job_deployment(job_id).await {
            Ok(d) => Ok(d),
            // The job has not been registered there yet.
            Err(OrchError::Api { status: 404, .. }) => Ok(None),
            Err(err) => Err(self.unavailable(err)),
        }
    }

    async fn promote(&self, job_id: &str) -> Result<()> {
        self.api
            .promote_job_deployment(job_id)
            .await
            .map(|_| ())
            .map_err(|e| self.unavailable(e))
    }

    async fn fail(&self, job_id: &str) -> Result<()> {
        self.api
            .fail_job_deployment(job_id)
            .await
            .map(|_| ())
            .map_err(|e| self.unavailable(e))
    }
}
