//! HTTP-200 readiness probe: a bare `GET` that is healthy iff the
//! response status is exactly 200.

use super::{Probe, ProbeError};

pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl Probe for HttpHealthProbe {
    async fn check(&mut self) -> Result<bool, ProbeError> {
        let response = self.client.get(&self.url).send().await?;
        Ok(response.status() == reqwest::StatusCode::OK)
    }
}
