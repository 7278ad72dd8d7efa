use reqwest::{Client, RequestBuilder};
use std::time::Duration;

/// One full archive download must finish inside this window.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// API-key pair that takes precedence over the part credentials when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKey {
    pub key_id: String,
    pub key: String,
}

/// Identity the robot presents to the catalog object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    pub part_id: String,
    pub secret: String,
    pub api_key: Option<ApiKey>,
}

/// HTTP client wrapper that stamps every request with the robot's cloud
/// identity.
#[derive(Debug)]
pub struct CloudClient {
    client: Client,
    credentials: CloudCredentials,
}

impl CloudClient {
    pub fn new(credentials: CloudCredentials) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(CloudClient { client, credentials })
    }

    /// An authenticated GET of `url`.
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.authenticate(self.client.get(url))
    }

    /// An authenticated HEAD of `url`.
    pub fn head(&self, url: &str) -> RequestBuilder {
        self.authenticate(self.client.head(url))
    }

    fn authenticate(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials.api_key {
            Some(ApiKey { key_id, key }) => request.header("key_id", key_id).header("key", key),
            None => request
                .header("part_id", &self.credentials.part_id)
                .header("secret", &self.credentials.secret),
        }
    }
}

#[cfg(test)]
pub(crate) fn part_credentials() -> CloudCredentials {
    CloudCredentials {
        part_id: "part-1".to_string(),
        secret: "part-secret".to_string(),
        api_key: None,
    }
}
