//! Driver delegating to a remote configuration agent over HTTP.
//!
//! Each operation is a `POST {url}/api/v1/interfaces/{create|update|delete}` with
//! the interface as JSON body.

use super::{validate, DriverAdapter, DriverError};
use crate::model::{Interface, Operation};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::instrument;
use url::Url;

#[derive(Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub url: Url,
    /// Bearer token sent with each request
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("url", &self.url.as_str())
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to build request: {0}")]
    Request(String),
    #[error("client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("service error ({code}): {}", .error.message)]
    Service {
        code: StatusCode,
        error: ErrorInformation,
    },
    #[error("unexpected response: {0}")]
    Response(StatusCode),
}

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub struct ErrorInformation {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub message: String,
}

impl From<ClientError> for DriverError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Service { error, .. } => Self::Rejected(if error.message.is_empty() {
                error.error
            } else {
                error.message
            }),
            ClientError::Response(code) if code.is_client_error() => {
                Self::Rejected(code.to_string())
            }
            err => Self::Transport(err.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RemoteDriver {
    client: reqwest::Client,
    api: Url,
    token: Option<String>,
}

impl RemoteDriver {
    pub fn new(config: &RemoteConfig) -> Result<Self, reqwest::Error> {
        let mut client = reqwest::Client::builder();
        if let Some(timeout) = config.timeout {
            client = client.timeout(timeout);
        }
        Ok(Self {
            client: client.build()?,
            api: config.url.clone(),
            token: config.token.clone(),
        })
    }

    async fn request<R, F, FR, ResFut>(
        &self,
        method: Method,
        url: Url,
        request_handler: F,
        response_handler: FR,
    ) -> Result<R, ClientError>
    where
        F: FnOnce(RequestBuilder) -> RequestBuilder,
        FR: FnOnce(Response) -> ResFut,
        ResFut: Future<Output = Result<R, ClientError>>,
    {
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let request = request_handler(request);
        let response = request.send().await?;

        response_handler(response).await
    }

    fn url(&self, path: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.api.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Request("Failed to build path".to_string()))?
            .pop_if_empty()
            .extend(path);
        Ok(url)
    }

    #[instrument(
        skip_all, err,
        fields(%operation, name = %interface.metadata.name, identifier = %interface.spec.interface_identifier)
    )]
    async fn send(&self, operation: Operation, interface: &Interface) -> Result<(), ClientError> {
        let action = operation.to_string();
        self.request(
            Method::POST,
            self.url(&["api", "v1", "interfaces", &action])?,
            json(interface),
            apply_response,
        )
        .await
    }

    async fn call(&self, operation: Operation, interface: &Interface) -> Result<(), DriverError> {
        if operation != Operation::Delete {
            validate(interface)?;
        }
        Ok(self.send(operation, interface).await?)
    }
}

#[async_trait]
impl DriverAdapter for RemoteDriver {
    async fn create(&self, interface: &Interface) -> Result<(), DriverError> {
        self.call(Operation::Create, interface).await
    }

    async fn update(&self, interface: &Interface) -> Result<(), DriverError> {
        self.call(Operation::Update, interface).await
    }

    async fn delete(&self, interface: &Interface) -> Result<(), DriverError> {
        self.call(Operation::Delete, interface).await
    }
}

fn json<S: Serialize>(payload: S) -> impl FnOnce(RequestBuilder) -> RequestBuilder {
    move |r| r.json(&payload)
}

async fn apply_response(response: Response) -> Result<(), ClientError> {
    log::debug!("Eval apply response: {:#?}", response);
    match response.status() {
        StatusCode::OK | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => Ok(()),
        _ => default_response(response).await,
    }
}

async fn default_response<T>(response: Response) -> Result<T, ClientError> {
    let code = response.status();
    match response.json::<ErrorInformation>().await {
        Ok(info) => Err(ClientError::Service { code, error: info }),
        Err(_) => Err(ClientError::Response(code)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn driver(url: &str) -> RemoteDriver {
        RemoteDriver::new(&RemoteConfig {
            url: Url::parse(url).unwrap(),
            token: None,
            timeout: Some(Duration::from_secs(1)),
        })
        .unwrap()
    }

    #[test]
    fn test_url() {
        for base in ["http://agent:8080", "http://agent:8080/"] {
            assert_eq!(
                driver(base)
                    .url(&["api", "v1", "interfaces", "create"])
                    .unwrap()
                    .as_str(),
                "http://agent:8080/api/v1/interfaces/create"
            );
        }
        assert_eq!(
            driver("http://agent:8080/junos")
                .url(&["api", "v1", "interfaces", "delete"])
                .unwrap()
                .as_str(),
            "http://agent:8080/junos/api/v1/interfaces/delete"
        );
    }

    #[test]
    fn test_token_not_logged() {
        let config = RemoteConfig {
            url: Url::parse("http://agent:8080").unwrap(),
            token: Some("s3cr3t".into()),
            timeout: None,
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("s3cr3t"));
        assert!(debug.contains("http://agent:8080/"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_error_mapping() {
        let err: DriverError = ClientError::Service {
            code: StatusCode::UNPROCESSABLE_ENTITY,
            error: ErrorInformation {
                error: "InvalidConfig".into(),
                message: "unit 0 overlaps".into(),
            },
        }
        .into();
        assert_eq!(err, DriverError::Rejected("unit 0 overlaps".into()));

        let err: DriverError = ClientError::Response(StatusCode::BAD_GATEWAY).into();
        assert!(matches!(err, DriverError::Transport(_)));
    }

    #[tokio::test]
    async fn test_validates_before_sending() {
        // nothing listens here, a request would fail with a transport error
        let driver = driver("http://127.0.0.1:9");
        let interface: Interface = serde_json::from_value(serde_json::json!({
            "metadata": { "name": "eth0" },
            "spec": {
                "interfaceIdentifier": "ge-0/0/0",
                "units": [ { "id": 0, "addresses": [ "not-an-address" ] } ]
            }
        }))
        .unwrap();

        assert!(matches!(
            driver.create(&interface).await,
            Err(DriverError::InvalidAddress { .. })
        ));
    }
}
