//! The transport collaborator that actually performs downloads.
//!
//! The chain never touches sockets itself. Whatever sits behind [`Transport`]
//! receives the final request and returns the response bit-exact, or a
//! [`SpiderError::Transport`] describing what went wrong.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SpiderError;
use crate::request::Request;
use crate::response::Response;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, SpiderError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
        (**self).fetch(request).await
    }
}

#[cfg(feature = "reqwest-transport")]
pub use reqwest_impl::ReqwestTransport;

#[cfg(feature = "reqwest-transport")]
mod reqwest_impl {
    use super::*;
    use std::time::Duration;

    use dashmap::DashMap;
    use serde_json::Value;
    use tracing::{debug, trace};

    use crate::proxy::PROXY;

    /// Downloads with reqwest, honouring the per-request `proxy` meta entry.
    ///
    /// Redirects are never followed here; the redirect middleware owns them.
    /// One client is kept per distinct proxy URL.
    #[derive(Debug)]
    pub struct ReqwestTransport {
        direct: reqwest::Client,
        proxied: DashMap<String, reqwest::Client>,
        connect_timeout: Duration,
    }

    impl ReqwestTransport {
        pub fn new() -> Result<Self, SpiderError> {
            Self::with_connect_timeout(Duration::from_secs(30))
        }

        pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, SpiderError> {
            Ok(Self {
                direct: client_builder(connect_timeout).no_proxy().build()?,
                proxied: DashMap::new(),
                connect_timeout,
            })
        }

        fn client_for(&self, request: &Request) -> Result<reqwest::Client, SpiderError> {
            let proxy = match request.meta.get(PROXY) {
                Some(Value::String(proxy)) if !proxy.is_empty() => proxy,
                _ => return Ok(self.direct.clone()),
            };
            if let Some(client) = self.proxied.get(proxy) {
                return Ok(client.clone());
            }
            debug!("Building client for proxy {}", proxy);
            let client = client_builder(self.connect_timeout)
                .proxy(reqwest::Proxy::all(proxy.as_str())?)
                .build()?;
            self.proxied.insert(proxy.clone(), client.clone());
            Ok(client)
        }
    }

    fn client_builder(connect_timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(connect_timeout)
    }

    #[async_trait]
    impl Transport for ReqwestTransport {
        async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
            let client = self.client_for(request)?;
            client.fetch(request).await
        }
    }

    #[async_trait]
    impl Transport for reqwest::Client {
        async fn fetch(&self, request: &Request) -> Result<Response, SpiderError> {
            trace!("Downloading {}", request);
            let mut builder = self
                .request(request.method.clone(), request.url.clone())
                .headers(request.headers.clone());
            if !request.body.is_empty() {
                builder = builder.body(request.body.clone());
            }
            if let Some(secs) = request.meta_u64("download_timeout") {
                builder = builder.timeout(Duration::from_secs(secs));
            }

            let response = builder.send().await?;
            let url = response.url().clone();
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;

            Ok(Response::new(url, status)
                .with_headers(headers)
                .with_body(body))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn clients_are_reused_per_proxy() {
            let transport = ReqwestTransport::new().unwrap();
            let request = Request::get("http://example.com/")
                .unwrap()
                .with_meta(PROXY, "http://127.0.0.1:3128");

            transport.client_for(&request).unwrap();
            transport.client_for(&request).unwrap();
            assert_eq!(transport.proxied.len(), 1);

            let direct = Request::get("http://example.com/").unwrap();
            transport.client_for(&direct).unwrap();
            assert_eq!(transport.proxied.len(), 1);
        }
    }
}
