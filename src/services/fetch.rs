//! 本地 URL 代理
//!
//! 代替操作者访问只有目标主机自己能访问的地址，无缓存、无重试

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use url::{Host, Url};

use crate::config::FetchConfig;

/// 代理错误
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("host '{0}' is not allowed, only local addresses can be fetched")]
    Forbidden(String),

    #[error("target unreachable: {0}")]
    Unreachable(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("bad response from target: {0}")]
    BadResponse(String),
}

/// 代理获取的资源
#[derive(Debug)]
pub struct FetchedResource {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// 本地 URL 代理
pub struct RemoteFetchProxy {
    client: reqwest::Client,
    local_only: bool,
    timeout: Duration,
    max_body_bytes: usize,
}

impl RemoteFetchProxy {
    pub fn new(config: &FetchConfig) -> Self {
        let timeout = Duration::from_secs(config.timeout_secs);
        let local_only = config.local_only;

        // 重定向也必须留在本机
        let redirect = reqwest::redirect::Policy::custom(move |attempt| {
            if attempt.previous().len() >= 10 {
                attempt.error("too many redirects")
            } else if local_only && !is_local(attempt.url()) {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(redirect)
            .build()
            .unwrap_or_default();

        Self {
            client,
            local_only,
            timeout,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// 校验并解析目标地址
    pub fn parse_target(&self, raw: &str) -> Result<Url, FetchError> {
        let url = Url::parse(raw.trim()).map_err(|e| FetchError::InvalidUrl {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: raw.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }
        if url.host().is_none() {
            return Err(FetchError::InvalidUrl {
                url: raw.to_string(),
                reason: "missing host".to_string(),
            });
        }
        if self.local_only && !is_local(&url) {
            return Err(FetchError::Forbidden(
                url.host_str().unwrap_or_default().to_string(),
            ));
        }
        Ok(url)
    }

    /// 获取资源，完整读取响应体后返回
    pub async fn fetch(&self, raw: &str) -> Result<FetchedResource, FetchError> {
        let url = self.parse_target(raw)?;
        debug!(url = %url, "Fetching local url");

        let mut resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(len) = resp.content_length() {
            if len as usize > self.max_body_bytes {
                return Err(FetchError::BadResponse(format!(
                    "body of {} bytes exceeds limit of {} bytes",
                    len, self.max_body_bytes
                )));
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout(self.timeout)
            } else {
                FetchError::BadResponse(format!("failed to read body: {}", e))
            }
        })? {
            if body.len() + chunk.len() > self.max_body_bytes {
                return Err(FetchError::BadResponse(format!(
                    "body exceeds limit of {} bytes",
                    self.max_body_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, status, bytes = body.len(), "Fetched local url");
        Ok(FetchedResource {
            status,
            content_type,
            body,
        })
    }

    fn classify(&self, e: reqwest::Error) -> FetchError {
        warn!(error = %e, "Local url fetch failed");
        if e.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else if e.is_connect() {
            FetchError::Unreachable(e.to_string())
        } else if e.is_redirect() {
            FetchError::BadResponse(e.to_string())
        } else if e.is_builder() {
            FetchError::InvalidUrl {
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
                reason: e.to_string(),
            }
        } else {
            FetchError::Unreachable(e.to_string())
        }
    }
}

/// localhost / 回环地址
fn is_local(url: &Url) -> bool {
    match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.trim_end_matches('.').to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(Host::Ipv6(ip)) => IpAddr::V6(ip).is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn proxy(local_only: bool) -> RemoteFetchProxy {
        RemoteFetchProxy::new(&FetchConfig {
            local_only,
            timeout_secs: 3,
            max_body_bytes: 1024,
        })
    }

    /// 返回固定响应的一次性 HTTP 服务
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{}/status", addr)
    }

    #[test]
    fn test_local_hosts() {
        let p = proxy(true);
        assert!(p.parse_target("http://localhost:3000/health").is_ok());
        assert!(p.parse_target("http://127.0.0.1/").is_ok());
        assert!(p.parse_target("http://[::1]:8080/").is_ok());
        assert!(p.parse_target("http://api.localhost/").is_ok());

        assert!(matches!(
            p.parse_target("http://example.com/"),
            Err(FetchError::Forbidden(_))
        ));
        assert!(matches!(
            p.parse_target("http://10.0.0.1/"),
            Err(FetchError::Forbidden(_))
        ));
    }

    #[test]
    fn test_invalid_urls() {
        let p = proxy(false);
        assert!(matches!(
            p.parse_target("not a url"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(matches!(
            p.parse_target("file:///etc/shadow"),
            Err(FetchError::InvalidUrl { .. })
        ));
        assert!(p.parse_target("http://example.com/").is_ok());
    }

    #[tokio::test]
    async fn test_fetch_passes_status_and_content_type() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-type: application/json\r\ncontent-length: 15\r\nconnection: close\r\n\r\n{\"ok\": false}\r\n",
        )
        .await;

        let resource = proxy(true).fetch(&url).await.unwrap();
        assert_eq!(resource.status, 503);
        assert_eq!(resource.content_type.as_deref(), Some("application/json"));
        assert_eq!(resource.body, b"{\"ok\": false}\r\n");
    }

    #[tokio::test]
    async fn test_fetch_body_limit() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\ncontent-length: 2048\r\nconnection: close\r\n\r\n",
        )
        .await;

        assert!(matches!(
            proxy(true).fetch(&url).await,
            Err(FetchError::BadResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_unreachable() {
        // 绑定后立即释放，连接会被拒绝
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = proxy(true)
            .fetch(&format!("http://{}/", addr))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Unreachable(_)));
    }
}
