//! 图片 HTTP 获取。
//!
//! 请求身份（UA / Referer / Cookie 等）由 `RequestIdentity` 注入，
//! 站点相关的凭据不在这里硬编码。

use reqwest::blocking::Client;
use reqwest::header::{
    ACCEPT, ACCEPT_ENCODING, ACCEPT_LANGUAGE, CONNECTION, COOKIE, HeaderMap, HeaderValue, REFERER,
    USER_AGENT,
};
use tracing::debug;

use crate::base_system::context::Config;
use crate::download::models::BuildError;

/// 为每个请求注入身份头。
pub trait RequestIdentity: Send + Sync {
    fn apply(&self, url: &str, headers: &mut HeaderMap);
}

/// 模拟浏览器请求：固定 UA，可选 Referer 与 Cookie。
#[derive(Debug, Clone, Default)]
pub struct BrowserIdentity {
    pub user_agent: String,
    pub referer: Option<String>,
    pub cookies: Vec<String>,
}

impl BrowserIdentity {
    pub fn from_config(cfg: &Config) -> Self {
        let referer = cfg.referer.trim();
        Self {
            user_agent: cfg.user_agent.clone(),
            referer: (!referer.is_empty()).then(|| referer.to_string()),
            cookies: cfg
                .cookies
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| c.contains('='))
                .collect(),
        }
    }
}

impl RequestIdentity for BrowserIdentity {
    fn apply(&self, _url: &str, headers: &mut HeaderMap) {
        if let Ok(v) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, v);
        }
        if let Some(referer) = &self.referer
            && let Ok(v) = HeaderValue::from_str(referer)
        {
            headers.insert(REFERER, v);
        }
        if !self.cookies.is_empty()
            && let Ok(v) = HeaderValue::from_str(&self.cookies.join("; "))
        {
            headers.insert(COOKIE, v);
        }
    }
}

pub struct MediaClient {
    client: Client,
    identity: Box<dyn RequestIdentity>,
}

impl MediaClient {
    pub fn new(cfg: &Config, identity: impl RequestIdentity + 'static) -> Result<Self, BuildError> {
        // reqwest in this project is built without default features (no gzip decoder).
        // Request identity encoding so the returned bytes are directly usable.
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("image/avif,image/webp,image/png,image/*;q=0.8,*/*;q=0.5"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(cfg.request_timeout());
        if let Some(connect) = cfg.connect_timeout() {
            builder = builder.connect_timeout(connect);
        }
        if !cfg.use_system_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(|e| BuildError::Transport {
            url: String::new(),
            reason: format!("client init failed: {e}"),
        })?;

        Ok(Self {
            client,
            identity: Box::new(identity),
        })
    }

    /// 单次 GET，不重试；非 2xx 视为失败。
    pub fn get_bytes(&self, url: &str) -> Result<Vec<u8>, BuildError> {
        let transport = |reason: String| BuildError::Transport {
            url: url.to_string(),
            reason,
        };

        let mut headers = HeaderMap::new();
        self.identity.apply(url, &mut headers);

        let resp = self
            .client
            .get(url)
            .headers(headers)
            .send()
            .map_err(|e| transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(transport(format!("bad status: {status}")));
        }
        let bytes = resp.bytes().map_err(|e| transport(e.to_string()))?;
        debug!(target: "fetch", "GET {url} -> {} bytes", bytes.len());
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod test_server {
    //! 进程内的极简 HTTP 服务，按路径返回预置响应。

    use std::collections::HashMap;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    pub(crate) struct Canned {
        pub status: u16,
        pub body: Vec<u8>,
    }

    pub(crate) struct TestServer {
        pub base: String,
        pub hits: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    }

    impl TestServer {
        pub(crate) fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        pub(crate) fn hits_for(&self, path: &str) -> usize {
            self.hits
                .lock()
                .expect("hits")
                .iter()
                .filter(|(p, _)| p == path)
                .count()
        }
    }

    pub(crate) fn serve(routes: HashMap<String, Canned>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let base = format!("http://{}", listener.local_addr().expect("addr"));
        let hits = Arc::new(Mutex::new(Vec::new()));
        let hits_srv = Arc::clone(&hits);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().expect("clone"));
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                let path = request_line
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                let mut headers = Vec::new();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).is_err() || line.trim().is_empty() {
                        break;
                    }
                    headers.push(line.trim().to_string());
                }
                hits_srv.lock().expect("hits").push((path.clone(), headers));

                let canned = routes.get(&path).cloned().unwrap_or(Canned {
                    status: 404,
                    body: b"not found".to_vec(),
                });
                let head = format!(
                    "HTTP/1.1 {} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    canned.status,
                    canned.body.len()
                );
                let _ = stream.write_all(head.as_bytes());
                let _ = stream.write_all(&canned.body);
                let _ = stream.flush();
            }
        });
        TestServer { base, hits }
    }
}

#[cfg(test)]
mod tests {
    use super::test_server::{Canned, serve};
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn identity_headers_are_sent() {
        let server = serve(HashMap::from([(
            "/a.jpg".to_string(),
            Canned {
                status: 200,
                body: b"payload".to_vec(),
            },
        )]));
        let cfg = Config {
            referer: "https://reader.example/".into(),
            cookies: vec!["session=abc".into(), "lazy=off".into(), "junk".into()],
            use_system_proxy: false,
            ..Config::default()
        };
        let client = MediaClient::new(&cfg, BrowserIdentity::from_config(&cfg)).expect("client");
        let body = client.get_bytes(&server.url("/a.jpg")).expect("get");
        assert_eq!(body, b"payload");

        let hits = server.hits.lock().expect("hits");
        let headers: Vec<String> = hits[0].1.iter().map(|h| h.to_ascii_lowercase()).collect();
        assert!(headers.contains(&"referer: https://reader.example/".to_string()));
        assert!(headers.contains(&"cookie: session=abc; lazy=off".to_string()));
        assert!(headers.iter().any(|h| h.starts_with("user-agent: mozilla/5.0")));
    }

    #[test]
    fn non_success_status_is_transport_error() {
        let server = serve(HashMap::from([(
            "/gone.jpg".to_string(),
            Canned {
                status: 503,
                body: Vec::new(),
            },
        )]));
        let cfg = Config {
            use_system_proxy: false,
            ..Config::default()
        };
        let client = MediaClient::new(&cfg, BrowserIdentity::from_config(&cfg)).expect("client");
        let err = client
            .get_bytes(&server.url("/gone.jpg"))
            .expect_err("must fail");
        assert!(matches!(err, BuildError::Transport { .. }));
    }
}
