//! `reqwest` fetcher sharing one cookie jar across requests.
//!
//! The jar plays the part of the browser session: cookies set by earlier
//! responses (or seeded from configuration) ride along on later requests
//! unless the request asks for `credentials: "omit"`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::cookie::Jar;
use reqwest::redirect::Policy;
use reqwest::{Client, Method, Url};
use tracing::{debug, instrument};

use super::{FetchRequest, FetchResponse, Fetcher};
use crate::config::AgentConfig;
use crate::transport::protocol::{CredentialsMode, RedirectMode};

/// Redirects followed before giving up, matching common browser limits.
const MAX_REDIRECTS: usize = 20;

/// One client per redirect mode.
#[derive(Debug, Clone)]
struct RedirectClients {
    follow: Client,
    manual: Client,
    error: Client,
}

impl RedirectClients {
    fn build(jar: Option<&Arc<Jar>>, user_agent: Option<&str>) -> Result<Self> {
        Ok(Self {
            follow: build_client(Policy::limited(MAX_REDIRECTS), jar, user_agent)?,
            manual: build_client(Policy::none(), jar, user_agent)?,
            error: build_client(
                Policy::custom(|attempt| attempt.error("redirect mode is set to error")),
                jar,
                user_agent,
            )?,
        })
    }

    const fn get(&self, mode: RedirectMode) -> &Client {
        match mode {
            RedirectMode::Follow => &self.follow,
            RedirectMode::Manual => &self.manual,
            RedirectMode::Error => &self.error,
        }
    }
}

fn build_client(policy: Policy, jar: Option<&Arc<Jar>>, user_agent: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder().redirect(policy);
    if let Some(jar) = jar {
        builder = builder.cookie_provider(Arc::clone(jar));
    }
    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent.to_owned());
    }
    builder.build().context("Failed to build HTTP client")
}

/// Fetcher backed by `reqwest` with a shared cookie jar.
///
/// Clients are built once so connection pools (and TLS sessions) are reused.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    jar: Arc<Jar>,
    with_cookies: RedirectClients,
    without_cookies: RedirectClients,
}

impl HttpFetcher {
    /// Create a fetcher with an empty cookie jar.
    pub fn new(user_agent: Option<&str>) -> Result<Self> {
        let jar = Arc::new(Jar::default());
        Ok(Self {
            with_cookies: RedirectClients::build(Some(&jar), user_agent)?,
            without_cookies: RedirectClients::build(None, user_agent)?,
            jar,
        })
    }

    /// Create a fetcher from configuration, seeding the jar with its cookies.
    pub fn from_config(config: &AgentConfig) -> Result<Self> {
        let fetcher = Self::new(config.user_agent.as_deref())?;
        for seed in &config.cookies {
            let url = Url::parse(&seed.url)
                .with_context(|| format!("Invalid cookie URL: {}", seed.url))?;
            fetcher.jar.add_cookie_str(&seed.cookie, &url);
            debug!(url = %url, "Seeded cookie");
        }
        Ok(fetcher)
    }

    const fn client(&self, credentials: CredentialsMode, redirect: RedirectMode) -> &Client {
        match credentials {
            CredentialsMode::Omit => self.without_cookies.get(redirect),
            CredentialsMode::SameOrigin | CredentialsMode::Include => {
                self.with_cookies.get(redirect)
            }
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let FetchRequest { url, options, body } = request;

        let url = Url::parse(&url).with_context(|| format!("Failed to parse URL from {url}"))?;
        let method = options.method.as_deref().unwrap_or("GET").to_ascii_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .with_context(|| format!("'{method}' is not a valid HTTP method"))?;
        let redirect = options.redirect.unwrap_or_default();
        let credentials = options.credentials.unwrap_or_default();

        let mut builder = self.client(credentials, redirect).request(method, url.clone());
        if let Some(headers) = &options.headers {
            for (name, value) in headers.pairs() {
                builder = builder.header(name, value);
            }
        }
        if let Some(body) = body {
            builder = builder.body(body);
        } else if let Some(body) = options.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.context("Failed to fetch")?;

        let status = response.status();
        let redirected = response.url() != &url;
        let kind = if redirect == RedirectMode::Manual && status.is_redirection() {
            "opaqueredirect"
        } else {
            "basic"
        };
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let final_url = response.url().to_string();

        let body = response
            .bytes()
            .await
            .context("Failed to read response body")?;

        debug!(status = status.as_u16(), body_len = body.len(), "Fetch completed");

        Ok(FetchResponse {
            headers,
            ok: status.is_success(),
            redirected,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_owned(),
            kind: kind.to_owned(),
            url: final_url,
            body: body.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CookieSeed;
    use crate::transport::protocol::{FetchOptions, HeaderInit};
    use std::collections::BTreeMap;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(url: &str, options: FetchOptions, body: Option<&[u8]>) -> FetchRequest {
        FetchRequest {
            url: url.to_owned(),
            options,
            body: body.map(<[u8]>::to_vec),
        }
    }

    async fn redirect_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(path("/start"))
            .respond_with(ResponseTemplate::new(302).insert_header("location", "/final"))
            .mount(&server)
            .await;
        Mock::given(path("/final"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn get_reports_metadata_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-trace", "a")
                    .set_body_string("Success"),
            )
            .mount(&server)
            .await;

        let url = format!("{}/test", server.uri());
        let fetcher = HttpFetcher::new(None).unwrap();
        let resp = fetcher
            .fetch(request(&url, FetchOptions::default(), None))
            .await
            .unwrap();

        assert_eq!(resp.status, 200);
        assert!(resp.ok);
        assert!(!resp.redirected);
        assert_eq!(resp.status_text, "OK");
        assert_eq!(resp.kind, "basic");
        assert_eq!(resp.url, url);
        assert_eq!(resp.body, b"Success");
        assert!(resp
            .headers
            .contains(&("x-trace".to_owned(), "a".to_owned())));
    }

    #[tokio::test]
    async fn payload_body_overrides_option_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/test"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let options = FetchOptions {
            method: Some("post".to_owned()),
            body: Some("from options".to_owned()),
            headers: Some(HeaderInit::Map(BTreeMap::from([(
                "Authorization".to_owned(),
                "Bearer 123".to_owned(),
            )]))),
            ..FetchOptions::default()
        };

        let fetcher = HttpFetcher::new(None).unwrap();
        let resp = fetcher
            .fetch(request(
                &format!("{}/test", server.uri()),
                options,
                Some(b"test data"),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status, 201);

        let seen = server.received_requests().await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].headers.get("authorization").unwrap(), "Bearer 123");
        assert_eq!(seen[0].body, b"test data");
    }

    #[tokio::test]
    async fn manual_redirect_is_opaque() {
        let server = redirect_server().await;

        let options = FetchOptions {
            redirect: Some(RedirectMode::Manual),
            ..FetchOptions::default()
        };
        let fetcher = HttpFetcher::new(None).unwrap();
        let resp = fetcher
            .fetch(request(&format!("{}/start", server.uri()), options, None))
            .await
            .unwrap();

        assert_eq!(resp.status, 302);
        assert!(!resp.ok);
        assert_eq!(resp.kind, "opaqueredirect");
        assert!(!resp.redirected);
    }

    #[tokio::test]
    async fn followed_redirect_is_flagged() {
        let server = redirect_server().await;

        let fetcher = HttpFetcher::new(None).unwrap();
        let resp = fetcher
            .fetch(request(
                &format!("{}/start", server.uri()),
                FetchOptions::default(),
                None,
            ))
            .await
            .unwrap();

        assert!(resp.redirected);
        assert_eq!(resp.url, format!("{}/final", server.uri()));
        assert_eq!(resp.body, b"ok");
    }

    #[tokio::test]
    async fn redirect_error_mode_fails() {
        let server = redirect_server().await;

        let options = FetchOptions {
            redirect: Some(RedirectMode::Error),
            ..FetchOptions::default()
        };
        let fetcher = HttpFetcher::new(None).unwrap();
        let result = fetcher
            .fetch(request(&format!("{}/start", server.uri()), options, None))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn seeded_cookies_follow_credentials_mode() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut config = AgentConfig::for_host("test");
        config.cookies = vec![CookieSeed {
            url: format!("{}/", server.uri()),
            cookie: "session=abc".to_owned(),
        }];
        let fetcher = HttpFetcher::from_config(&config).unwrap();

        fetcher
            .fetch(request(
                &format!("{}/a", server.uri()),
                FetchOptions::default(),
                None,
            ))
            .await
            .unwrap();
        let omit = FetchOptions {
            credentials: Some(CredentialsMode::Omit),
            ..FetchOptions::default()
        };
        fetcher
            .fetch(request(&format!("{}/b", server.uri()), omit, None))
            .await
            .unwrap();

        let seen = server.received_requests().await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].url.path(), "/a");
        assert_eq!(seen[0].headers.get("cookie").unwrap(), "session=abc");
        assert!(seen[1].headers.get("cookie").is_none());
    }

    #[tokio::test]
    async fn invalid_method_is_an_error() {
        let options = FetchOptions {
            method: Some("NOT A METHOD".to_owned()),
            ..FetchOptions::default()
        };
        let fetcher = HttpFetcher::new(None).unwrap();
        let err = fetcher
            .fetch(request("http://127.0.0.1:9/", options, None))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("not a valid HTTP method"));
    }
}
