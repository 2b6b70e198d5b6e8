//! Discogs catalog client: master lookup and want-list management.
//!
//! Uses the Discogs REST API. Database search and want-list changes need an
//! OAuth 1.0a user token; the client obtains one the first time it is needed
//! (request token → user authorizes in the browser → verifier → access
//! token) and keeps it in a [`TokenStore`]. Requests are signed with the
//! `PLAINTEXT` method, which Discogs accepts over HTTPS.
//!
//! Authenticated clients may make 60 requests per minute; every request goes
//! through a [`RateLimiter`].

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::credentials::{TokenPair, TokenStore, DISCOGS_SERVICE};
use crate::error::CatalogError;
use crate::rate_limiter::RateLimiter;

const API_BASE: &str = "https://api.discogs.com";
const WEB_BASE: &str = "https://www.discogs.com";
const USER_AGENT: &str = "autoid/0.1 +https://github.com/autoid/autoid";

/// Attempts per request when Discogs answers 429.
const MAX_THROTTLED_RETRIES: u32 = 3;

// ── Credentials & authorization ──────────────────────────────────────────────

/// Application consumer key + secret (from the Discogs developer settings).
#[derive(Debug, Clone)]
pub struct ConsumerCredentials {
    pub key: String,
    pub secret: String,
}

/// Supplies the verifier code for an authorization URL.
///
/// This is where a human gets involved: the URL must be opened, access
/// granted, and the code Discogs displays entered back.
pub trait Authorizer {
    fn verifier(&self, authorize_url: &str) -> Result<String, CatalogError>;
}

// ── API response types ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiSearchResponse {
    #[serde(default)]
    results: Vec<ApiSearchResult>,
}

#[derive(Debug, Deserialize)]
struct ApiSearchResult {
    id: u64,
    #[serde(default)]
    title: String,
    uri: Option<String>,
    master_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiMaster {
    main_release: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiIdentity {
    username: String,
}

// ── Public types ─────────────────────────────────────────────────────────────

/// A Discogs master release (the work, independent of pressings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRelease {
    pub id: u64,
    pub title: String,
    /// Public web page, e.g. `https://www.discogs.com/master/33363-...`
    pub url: String,
}

/// What happened when a match was pushed to the want-list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantlistAddition {
    pub master: MasterRelease,
    pub release_id: u64,
    /// HTTP status of the want-list request (201 when added).
    pub status: u16,
}

impl WantlistAddition {
    pub fn added(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Catalog operations used after a successful identification.
pub trait CatalogClient {
    /// Find the master release for an artist/album pair.
    fn find_master(&self, artist: &str, album: &str) -> Result<MasterRelease, CatalogError>;

    /// Pick one concrete release of a master.
    fn resolve_release(&self, master_id: u64) -> Result<u64, CatalogError>;

    /// Add a release to the authorized user's want-list, returning the HTTP status.
    fn add_to_wantlist(&self, release_id: u64) -> Result<u16, CatalogError>;
}

/// Look up `artist`/`album` and add its main release to the want-list.
pub fn add_match_to_wantlist(
    client: &dyn CatalogClient,
    artist: &str,
    album: &str,
) -> Result<WantlistAddition, CatalogError> {
    let master = client.find_master(artist, album)?;
    let release_id = client.resolve_release(master.id)?;
    let status = client.add_to_wantlist(release_id)?;
    Ok(WantlistAddition { master, release_id, status })
}

// ── Client ───────────────────────────────────────────────────────────────────

/// Discogs [`CatalogClient`] with its own OAuth token lifecycle.
pub struct DiscogsClient<'a> {
    consumer: ConsumerCredentials,
    store: &'a dyn TokenStore,
    authorizer: &'a dyn Authorizer,
    agent: ureq::Agent,
    api_base: String,
    web_base: String,
    tokens: RefCell<Option<TokenPair>>,
    username: RefCell<Option<String>>,
    limiter: RefCell<RateLimiter>,
}

impl<'a> DiscogsClient<'a> {
    pub fn new(
        consumer: ConsumerCredentials,
        store: &'a dyn TokenStore,
        authorizer: &'a dyn Authorizer,
    ) -> Self {
        DiscogsClient {
            consumer,
            store,
            authorizer,
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(20))
                .build(),
            api_base: API_BASE.to_string(),
            web_base: WEB_BASE.to_string(),
            tokens: RefCell::new(None),
            username: RefCell::new(None),
            limiter: RefCell::new(RateLimiter::discogs(true)),
        }
    }

    /// Point the client at another server (API and web pages alike).
    pub fn with_base_url(mut self, base: &str) -> Self {
        self.api_base = base.trim_end_matches('/').to_string();
        self.web_base = self.api_base.clone();
        self
    }

    pub fn with_rate_limiter(self, limiter: RateLimiter) -> Self {
        *self.limiter.borrow_mut() = limiter;
        self
    }

    /// Cached access token, or a fresh one from the interactive handshake.
    fn access_tokens(&self) -> Result<TokenPair, CatalogError> {
        if let Some(tokens) = self.tokens.borrow().as_ref() {
            return Ok(tokens.clone());
        }

        let tokens = match self.store.load(DISCOGS_SERVICE)? {
            Some(tokens) => tokens,
            None => {
                let tokens = self.authorize()?;
                self.store.save(DISCOGS_SERVICE, &tokens)?;
                info!("Discogs authorization saved");
                tokens
            }
        };
        *self.tokens.borrow_mut() = Some(tokens.clone());
        Ok(tokens)
    }

    /// Drop a token Discogs no longer accepts so the next call re-authorizes.
    fn forget_tokens(&self) {
        warn!("Discogs rejected the stored token; it will be requested again");
        self.tokens.borrow_mut().take();
        self.username.borrow_mut().take();
        if let Err(e) = self.store.clear(DISCOGS_SERVICE) {
            warn!("{}", e);
        }
    }

    /// OAuth 1.0a out-of-band handshake.
    fn authorize(&self) -> Result<TokenPair, CatalogError> {
        let url = format!("{}/oauth/request_token", self.api_base);
        let header = oauth_header(&self.consumer, None, &[("oauth_callback", "oob")]);
        let body = self.send_unsigned("GET", &url, &header)?;
        let request = token_pair_from_form(&body)?;

        let authorize_url = format!(
            "{}/oauth/authorize?oauth_token={}",
            self.web_base,
            percent_encode(&request.token)
        );
        let verifier = self.authorizer.verifier(&authorize_url)?;

        let url = format!("{}/oauth/access_token", self.api_base);
        let header = oauth_header(&self.consumer, Some(&request), &[("oauth_verifier", verifier.trim())]);
        let body = self.send_unsigned("POST", &url, &header)?;
        token_pair_from_form(&body)
    }

    /// A handshake request carrying a pre-built OAuth header; returns the body.
    fn send_unsigned(&self, method: &str, url: &str, header: &str) -> Result<String, CatalogError> {
        self.limiter.borrow_mut().wait();
        let response = self
            .agent
            .request(method, url)
            .set("User-Agent", USER_AGENT)
            .set("Content-Type", "application/x-www-form-urlencoded")
            .set("Authorization", header)
            .call()
            .map_err(|e| match e {
                ureq::Error::Status(status, _) => {
                    CatalogError::Authorization(format!("{} {} returned HTTP {}", method, url, status))
                }
                other => CatalogError::from(other),
            })?;
        self.limiter.borrow_mut().success();
        Ok(response.into_string()?)
    }

    /// A request signed with the user's access token.
    fn send(&self, method: &str, url: &str) -> Result<ureq::Response, CatalogError> {
        let tokens = self.access_tokens()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            self.limiter.borrow_mut().wait();
            debug!("Discogs {} {}", method, url);

            let result = self
                .agent
                .request(method, url)
                .set("User-Agent", USER_AGENT)
                .set("Authorization", &oauth_header(&self.consumer, Some(&tokens), &[]))
                .call();

            match result {
                Ok(response) => {
                    self.limiter.borrow_mut().success();
                    return Ok(response);
                }
                Err(ureq::Error::Status(429, _)) if attempt < MAX_THROTTLED_RETRIES => {
                    self.limiter.borrow_mut().throttled();
                }
                Err(ureq::Error::Status(401, _)) => {
                    self.forget_tokens();
                    return Err(CatalogError::Http { status: 401, url: url.to_string() });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, CatalogError> {
        let response = self.send("GET", url)?;
        Ok(response.into_json::<T>()?)
    }

    fn search_masters(&self, query: &[(&str, &str)]) -> Result<Vec<ApiSearchResult>, CatalogError> {
        let params: Vec<String> = query
            .iter()
            .map(|(k, v)| format!("{}={}", k, percent_encode(v)))
            .collect();
        let url = format!("{}/database/search?type=master&per_page=5&{}", self.api_base, params.join("&"));
        let response: ApiSearchResponse = self.get_json(&url)?;
        Ok(response.results)
    }

    /// The authorized user's name (needed for want-list URLs).
    fn username(&self) -> Result<String, CatalogError> {
        if let Some(name) = self.username.borrow().as_ref() {
            return Ok(name.clone());
        }
        let identity: ApiIdentity = self.get_json(&format!("{}/oauth/identity", self.api_base))?;
        *self.username.borrow_mut() = Some(identity.username.clone());
        Ok(identity.username)
    }
}

impl CatalogClient for DiscogsClient<'_> {
    fn find_master(&self, artist: &str, album: &str) -> Result<MasterRelease, CatalogError> {
        let mut results = self.search_masters(&[("artist", artist), ("release_title", album)])?;
        if results.is_empty() {
            // Engines and Discogs disagree on punctuation often enough to warrant a free-text pass
            debug!("No structured match, trying free-text search");
            let query = format!("{} {}", artist, album);
            results = self.search_masters(&[("q", query.as_str())])?;
        }

        let first = results.into_iter().next().ok_or_else(|| CatalogError::NotFound {
            artist: artist.to_string(),
            album: album.to_string(),
        })?;

        let id = first.master_id.unwrap_or(first.id);
        let url = match first.uri {
            Some(uri) if uri.starts_with("http") => uri,
            Some(uri) => format!("{}{}", self.web_base, uri),
            None => format!("{}/master/{}", self.web_base, id),
        };
        Ok(MasterRelease { id, title: first.title, url })
    }

    fn resolve_release(&self, master_id: u64) -> Result<u64, CatalogError> {
        let master: ApiMaster = self.get_json(&format!("{}/masters/{}", self.api_base, master_id))?;
        master.main_release.ok_or(CatalogError::NoRelease { master_id })
    }

    fn add_to_wantlist(&self, release_id: u64) -> Result<u16, CatalogError> {
        let username = self.username()?;
        let url = format!(
            "{}/users/{}/wants/{}",
            self.api_base,
            percent_encode(&username),
            release_id
        );
        match self.send("PUT", &url) {
            Ok(response) => Ok(response.status()),
            Err(CatalogError::Http { status, .. }) => Ok(status),
            Err(e) => Err(e),
        }
    }
}

// ── OAuth helpers ────────────────────────────────────────────────────────────

/// Build an `Authorization: OAuth ...` header value with a PLAINTEXT signature.
fn oauth_header(consumer: &ConsumerCredentials, token: Option<&TokenPair>, extra: &[(&str, &str)]) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let timestamp = Utc::now().timestamp().to_string();
    let signature = format!(
        "{}&{}",
        percent_encode(&consumer.secret),
        percent_encode(token.map_or("", |t| t.secret.as_str()))
    );

    let mut params: Vec<(&str, &str)> = vec![
        ("oauth_consumer_key", consumer.key.as_str()),
        ("oauth_nonce", nonce.as_str()),
        ("oauth_signature_method", "PLAINTEXT"),
        ("oauth_timestamp", timestamp.as_str()),
        ("oauth_version", "1.0"),
    ];
    if let Some(t) = token {
        params.push(("oauth_token", t.token.as_str()));
    }
    params.extend_from_slice(extra);
    params.push(("oauth_signature", signature.as_str()));

    let fields: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, percent_encode(v)))
        .collect();
    format!("OAuth {}", fields.join(", "))
}

/// Extract `oauth_token` / `oauth_token_secret` from a form-encoded body.
fn token_pair_from_form(body: &str) -> Result<TokenPair, CatalogError> {
    let form = parse_form(body);
    match (form.get("oauth_token"), form.get("oauth_token_secret")) {
        (Some(token), Some(secret)) => Ok(TokenPair {
            token: token.clone(),
            secret: secret.clone(),
        }),
        _ => Err(CatalogError::Authorization(format!("unexpected token response: {}", body.trim()))),
    }
}

fn parse_form(body: &str) -> HashMap<String, String> {
    body.trim()
        .split('&')
        .filter_map(|pair| {
            let (k, v) = pair.split_once('=')?;
            Some((percent_decode(k), percent_decode(v)))
        })
        .collect()
}

/// RFC 3986 percent-encoding (everything but unreserved characters).
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
