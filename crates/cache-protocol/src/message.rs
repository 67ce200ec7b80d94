//! Request and response views consumed by the validators.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Method, StatusCode, Version};
use url::Url;

use crate::policy::CachePolicy;

/// A request about to be served from cache or sent to the origin
#[derive(Debug, Clone)]
pub struct CacheRequest {
    /// HTTP method, or the FTP command (`RETR`, `STOR`, ...)
    pub method: Method,
    pub uri: Url,
    pub headers: HeaderMap,
    pub policy: CachePolicy,
    /// FTP binary transfer mode
    pub binary: bool,
    /// FTP restart offset
    pub content_offset: u64,
    /// FTP request tunnelled through an HTTP proxy
    pub through_http_proxy: bool,
}

impl CacheRequest {
    pub fn new(method: Method, uri: Url) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            policy: CachePolicy::default(),
            binary: true,
            content_offset: 0,
            through_http_proxy: false,
        }
    }

    pub fn get(uri: Url) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn with_policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Append a header, ignoring names or values that are not valid HTTP
    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_content_offset(mut self, offset: u64) -> Self {
        self.content_offset = offset;
        self
    }

    /// The byte range the caller asked for, if any
    pub fn user_range(&self) -> Option<&str> {
        self.headers.get(RANGE).and_then(|v| v.to_str().ok())
    }

    pub fn has_query(&self) -> bool {
        self.uri.query().is_some_and(|q| !q.is_empty())
    }
}

/// A live or synthesized response
#[derive(Debug, Clone)]
pub struct CacheResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    /// Declared body length
    pub content_length: Option<u64>,
}

impl CacheResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            content_length: None,
        }
    }

    pub fn with_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        if let (Ok(name), Ok(value)) = (
            name.as_ref().parse::<HeaderName>(),
            HeaderValue::from_str(value.as_ref()),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn with_content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }
}

/// Method classification in the order the rule set compares against
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestMethod {
    #[default]
    Other,
    Head,
    Get,
    Post,
    Put,
    Delete,
    Options,
    Trace,
    Connect,
}

impl RequestMethod {
    pub fn classify(method: &Method) -> Self {
        match *method {
            Method::HEAD => Self::Head,
            Method::GET => Self::Get,
            Method::POST => Self::Post,
            Method::PUT => Self::Put,
            Method::DELETE => Self::Delete,
            Method::OPTIONS => Self::Options,
            Method::TRACE => Self::Trace,
            Method::CONNECT => Self::Connect,
            _ => Self::Other,
        }
    }

    /// POST, PUT and DELETE invalidate the entry of the target URI
    pub fn invalidates_entry(self) -> bool {
        matches!(self, Self::Post | Self::Put | Self::Delete)
    }
}
