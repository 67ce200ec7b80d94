use reqwest::header::{CACHE_CONTROL, HeaderMap};

use super::headers::split_list;

/// Parsed `Cache-Control` response directives.
///
/// Unknown directives are ignored. A directive repeated across several
/// header values keeps the last numeric argument.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub public: bool,
    pub private: bool,
    /// Field names listed as `private="..."`
    pub private_headers: Vec<String>,
    pub no_cache: bool,
    /// Field names listed as `no-cache="..."`
    pub no_cache_headers: Vec<String>,
    pub no_store: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
}

impl CacheControl {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let values: Vec<&str> = headers
            .get_all(CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        Self::parse(values)
    }

    pub fn parse<'a>(values: impl IntoIterator<Item = &'a str>) -> Self {
        let mut cc = Self::default();
        for directive in values.into_iter().flat_map(split_list) {
            let (name, argument) = match directive.split_once('=') {
                Some((name, argument)) => (name.trim(), Some(unquote(argument.trim()))),
                None => (directive.trim(), None),
            };

            match name.to_ascii_lowercase().as_str() {
                "public" => cc.public = true,
                "private" => {
                    cc.private = true;
                    if let Some(names) = argument {
                        cc.private_headers.extend(field_names(names));
                    }
                }
                "no-cache" => {
                    cc.no_cache = true;
                    if let Some(names) = argument {
                        cc.no_cache_headers.extend(field_names(names));
                    }
                }
                "no-store" => cc.no_store = true,
                "must-revalidate" => cc.must_revalidate = true,
                "proxy-revalidate" => cc.proxy_revalidate = true,
                "max-age" => {
                    if let Some(secs) = argument.and_then(|a| a.parse().ok()) {
                        cc.max_age = Some(secs);
                    }
                }
                "s-maxage" => {
                    if let Some(secs) = argument.and_then(|a| a.parse().ok()) {
                        cc.s_maxage = Some(secs);
                    }
                }
                _ => {}
            }
        }
        cc
    }

    /// No recognised directive was present
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn field_names(list: &str) -> impl Iterator<Item = String> + '_ {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_directives_across_values() {
        let cc = CacheControl::parse(["public, max-age=60", "S-MaxAge=\"30\", must-revalidate"]);
        assert!(cc.public);
        assert!(cc.must_revalidate);
        assert_eq!(cc.max_age, Some(60));
        assert_eq!(cc.s_maxage, Some(30));
        assert!(!cc.no_store);
    }

    #[test]
    fn collects_field_names() {
        let cc = CacheControl::parse([r#"private="Set-Cookie, X-User", no-cache="Authorization""#]);
        assert!(cc.private);
        assert_eq!(cc.private_headers, vec!["Set-Cookie", "X-User"]);
        assert!(cc.no_cache);
        assert_eq!(cc.no_cache_headers, vec!["Authorization"]);
    }

    #[test]
    fn bad_numbers_and_unknown_directives_are_ignored() {
        let cc = CacheControl::parse(["max-age=abc, immutable, stale-while-revalidate=5"]);
        assert!(cc.is_empty());
        assert!(!CacheControl::parse(["no-store"]).is_empty());
    }
}
