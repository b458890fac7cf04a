use base64::engine::general_purpose;
use base64::Engine;
use hyper::{Method, Uri};
use sha2::{Digest, Sha256};
use std::fmt;
use url::form_urlencoded;

/// File suffix of every cache entry
pub const ENTRY_SUFFIX: &str = ".cache";

/// Deterministic identity of a cacheable request.
///
/// Built from `METHOD:scheme://host[:port]path?query` where the method is
/// upper-cased, scheme and host are lower-cased and the query pairs are
/// sorted by name (stable, so repeated names keep their order). Headers and
/// body never take part.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    canonical: String,
    digest: [u8; 32],
}

impl CacheKey {
    pub fn new(method: &Method, uri: &Uri) -> Self {
        let canonical = canonical_form(method, uri);
        let digest: [u8; 32] = Sha256::digest(canonical.as_bytes()).into();
        Self { canonical, digest }
    }

    /// The normalized request line the digest was taken over
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// `<urlsafe-base64(sha256)>.cache`
    pub fn file_name(&self) -> String {
        let mut name = general_purpose::URL_SAFE.encode(self.digest);
        name.push_str(ENTRY_SUFFIX);
        name
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

fn canonical_form(method: &Method, uri: &Uri) -> String {
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();
    let host = match (uri.host(), uri.port_u16()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => String::new(),
    }
    .to_ascii_lowercase();

    format!(
        "{}:{}://{}{}?{}",
        method.as_str().to_ascii_uppercase(),
        scheme,
        host,
        uri.path(),
        sorted_query(uri.query().unwrap_or(""))
    )
}

fn sorted_query(query: &str) -> String {
    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect();
    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}
