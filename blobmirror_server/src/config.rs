//! Environment-driven configuration.
//!
//! All keys are read once at startup. `PRIMARY` and `CACHEPATH` are
//! required; everything else has a default or is optional.

use std::collections::HashMap;
use std::time::Duration;

use blobmirror_core::BoxError;
use blobmirror_core::parse::{parse_duration, parse_size};
use config::{Config, Environment};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Raw configuration as read from the environment.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Conf {
    /// Connection string of the remote store, e.g. `s3://bucket` or
    /// `file:///srv/releases`.
    pub primary: String,
    /// Local cache directory.
    pub cachepath: String,
    /// Cap on cached not-found answers; size suffixes are powers of 1024.
    #[serde(default = "default_max_not_found")]
    pub max_not_found: String,
    /// Cap on downloaded bytes.
    #[serde(default = "default_max_size")]
    pub max_size: String,
    /// How long items stay valid.
    #[serde(default = "default_cache_time")]
    pub cache_time: String,
    /// Where `GET /` redirects to, if anywhere.
    #[serde(default)]
    pub redirect: Option<String>,
    /// Secret required by `POST /reload`. Reload is disabled when unset.
    #[serde(default)]
    pub apikey: Option<String>,
    /// Keys matching this pattern are exempt from time-based expiry.
    #[serde(default)]
    pub keep_forever_regex: Option<String>,
    /// Responses for matching keys carry private/no-store cache control.
    #[serde(default)]
    pub no_cache_regex: Option<String>,
    /// Key fetched from the store to serve as the 404 body.
    #[serde(default)]
    pub notfound_html: Option<String>,
    /// Key served in place of directory-like paths.
    #[serde(default)]
    pub index_html: Option<String>,
    /// Pattern selecting the paths rewritten to `index_html`.
    #[serde(default)]
    pub index_html_regex: Option<String>,
}

fn default_max_not_found() -> String {
    "10k".to_string()
}

fn default_max_size() -> String {
    "10m".to_string()
}

fn default_cache_time() -> String {
    "1d".to_string()
}

impl Conf {
    pub fn from_env() -> Result<Self, BoxError> {
        let builder = Config::builder().add_source(Environment::default());
        let cfg = builder.build()?.try_deserialize::<Conf>()?;
        Ok(cfg)
    }
}

/// Parsed and compiled form of [`Conf`], shared with the request handlers.
pub struct Settings {
    pub max_not_found: u64,
    pub max_size: u64,
    pub cache_time: Duration,
    pub redirect: Option<String>,
    pub api_key: Option<String>,
    pub keep_forever: Option<Regex>,
    pub no_cache: Option<Regex>,
    pub not_found_key: Option<String>,
    pub index_key: Option<String>,
    pub index_match: Option<Regex>,
    pub types: HashMap<&'static str, mime::Mime>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_not_found: 10 * 1024,
            max_size: 10 * 1024 * 1024,
            cache_time: Duration::from_secs(24 * 60 * 60),
            redirect: None,
            api_key: None,
            keep_forever: None,
            no_cache: None,
            not_found_key: None,
            index_key: None,
            index_match: None,
            types: extension_types(),
        }
    }
}

impl Conf {
    pub fn resolve(&self) -> Result<Settings, BoxError> {
        Ok(Settings {
            max_not_found: parse_size(&self.max_not_found)?,
            max_size: parse_size(&self.max_size)?,
            cache_time: parse_duration(&self.cache_time)?,
            redirect: self.redirect.clone(),
            api_key: self.apikey.clone(),
            keep_forever: compile(&self.keep_forever_regex)?,
            no_cache: compile(&self.no_cache_regex)?,
            not_found_key: self.notfound_html.clone(),
            index_key: self.index_html.clone(),
            index_match: compile(&self.index_html_regex)?,
            types: extension_types(),
        })
    }
}

fn compile(source: &Option<String>) -> Result<Option<Regex>, BoxError> {
    Ok(match source {
        Some(source) => Some(Regex::new(source)?),
        None => None,
    })
}

/// Extension map used for `Content-Type`; anything unknown is served as an
/// octet stream.
fn extension_types() -> HashMap<&'static str, mime::Mime> {
    let mut types = HashMap::new();
    types.insert("html", mime::TEXT_HTML_UTF_8);
    types.insert("htm", mime::TEXT_HTML_UTF_8);
    types.insert("txt", mime::TEXT_PLAIN_UTF_8);
    types.insert("css", mime::TEXT_CSS);
    types.insert("js", mime::APPLICATION_JAVASCRIPT);
    types.insert("json", mime::APPLICATION_JSON);
    types.insert("xml", mime::TEXT_XML);
    types.insert("png", mime::IMAGE_PNG);
    types.insert("gif", mime::IMAGE_GIF);
    types.insert("jpg", mime::IMAGE_JPEG);
    types.insert("jpeg", mime::IMAGE_JPEG);
    types.insert("svg", mime::IMAGE_SVG);
    types.insert("pdf", mime::APPLICATION_PDF);
    for (ext, ty) in [
        ("zip", "application/zip"),
        ("gz", "application/gzip"),
        ("tgz", "application/gzip"),
        ("sig", "application/pgp-signature"),
        ("asc", "application/pgp-signature"),
        ("manifest", "text/plain"),
    ] {
        if let Ok(ty) = ty.parse() {
            types.insert(ext, ty);
        }
    }
    types
}
