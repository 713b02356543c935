use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use dotenvy::dotenv;

use crate::model::ConnectorId;
use crate::{
    Error, Result, DEFAULT_BASE_URL, DEFAULT_DETAIL_CONNECTOR, DEFAULT_LISTING_CONNECTOR,
    DEFAULT_LISTING_PAGES, DEFAULT_LISTING_URL_TEMPLATE, DEFAULT_OFFSET_STEP, DEFAULT_PHASE_TIMEOUT_SECS,
};

/// What to do when some queries failed or some listings could not be joined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PartialPolicy {
    /// Log every exclusion and export whatever survived.
    #[default]
    Continue,
    /// Stop before export on the first failure.
    Abort,
}

impl FromStr for PartialPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(PartialPolicy::Continue),
            "abort" => Ok(PartialPolicy::Abort),
            other => Err(Error::Config(format!(
                "PARTIAL_POLICY must be 'continue' or 'abort', got '{other}'"
            ))),
        }
    }
}

/// Everything the digest flow needs apart from credentials.
#[derive(Debug, Clone)]
pub struct DigestSettings {
    /// Listing page url with `{page}` and `{offset}` placeholders.
    pub listing_url_template: String,
    pub listing_connector: ConnectorId,
    pub detail_connector: ConnectorId,
    pub listing_pages: usize,
    pub offset_step: usize,
    /// `%d-%b` label, e.g. `04-Jan`. `None` means yesterday.
    pub target_day: Option<String>,
    pub output_dir: PathBuf,
    pub phase_timeout: Duration,
    pub partial_policy: PartialPolicy,
}

impl Default for DigestSettings {
    fn default() -> Self {
        Self {
            listing_url_template: DEFAULT_LISTING_URL_TEMPLATE.to_string(),
            listing_connector: ConnectorId::new(DEFAULT_LISTING_CONNECTOR),
            detail_connector: ConnectorId::new(DEFAULT_DETAIL_CONNECTOR),
            listing_pages: DEFAULT_LISTING_PAGES,
            offset_step: DEFAULT_OFFSET_STEP,
            target_day: None,
            output_dir: PathBuf::from("."),
            phase_timeout: Duration::from_secs(DEFAULT_PHASE_TIMEOUT_SECS),
            partial_policy: PartialPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub user_id: String,
    pub api_key: String,
    pub base_url: String,
    pub digest: DigestSettings,
}

impl Config {
    /// Loads `.env` if present, then reads the environment.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reads variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| Error::Config(format!("{key} must be set")))
        };
        let defaults = DigestSettings::default();

        let digest = DigestSettings {
            listing_url_template: lookup("LISTING_URL_TEMPLATE").unwrap_or(defaults.listing_url_template),
            listing_connector: lookup("LISTING_CONNECTOR")
                .map(ConnectorId::new)
                .unwrap_or(defaults.listing_connector),
            detail_connector: lookup("DETAIL_CONNECTOR")
                .map(ConnectorId::new)
                .unwrap_or(defaults.detail_connector),
            listing_pages: parse_or(&lookup, "LISTING_PAGES", defaults.listing_pages)?,
            offset_step: parse_or(&lookup, "LISTING_OFFSET_STEP", defaults.offset_step)?,
            target_day: lookup("TARGET_DAY").filter(|d| !d.trim().is_empty()),
            output_dir: lookup("OUTPUT_DIR").map(PathBuf::from).unwrap_or(defaults.output_dir),
            phase_timeout: Duration::from_secs(parse_or(
                &lookup,
                "PHASE_TIMEOUT_SECS",
                DEFAULT_PHASE_TIMEOUT_SECS,
            )?),
            partial_policy: parse_or(&lookup, "PARTIAL_POLICY", defaults.partial_policy)?,
        };

        Ok(Self {
            user_id: required("EXTRACTION_USER_ID")?,
            api_key: required("EXTRACTION_API_KEY")?,
            base_url: lookup("EXTRACTION_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            digest,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key} is invalid ({raw}): {e}"))),
        None => Ok(default),
    }
}
