//! LISTING DIGEST
//! Pulls listing pages through a remote extraction service, keeps what was posted on the
//! target day, looks up each listing's seller and writes the result to a csv.

pub mod aggregate;
pub mod config;
pub mod dispatch;
mod error;
pub mod export;
pub mod latch;
pub mod listing;
mod macros;
pub mod model;
pub mod process;
pub mod request;
pub mod service;

pub use error::{Error, Result};

const DEFAULT_BASE_URL: &str = "https://api.import.io";
const DEFAULT_LISTING_URL_TEMPLATE: &str =
    "http://www.ebay.co.uk/sch/Motorcycles-Scooters-/422/i.html?LH_BIN=1&_sop=10&_pgn={page}&_skc={offset}&rt=nc";
const DEFAULT_LISTING_CONNECTOR: &str = "e7c93baa-5482-4e6a-b2a4-7e37fc74216c";
const DEFAULT_DETAIL_CONNECTOR: &str = "9d68ea19-5be3-4852-b338-e79ff8c745c2";
const DEFAULT_LISTING_PAGES: usize = 5;
/// Listing pages hold 50 items each.
const DEFAULT_OFFSET_STEP: usize = 50;
const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 300;
