use chrono::{DateTime, Days, Local, NaiveDate};
use serde::Serialize;

use crate::config::DigestSettings;
use crate::model::{Query, Record};

pub const DATE_POSTED: &str = "date_posted";
pub const DETAIL_LINK: &str = "detail_link";
pub const TITLE: &str = "title";
pub const PRICE: &str = "price";
pub const SELLER_NAME: &str = "seller_name";

/// Fills `{page}` and `{offset}` in the listing url template. Offsets grow by `offset_step` per page.
pub fn listing_page_url(template: &str, page: usize, offset_step: usize) -> String {
    template
        .replace("{page}", &page.to_string())
        .replace("{offset}", &(page * offset_step).to_string())
}

/// One listing query per page, in page order.
pub fn listing_queries(settings: &DigestSettings) -> Vec<Query> {
    (0..settings.listing_pages)
        .map(|page| {
            let url = listing_page_url(&settings.listing_url_template, page, settings.offset_step);
            Query::new(url, settings.listing_connector.clone())
        })
        .collect()
}

/// `04-Jan` style label, the prefix listings carry in `date_posted`.
pub fn day_label(date: NaiveDate) -> String {
    date.format("%d-%b").to_string()
}

pub fn yesterday_label(now: DateTime<Local>) -> String {
    let today = now.date_naive();
    day_label(today.checked_sub_days(Days::new(1)).unwrap_or(today))
}

/// Keeps the listings posted on `day`, preserving their order.
pub fn posted_on(listings: Vec<Record>, day: &str) -> Vec<Record> {
    listings
        .into_iter()
        .filter(|listing| {
            listing
                .text(DATE_POSTED)
                .is_some_and(|posted| posted.starts_with(day))
        })
        .collect()
}

/// One csv line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestRow {
    pub title: String,
    pub price: String,
    pub seller_name: String,
}

impl DigestRow {
    pub const HEADER: [&'static str; 3] = [TITLE, PRICE, SELLER_NAME];

    /// Projects a listing joined with its seller onto the exported columns.
    pub fn project(listing: &Record, seller_name: String) -> Self {
        Self {
            title: listing.text(TITLE).unwrap_or_default(),
            price: listing.text(PRICE).unwrap_or_default(),
            seller_name,
        }
    }
}
