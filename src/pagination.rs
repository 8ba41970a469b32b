use std::future::{ready, Ready};
use std::num::IntErrorKind;

use actix_web::{dev::Payload, web, Error, FromRequest, HttpRequest};
use serde::{Deserialize, Serialize};

pub const PAGE_SIZE: u64 = 10;

/// `?page=` as sent by the client. Extraction never fails: missing, junk or
/// repeated values all resolve to some page.
#[derive(Debug, Default, Clone)]
pub struct PageQuery {
    pub page: Option<String>,
}

impl PageQuery {
    pub fn from_query_string(query: &str) -> Self {
        let pairs = web::Query::<Vec<(String, String)>>::from_query(query)
            .map(web::Query::into_inner)
            .unwrap_or_default();
        // last value wins, like a repeated form field
        let page = pairs.into_iter().filter(|(k, _)| k == "page").map(|(_, v)| v).last();
        Self { page }
    }

    pub fn requested(&self) -> PageNumber {
        PageNumber::parse(self.page.as_deref())
    }
}

impl FromRequest for PageQuery {
    type Error = Error;
    type Future = Ready<Result<Self, Error>>;

    fn from_request(req: &HttpRequest, _pl: &mut Payload) -> Self::Future {
        ready(Ok(Self::from_query_string(req.query_string())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageNumber {
    First,
    Number(i64),
}

impl PageNumber {
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim) else { return PageNumber::First };
        match raw.parse::<i64>() {
            Ok(n) => PageNumber::Number(n),
            // still a number, just out of every listing's range
            Err(e) if *e.kind() == IntErrorKind::PosOverflow => PageNumber::Number(i64::MAX),
            Err(e) if *e.kind() == IntErrorKind::NegOverflow => PageNumber::Number(i64::MIN),
            Err(_) => PageNumber::First,
        }
    }
}

/// Resolved position of a page inside a listing of `count` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageWindow {
    pub number: u64,
    pub num_pages: u64,
    pub offset: u64,
    pub limit: u64,
}

/// Out-of-range numbers (below 1 or past the end) land on the last page;
/// an empty listing still has one empty page.
pub fn resolve(requested: PageNumber, count: u64) -> PageWindow {
    let num_pages = count.div_ceil(PAGE_SIZE).max(1);
    let number = match requested {
        PageNumber::First => 1,
        PageNumber::Number(n) if n >= 1 && (n as u64) <= num_pages => n as u64,
        PageNumber::Number(_) => num_pages,
    };
    PageWindow { number, num_pages, offset: (number - 1) * PAGE_SIZE, limit: PAGE_SIZE }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub number: u64,
    pub num_pages: u64,
    pub count: u64,
    pub has_next: bool,
    pub has_previous: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, window: PageWindow, count: u64) -> Self {
        Self {
            items,
            number: window.number,
            num_pages: window.num_pages,
            count,
            has_next: window.number < window.num_pages,
            has_previous: window.number > 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_and_missing_page_fall_back_to_first() {
        assert_eq!(PageNumber::parse(None), PageNumber::First);
        assert_eq!(PageNumber::parse(Some("abc")), PageNumber::First);
        assert_eq!(resolve(PageNumber::parse(Some("x")), 35).number, 1);
    }

    #[test]
    fn out_of_range_lands_on_last_page() {
        let w = resolve(PageNumber::Number(9), 35);
        assert_eq!(w.number, 4);
        assert_eq!(w.offset, 30);
        assert_eq!(resolve(PageNumber::Number(0), 35).number, 4);
        assert_eq!(resolve(PageNumber::Number(-2), 35).number, 4);
    }

    #[test]
    fn overflowing_numbers_are_past_the_end() {
        assert_eq!(PageNumber::parse(Some("99999999999999999999")), PageNumber::Number(i64::MAX));
        assert_eq!(resolve(PageNumber::parse(Some("99999999999999999999")), 35).number, 4);
        assert_eq!(resolve(PageNumber::parse(Some("-99999999999999999999")), 35).number, 4);
    }

    #[test]
    fn query_string_is_read_leniently() {
        assert_eq!(PageQuery::from_query_string("").page, None);
        assert_eq!(PageQuery::from_query_string("page=1&page=2").page.as_deref(), Some("2"));
        assert_eq!(PageQuery::from_query_string("x=1&page=%203").requested(), PageNumber::Number(3));
        assert_eq!(PageQuery::from_query_string("page=abc").requested(), PageNumber::First);
    }

    #[test]
    fn empty_listing_has_one_page() {
        let w = resolve(PageNumber::First, 0);
        assert_eq!((w.number, w.num_pages, w.offset), (1, 1, 0));
        let p: Page<u8> = Page::new(vec![], w, 0);
        assert!(!p.has_next && !p.has_previous);
    }

    #[test]
    fn exact_multiple_of_page_size() {
        let w = resolve(PageNumber::Number(2), 20);
        assert_eq!((w.number, w.num_pages, w.offset), (2, 2, 10));
        let p = Page::new(vec![0u8; 10], w, 20);
        assert!(p.has_previous && !p.has_next);
    }
}
