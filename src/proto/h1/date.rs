//! A cached, once-per-second `Date` header value (RFC 9110 §6.6.1).
//!
//! Formatting a timestamp on every response would mean it dominates the hot
//! path of small responses; a value good for one second is recomputed only
//! when that second has passed.
use std::cell::RefCell;
use std::time::{Duration, SystemTime};

use http::header::HeaderValue;

pub(crate) fn update_and_header_value() -> HeaderValue {
    CACHED.with(|cache| {
        let mut cache = cache.borrow_mut();
        cache.check();
        cache.header_value.clone()
    })
}

struct CachedDate {
    header_value: HeaderValue,
    next_update: SystemTime,
}

thread_local!(static CACHED: RefCell<CachedDate> = RefCell::new(CachedDate::new()));

impl CachedDate {
    fn new() -> Self {
        let mut cached = CachedDate {
            header_value: HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"),
            next_update: SystemTime::UNIX_EPOCH,
        };
        cached.update(SystemTime::now());
        cached
    }

    fn check(&mut self) {
        let now = SystemTime::now();
        if now >= self.next_update {
            self.update(now);
        }
    }

    fn update(&mut self, now: SystemTime) {
        let formatted = httpdate::fmt_http_date(now);
        self.header_value =
            HeaderValue::from_str(&formatted).expect("httpdate output is a valid header value");
        self.next_update = now + Duration::from_secs(1);
    }
}
