//! Adapters between [`Headers`] and the OpenTelemetry propagation API.
//!
//! These let any [`TextMapPropagator`] read and write trace-context fields
//! (for example the W3C `traceparent` header) on a message's header map.
//!
//! [`TextMapPropagator`]: opentelemetry::propagation::TextMapPropagator

use opentelemetry::propagation::{Extractor, Injector};

use crate::client::Headers;

/// Reads propagation fields from message headers.
///
/// An absent key yields `None`; extraction never fails. Multi-valued headers
/// contribute their first entry.
#[derive(Debug)]
pub struct HeaderExtractor<'a>(pub &'a Headers);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().collect()
    }
}

/// Writes propagation fields into message headers.
#[derive(Debug)]
pub struct HeaderInjector<'a>(pub &'a mut Headers);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HeaderValue;

    #[test]
    fn get_existing_key() {
        let mut headers = Headers::new();
        headers.insert("test-key", "test-value");
        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("test-key"), Some("test-value"));
    }

    #[test]
    fn get_missing_key_is_none() {
        let headers = Headers::new();
        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("non-existing-key"), None);
    }

    #[test]
    fn get_multi_valued_key_returns_first() {
        let mut headers = Headers::new();
        headers.insert(
            "test-key",
            HeaderValue::List(vec!["one".to_owned(), "two".to_owned()]),
        );
        let extractor = HeaderExtractor(&headers);
        assert_eq!(extractor.get("test-key"), Some("one"));
    }

    #[test]
    fn keys_lists_all_headers() {
        let mut headers = Headers::new();
        headers.insert("a", "1");
        headers.insert("b", "2");
        let extractor = HeaderExtractor(&headers);
        let mut keys = extractor.keys();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn injector_writes_through() {
        let mut headers = Headers::new();
        HeaderInjector(&mut headers).set("traceparent", "00-0-0-00".to_owned());
        assert_eq!(headers.get_str("traceparent"), Some("00-0-0-00"));
    }
}
