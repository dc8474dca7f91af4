//! Destination normalization for span names and attributes.
//!
//! The outbox client addresses messages with STOMP-style paths such as
//! `/exchange/orders/created` or `/queue/orders.v1`. Spans use the compact
//! colon-separated forms instead: `exchange:routing-key` on the producer
//! side and `exchange:routing-key:queue` on the consumer side, with the
//! routing key omitted when it equals the queue name.

use crate::client::{Headers, DESTINATION_HEADER, MSG_DESTINATION_HEADER};
use crate::error::Error;

/// Normalizes a producer-side destination path.
///
/// The leading `/exchange/` prefix is dropped; any other leading segment
/// (for example `/topic/`) is kept. Remaining path separators become colons.
pub fn format_publisher_destination(destination: &str) -> String {
    let trimmed = destination.trim_start_matches('/');
    let rest = trimmed.strip_prefix("exchange/").unwrap_or(trimmed);
    rest.replace('/', ":")
}

/// Normalizes a consumer-side destination from delivery headers.
///
/// Combines the queue the message arrived on (`destination` header) with the
/// exchange and routing key it was originally published to
/// (`dop-msg-destination` header). Falls back to the publisher form of the
/// `destination` header when the original destination is not recorded.
pub fn format_consumer_destination(headers: &Headers) -> Result<String, Error> {
    let destination = headers
        .get_str(DESTINATION_HEADER)
        .ok_or(Error::MissingHeader(DESTINATION_HEADER))?;
    let queue = destination.rsplit('/').next().unwrap_or(destination);

    let Some(msg_destination) = headers.get_str(MSG_DESTINATION_HEADER) else {
        return Ok(format_publisher_destination(destination));
    };

    let published = format_publisher_destination(msg_destination);
    match published.split_once(':') {
        Some((exchange, routing_key)) if routing_key == queue => {
            Ok(format!("{exchange}:{queue}"))
        }
        Some((exchange, routing_key)) => Ok(format!("{exchange}:{routing_key}:{queue}")),
        None => Ok(format!("{published}:{queue}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumer_headers(destination: &str, msg_destination: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(DESTINATION_HEADER, destination);
        headers.insert(MSG_DESTINATION_HEADER, msg_destination);
        headers
    }

    #[test]
    fn consumer_destination_with_distinct_routing_key() {
        let headers = consumer_headers(
            "/queue/test-queue",
            "/exchange/test-exchange/test-routing-key",
        );
        assert_eq!(
            format_consumer_destination(&headers).unwrap(),
            "test-exchange:test-routing-key:test-queue"
        );
    }

    #[test]
    fn consumer_destination_with_routing_key_equal_to_queue() {
        let headers = consumer_headers("/queue/test-queue", "/exchange/test-exchange/test-queue");
        assert_eq!(
            format_consumer_destination(&headers).unwrap(),
            "test-exchange:test-queue"
        );
    }

    #[test]
    fn consumer_destination_without_original_destination() {
        let mut headers = Headers::new();
        headers.insert(DESTINATION_HEADER, "/topic/consumer.v1");
        assert_eq!(
            format_consumer_destination(&headers).unwrap(),
            "topic:consumer.v1"
        );
    }

    #[test]
    fn consumer_destination_requires_destination_header() {
        let headers = Headers::new();
        assert!(matches!(
            format_consumer_destination(&headers),
            Err(Error::MissingHeader(DESTINATION_HEADER))
        ));
    }

    #[test]
    fn publisher_destination() {
        assert_eq!(
            format_publisher_destination("/exchange/test-exchange/test-routing-key"),
            "test-exchange:test-routing-key"
        );
    }

    #[test]
    fn publisher_destination_keeps_non_exchange_prefix() {
        assert_eq!(
            format_publisher_destination("/topic/consumer.v1"),
            "topic:consumer.v1"
        );
    }
}
