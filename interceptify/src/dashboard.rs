//! Built-in operator dashboard: a status page and a live event stream.

use http::header::{CACHE_CONTROL, CONNECTION, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use tracing::debug;

use crate::Body;
use crate::events::EventBus;

/// Static status page served on the internal hostnames.
const STATUS_PAGE: &str = include_str!("../assets/dashboard.html");

/// Serves a request routed to an internal hostname.
///
/// `GET /events` attaches a fresh bus subscription and streams it as
/// server-sent events; the subscription is torn down when the response body
/// is dropped. Every other path gets the status page.
pub(crate) fn respond<T>(req: &Request<T>, events: &EventBus) -> Response<Body> {
    if req.uri().path() == "/events" {
        let rx = events.subscribe();
        debug!(subscribers = events.subscriber_count(), "dashboard subscriber attached");
        return Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive")
            .body(Body::from_events(rx))
            .expect("valid response");
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html")
        .body(Body::from(STATUS_PAGE))
        .expect("valid response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_status_page_on_root() {
        let bus = EventBus::new();
        let req = Request::builder().uri("http://interceptify/").body(()).unwrap();

        let res = respond(&req, &bus);

        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()[CONTENT_TYPE], "text/html");
    }

    #[tokio::test]
    async fn events_endpoint_registers_a_subscriber() {
        let bus = EventBus::new();
        let req = Request::builder()
            .uri("http://interceptify/events")
            .body(())
            .unwrap();

        let res = respond(&req, &bus);

        assert_eq!(res.headers()[CONTENT_TYPE], "text/event-stream");
        assert_eq!(res.headers()[CACHE_CONTROL], "no-cache");
        assert_eq!(bus.subscriber_count(), 1);
    }
}
