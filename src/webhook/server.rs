//! axum adapter mounting a [`WebhookChannel`] on a route.

use std::sync::Arc;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;

use super::channel::{MessageHandler, WebhookChannel, WebhookQuery, WebhookResponse};
use super::envelope::MAX_ENVELOPE_BYTES;

struct Endpoint<H> {
    channel: Arc<WebhookChannel>,
    handler: Arc<H>,
}

impl<H> Clone for Endpoint<H> {
    fn clone(&self) -> Self {
        Self {
            channel: Arc::clone(&self.channel),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl IntoResponse for WebhookResponse {
    fn into_response(self) -> Response {
        (
            self.status,
            [(header::CONTENT_TYPE, self.content_type)],
            self.body,
        )
            .into_response()
    }
}

/// Router answering GET (handshake) and POST (messages) on `path`.
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use wxkit::webhook::{InboundMessage, WebhookChannel, router};
///
/// # async fn example() -> std::io::Result<()> {
/// let channel = Arc::new(WebhookChannel::new("callback-token"));
/// let app = router("/wechat", channel, |message: InboundMessage| async move {
///     tracing::info!(bytes = message.payload.len(), "Received message");
///     Ok::<Option<String>, wxkit::WxError>(None)
/// });
///
/// let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
/// axum::serve(listener, app).await
/// # }
/// ```
pub fn router<H>(path: &str, channel: Arc<WebhookChannel>, handler: H) -> Router
where
    H: MessageHandler + 'static,
{
    let endpoint = Endpoint {
        channel,
        handler: Arc::new(handler),
    };
    Router::new()
        .route(path, get(handle_get::<H>).post(handle_post::<H>))
        .layer(DefaultBodyLimit::max(MAX_ENVELOPE_BYTES))
        .with_state(endpoint)
}

async fn handle_get<H: MessageHandler + 'static>(
    State(endpoint): State<Endpoint<H>>,
    Query(query): Query<WebhookQuery>,
) -> WebhookResponse {
    endpoint.channel.handle_get(&query)
}

async fn handle_post<H: MessageHandler + 'static>(
    State(endpoint): State<Endpoint<H>>,
    Query(query): Query<WebhookQuery>,
    body: String,
) -> WebhookResponse {
    endpoint
        .channel
        .handle_post(&query, &body, endpoint.handler.as_ref())
        .await
}
