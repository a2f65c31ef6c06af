use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use std::fmt::Display;
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

pub const X_AMZ_INVOCATION_TYPE: &str = "x-amz-invocation-type";

pub const INVOCATION_TYPE_EVENT: &str = "Event";
pub const INVOCATION_TYPE_REQUEST_RESPONSE: &str = "RequestResponse";

/// One accepted client request on its way through the emulator.
///
/// The invocation is owned by whichever component currently holds it
/// (queue, dispatcher, worker). Its reply carrier is single-shot: sending
/// consumes the sender, and dropping the invocation without responding is
/// observed by the frontend as a closed carrier (mapped to 500).
#[derive(Debug)]
pub struct Invocation {
    pub id: Uuid,
    pub body: Bytes,
    pub headers: HeaderMap,
    reply: oneshot::Sender<Response>,
}

impl Invocation {
    /// Mints a fresh invocation and hands back the receiving half of its
    /// reply carrier. The caller (the frontend) awaits the receiver.
    pub fn new(body: Bytes, headers: HeaderMap) -> (Self, oneshot::Receiver<Response>) {
        let (reply, rx) = oneshot::channel();
        let inv = Self {
            id: Uuid::new_v4(),
            body,
            headers,
            reply,
        };
        (inv, rx)
    }

    pub fn is_event(&self) -> bool {
        self.headers
            .get(X_AMZ_INVOCATION_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v == INVOCATION_TYPE_EVENT)
            .unwrap_or(false)
    }

    /// Delivers the terminal response. A failed send means the awaiting
    /// side already went away (client disconnect or frontend timeout),
    /// which is tolerated.
    pub fn respond(self, response: Response) {
        let id = self.id;
        if self.reply.send(response).is_err() {
            debug!(invocation = %id, "reply receiver already dropped");
        }
    }
}

/// Terminal outcome of an invocation. The error tag is for logging only
/// and never reaches the wire as a field.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub error: Option<String>,
}

impl Response {
    pub fn new(status: StatusCode, body: Bytes) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
            error: None,
        }
    }

    /// Standard `{"message": "..."}` JSON body used by every emulator-made
    /// error response.
    pub fn message(status: StatusCode, message: impl Display) -> Self {
        let payload = serde_json::json!({ "message": message.to_string() });
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body: Bytes::from(payload.to_string()),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Display) -> Self {
        self.error = Some(error.to_string());
        self
    }
}
