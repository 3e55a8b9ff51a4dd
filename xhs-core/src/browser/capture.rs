use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventResponseReceived, GetResponseBodyParams,
    RequestId,
};
use chromiumoxide::page::Page;
use futures::{stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::driver::CapturedResponse;
use super::error::BrowserResult;

/// Responses held for a reader; newer ones are dropped once it is full.
pub const CAPTURE_CAPACITY: usize = 64;

enum NetworkEvent {
    Response { id: RequestId, url: String, status: i64 },
    Finished(RequestId),
    Failed(RequestId),
}

/// Requests whose bodies will be fetched once loading finishes.
struct PendingResponses {
    scope: String,
    accept: fn(&str) -> bool,
    pending: HashMap<String, (String, i64)>,
}

impl PendingResponses {
    fn new(scope: &str, accept: fn(&str) -> bool) -> Self {
        Self {
            scope: scope.to_string(),
            accept,
            pending: HashMap::new(),
        }
    }

    fn on_response(&mut self, id: &RequestId, url: String, status: i64) {
        if url.contains(&self.scope) && (self.accept)(&url) {
            self.pending.insert(id.inner().clone(), (url, status));
        }
    }

    fn on_finished(&mut self, id: &RequestId) -> Option<(String, i64)> {
        self.pending.remove(id.inner())
    }

    fn on_failed(&mut self, id: &RequestId) {
        if let Some((url, _)) = self.pending.remove(id.inner()) {
            trace!(url = %url, "captured request failed to load");
        }
    }

    fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Hands a response to the reader; `false` once the reader is gone.
fn deliver(sender: &mpsc::Sender<CapturedResponse>, response: CapturedResponse) -> bool {
    match sender.try_send(response) {
        Ok(()) => true,
        Err(TrySendError::Full(dropped)) => {
            warn!(url = %dropped.url, "capture queue full; dropping response");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Streams bodies of accepted in-scope responses from one page into a bounded channel.
pub struct ResponseCapture {
    receiver: mpsc::Receiver<CapturedResponse>,
    task: JoinHandle<()>,
}

impl ResponseCapture {
    /// Only responses whose URL contains `scope` and passes `accept` are fetched.
    pub async fn attach(page: &Page, scope: &str, accept: fn(&str) -> bool) -> BrowserResult<Self> {
        let responses = page
            .event_listener::<EventResponseReceived>()
            .await?
            .map(|event| NetworkEvent::Response {
                id: event.request_id.clone(),
                url: event.response.url.clone(),
                status: event.response.status,
            });
        let finished = page
            .event_listener::<EventLoadingFinished>()
            .await?
            .map(|event| NetworkEvent::Finished(event.request_id.clone()));
        let failed = page
            .event_listener::<EventLoadingFailed>()
            .await?
            .map(|event| NetworkEvent::Failed(event.request_id.clone()));
        let mut events = stream::select(stream::select(responses, finished), failed);

        let (sender, receiver) = mpsc::channel(CAPTURE_CAPACITY);
        let page = page.clone();
        let mut pending = PendingResponses::new(scope, accept);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    NetworkEvent::Response { id, url, status } => pending.on_response(&id, url, status),
                    NetworkEvent::Failed(id) => pending.on_failed(&id),
                    NetworkEvent::Finished(id) => {
                        let Some((url, status)) = pending.on_finished(&id) else {
                            continue;
                        };
                        let body = match page.execute(GetResponseBodyParams::new(id)).await {
                            Ok(reply) => decode_body(&reply.body, reply.base64_encoded),
                            Err(err) => {
                                trace!(url = %url, error = %err, "response body unavailable");
                                continue;
                            }
                        };
                        if !deliver(&sender, CapturedResponse { url, status, body }) {
                            break;
                        }
                    }
                }
            }
            debug!(pending = pending.len(), "response capture stream ended");
        });
        Ok(Self { receiver, task })
    }

    pub fn receiver(&mut self) -> &mut mpsc::Receiver<CapturedResponse> {
        &mut self.receiver
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ResponseCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCapture")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl Drop for ResponseCapture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn decode_body(body: &str, base64_encoded: bool) -> String {
    if !base64_encoded {
        return body.to_string();
    }
    match STANDARD.decode(body) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => body.to_string(),
    }
}
