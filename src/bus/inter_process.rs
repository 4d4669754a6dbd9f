use crate::error::BusError;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answers requests on one topic
pub type RequestHandler = Box<dyn Fn(&Value) -> Result<Value, String> + Send + Sync>;

struct Request {
    topic: String,
    payload: Value,
    reply: Sender<Result<Value, BusError>>,
}

/// Dispatches requests from any stage to handlers registered by topic.
pub struct InterProcessCommunicator {
    requests: Sender<Request>,
    handlers: Arc<RwLock<HashMap<String, RequestHandler>>>,
    handle: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl InterProcessCommunicator {
    pub fn start(cancel: CancellationToken) -> std::io::Result<Self> {
        let (tx, rx) = bounded::<Request>(64);
        let handlers: Arc<RwLock<HashMap<String, RequestHandler>>> = Arc::default();
        let thread_handlers = Arc::clone(&handlers);
        let thread_cancel = cancel.clone();

        let handle = std::thread::Builder::new()
            .name("communicator".to_string())
            .spawn(move || dispatch_loop(rx, thread_handlers, thread_cancel))?;

        info!("Inter-process communicator started");
        Ok(Self {
            requests: tx,
            handlers,
            handle: Some(handle),
            cancel,
        })
    }

    pub fn register<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .insert(topic.to_string(), Box::new(handler));
        debug!("Registered request handler for {}", topic);
    }

    pub fn requestor(&self, timeout: Duration) -> InterProcessRequestor {
        InterProcessRequestor {
            requests: self.requests.clone(),
            timeout,
        }
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Communicator thread panicked");
            }
        }
        info!("Inter-process communicator stopped");
    }
}

impl Drop for InterProcessCommunicator {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

fn dispatch_loop(
    rx: Receiver<Request>,
    handlers: Arc<RwLock<HashMap<String, RequestHandler>>>,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let request = match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let result = match handlers.read().get(&request.topic) {
            Some(handler) => handler(&request.payload).map_err(|details| BusError::HandlerFailed {
                topic: request.topic.clone(),
                details,
            }),
            None => Err(BusError::NoHandler {
                topic: request.topic.clone(),
            }),
        };
        // requester may have timed out already
        let _ = request.reply.send(result);
    }
    debug!("Communicator dispatch loop exited");
}

/// Client side of the request/response primitive. Cheap to clone.
#[derive(Clone)]
pub struct InterProcessRequestor {
    requests: Sender<Request>,
    timeout: Duration,
}

impl InterProcessRequestor {
    /// Send `payload` on `topic` and wait for the decoded reply
    pub fn send_data<T, R>(&self, topic: &str, payload: &T) -> Result<R, BusError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload).map_err(|e| BusError::Decode {
            topic: topic.to_string(),
            details: e.to_string(),
        })?;
        let (reply_tx, reply_rx) = bounded(1);
        let request = Request {
            topic: topic.to_string(),
            payload,
            reply: reply_tx,
        };

        self.requests
            .send_timeout(request, self.timeout)
            .map_err(|_| BusError::Timeout {
                topic: topic.to_string(),
                timeout: self.timeout,
            })?;

        let value = match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result?,
            Err(RecvTimeoutError::Timeout) => {
                return Err(BusError::Timeout {
                    topic: topic.to_string(),
                    timeout: self.timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => return Err(BusError::Disconnected),
        };

        serde_json::from_value(value).map_err(|e| BusError::Decode {
            topic: topic.to_string(),
            details: e.to_string(),
        })
    }
}
