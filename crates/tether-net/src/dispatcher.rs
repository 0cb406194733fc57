//! Inbound routing: responses to their pending request, everything else to
//! the event subscribers.

use crate::codec::{ERROR_EVENT, InboundFrame};
use crate::error::RequestError;
use crate::notification::{Notification, Notifier, ServerEvent};
use crate::registry::{RequestRegistry, RequestResult};

/// Where a frame ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Resolved the pending request with this id.
    Response(u64),
    /// Broadcast as an unsolicited event.
    Event,
    /// Carried a correlation id nobody is waiting for (late or unknown).
    UnknownCorrelation(u64),
    /// Had neither a pending correlation id nor an event name.
    Unroutable,
}

/// Routes decoded application frames.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    notifier: Notifier,
}

impl Dispatcher {
    /// Create a dispatcher publishing through `notifier`.
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }

    /// Route one frame. Dropped frames are reported through the returned
    /// [`Route`] and left for the caller to log.
    ///
    /// Correlation id `0` or `None` marks an unsolicited event. A non-zero id
    /// that is no longer pending is dropped rather than rebroadcast, since it
    /// answers a request that already timed out or was cancelled.
    pub fn dispatch(&self, frame: InboundFrame, registry: &mut RequestRegistry) -> Route {
        match frame.correlation_id.filter(|&id| id != 0) {
            Some(id) if registry.contains(id) => {
                let result: RequestResult = match frame.event.as_deref() {
                    Some(ERROR_EVENT) => Err(RequestError::Remote(frame.payload)),
                    _ => Ok(frame.payload),
                };
                if let Some(resolved) = registry.resolve(id, result.clone()) {
                    tracing::trace!(
                        correlation_id = id,
                        event = %resolved.event,
                        elapsed = ?resolved.elapsed,
                        delivered = resolved.delivered,
                        "Response matched"
                    );
                }
                self.notifier.publish(Notification::ResponseReceived {
                    correlation_id: id,
                    result,
                });
                Route::Response(id)
            }
            Some(id) => Route::UnknownCorrelation(id),
            None => match frame.event {
                Some(event) => {
                    tracing::trace!(%event, "Broadcasting server event");
                    self.notifier
                        .publish(Notification::EventReceived(ServerEvent {
                            event,
                            payload: frame.payload,
                        }));
                    Route::Event
                }
                None => Route::Unroutable,
            },
        }
    }
}
