//! Request correlation for calls whose result somebody waits on.

use std::collections::HashMap;

use shared::{
    domain::RequestId,
    error::RemoteError,
    protocol::{Response, ResponseValue},
};
use tokio::sync::oneshot;

pub type Completion = Result<ResponseValue, RemoteError>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: HashMap<RequestId, oneshot::Sender<Completion>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter for the response to `req_id`.
    pub fn register(&mut self, req_id: RequestId) -> oneshot::Receiver<Completion> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(req_id, tx);
        rx
    }

    /// Routes a response to its waiter. Returns the response back when
    /// nobody registered for it.
    pub fn resolve(&mut self, response: Response) -> Option<Response> {
        let Some(waiter) = self.waiters.remove(&response.req_id) else {
            return Some(response);
        };
        // A dropped receiver means the caller gave up; nothing else to notify.
        let _ = waiter.send(response.outcome.into_result());
        None
    }

    pub fn cancel(&mut self, req_id: RequestId) -> bool {
        self.waiters.remove(&req_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use shared::{domain::ClientId, error::ErrorCode};

    use super::*;

    #[test]
    fn each_response_reaches_only_its_own_waiter() {
        let mut pending = PendingRequests::new();
        let mut first = pending.register(RequestId(1));
        let mut second = pending.register(RequestId(2));

        assert!(pending
            .resolve(Response::ok(RequestId(2), ResponseValue::Client(ClientId(4))))
            .is_none());
        assert_eq!(
            second.try_recv().expect("second resolved"),
            Ok(ResponseValue::Client(ClientId(4)))
        );
        assert!(first.try_recv().is_err());

        let error = RemoteError::new(ErrorCode::NotFound, "unknown user 9");
        assert!(pending
            .resolve(Response::err(RequestId(1), error.clone()))
            .is_none());
        assert_eq!(first.try_recv().expect("first resolved"), Err(error));
        assert!(pending.is_empty());
    }

    #[test]
    fn a_response_resolves_at_most_once() {
        let mut pending = PendingRequests::new();
        let _rx = pending.register(RequestId(7));

        assert!(pending
            .resolve(Response::ok(RequestId(7), ResponseValue::Unit))
            .is_none());
        let again = pending.resolve(Response::ok(RequestId(7), ResponseValue::Unit));
        assert_eq!(again, Some(Response::ok(RequestId(7), ResponseValue::Unit)));
    }

    #[test]
    fn unregistered_responses_are_handed_back() {
        let mut pending = PendingRequests::new();
        let response = Response::ok(RequestId(3), ResponseValue::Unit);
        assert_eq!(pending.resolve(response.clone()), Some(response));

        let _rx = pending.register(RequestId(4));
        assert!(pending.cancel(RequestId(4)));
        assert!(!pending.cancel(RequestId(4)));
        assert_eq!(pending.len(), 0);
    }
}
