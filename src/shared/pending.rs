//! In-flight request table for transports that read responses on a
//! separate task (local process and event stream).

use crate::error::{Error, Result, TransportError};
use crate::shared::context::RequestContext;
use crate::types::{JSONRPCResponse, RequestId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

type Waiter = oneshot::Sender<Result<JSONRPCResponse>>;

#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    waiters: DashMap<RequestId, Waiter>,
    closed: AtomicBool,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register interest in a response. Fails once the reader has stopped.
    pub(crate) fn register(
        &self,
        id: RequestId,
    ) -> Result<oneshot::Receiver<Result<JSONRPCResponse>>> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed.into());
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id.clone(), tx);
        // fail_all may have drained between the check and the insert
        if self.is_closed() {
            self.waiters.remove(&id);
            return Err(TransportError::ConnectionClosed.into());
        }
        Ok(rx)
    }

    /// Deliver a response. Returns false when nobody was waiting for it.
    pub(crate) fn complete(&self, response: JSONRPCResponse) -> bool {
        let Some(id) = response.id.clone() else {
            return false;
        };
        match self.waiters.remove(&id) {
            Some((_, tx)) => tx.send(Ok(response)).is_ok(),
            None => false,
        }
    }

    pub(crate) fn cancel(&self, id: &RequestId) {
        self.waiters.remove(id);
    }

    /// Mark the table closed and fail every waiter with `ConnectionClosed`.
    pub(crate) fn fail_all(&self) {
        self.closed.store(true, Ordering::Release);
        let ids: Vec<RequestId> = self.waiters.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, tx)) = self.waiters.remove(&id) {
                let _ = tx.send(Err(TransportError::ConnectionClosed.into()));
            }
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Wait for a registered response, dropping the registration on failure.
    pub(crate) async fn wait(
        &self,
        id: &RequestId,
        rx: oneshot::Receiver<Result<JSONRPCResponse>>,
        ctx: &RequestContext,
    ) -> Result<JSONRPCResponse> {
        let result = ctx
            .run(async {
                match rx.await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Transport(TransportError::ConnectionClosed)),
                }
            })
            .await;
        if result.is_err() {
            self.cancel(id);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn completes_matching_waiter() {
        let pending = PendingRequests::new();
        let id = RequestId::Number(1);
        let rx = pending.register(id.clone()).unwrap();

        assert!(pending.complete(JSONRPCResponse::success(1, json!({"ok": true}))));
        let response = pending
            .wait(&id, rx, &RequestContext::background())
            .await
            .unwrap();
        assert_eq!(response.result, Some(json!({"ok": true})));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unmatched_response_is_reported() {
        let pending = PendingRequests::new();
        assert!(!pending.complete(JSONRPCResponse::success(99, json!(null))));
    }

    #[tokio::test]
    async fn fail_all_wakes_waiters_and_rejects_new_ones() {
        let pending = PendingRequests::new();
        let id = RequestId::Number(5);
        let rx = pending.register(id.clone()).unwrap();

        pending.fail_all();

        let err = pending
            .wait(&id, rx, &RequestContext::background())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::ConnectionClosed)
        ));
        assert!(pending.register(RequestId::Number(6)).is_err());
    }
}
