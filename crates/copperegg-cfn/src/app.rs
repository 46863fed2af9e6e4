// Job dispatch and the main event loop.
//
// Job payloads arrive from the WebSocket ingress already parsed. Each one is
// offered to every registered handler and executed by the handlers that
// accept it. Every execution produces one `JobOutcome`, which is
// forwarded to the outcome channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::handlers::Handler;
use crate::protocol::{JobOutcome, Payload};
use crate::ws_server::WsEvent;

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct Dispatcher {
    handlers: Vec<Box<dyn Handler>>,
}

impl Dispatcher {
    pub fn new(handlers: Vec<Box<dyn Handler>>) -> Self {
        Self { handlers }
    }

    pub fn register(&mut self, handler: Box<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn handler_names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Process one raw job message. Invalid JSON is dropped with a warning;
    /// a message no handler accepts yields no outcomes.
    pub async fn dispatch(&self, raw: &str) -> Vec<JobOutcome> {
        let payload = match Payload::from_json(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Dropping unparsable job message: {e}");
                return Vec::new();
            }
        };
        self.dispatch_payload(&payload).await
    }

    pub async fn dispatch_payload(&self, payload: &Payload) -> Vec<JobOutcome> {
        let job_id = payload.job_id();
        let mut outcomes = Vec::new();

        for handler in self.handlers.iter().filter(|h| h.valid(payload)) {
            debug!(handler = handler.name(), job_id = ?job_id, "Executing job");
            let outcome = match handler.execute(payload).await {
                Ok(()) => JobOutcome::completed(job_id.clone(), handler.name()),
                Err(e) => {
                    let reason = format!("{e:#}");
                    error!(handler = handler.name(), job_id = ?job_id, "Job failed: {reason}");
                    JobOutcome::failed(job_id.clone(), handler.name(), reason)
                }
            };
            outcomes.push(outcome);
        }

        if outcomes.is_empty() {
            debug!(job_id = ?job_id, "No handler accepted job");
        }
        outcomes
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Run the dispatch loop until the ingress channel closes.
///
/// Each job message is dispatched on its own task so a slow CopperEgg call
/// does not hold up unrelated jobs. Outstanding jobs are drained before the
/// loop returns.
pub async fn run(
    mut ws_rx: mpsc::Receiver<WsEvent>,
    outcome_tx: mpsc::Sender<JobOutcome>,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()> {
    info!(handlers = ?dispatcher.handler_names(), "Dispatch loop started");
    let mut jobs = JoinSet::new();

    while let Some(event) = ws_rx.recv().await {
        match event {
            WsEvent::Connected { addr } => info!(%addr, "Event source connected"),
            WsEvent::Disconnected { addr } => info!(%addr, "Event source disconnected"),
            WsEvent::Malformed { addr, error } => {
                warn!(%addr, "Dropping unparsable job message: {error}");
            }
            WsEvent::Job(payload) => {
                let dispatcher = Arc::clone(&dispatcher);
                let outcome_tx = outcome_tx.clone();
                jobs.spawn(async move {
                    for outcome in dispatcher.dispatch_payload(&payload).await {
                        if outcome_tx.send(outcome).await.is_err() {
                            debug!("Outcome receiver dropped");
                            break;
                        }
                    }
                });
            }
        }

        // Reap finished jobs so the set does not grow without bound.
        while let Some(joined) = jobs.try_join_next() {
            if let Err(e) = joined {
                error!("Job task panicked: {e}");
            }
        }
    }

    info!("Ingress channel closed, waiting for {} job(s)", jobs.len());
    while let Some(joined) = jobs.join_next().await {
        if let Err(e) = joined {
            error!("Job task panicked: {e}");
        }
    }

    Ok(())
}

/// Wait up to `grace` for the dispatch loop task to finish its in-flight
/// jobs. Returns `false` when it had to be abandoned.
pub async fn drain(handle: JoinHandle<()>, grace: Duration) -> bool {
    match tokio::time::timeout(grace, handle).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Dispatch loop task failed: {e}");
            false
        }
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs_f64(),
                "In-flight jobs did not finish before shutdown, abandoning them"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JobStatus;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts payloads whose `data.kind` equals `kind`; fails when
    /// `data.fail` is true.
    struct FakeHandler {
        kind: &'static str,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for FakeHandler {
        fn name(&self) -> &'static str {
            self.kind
        }

        fn valid(&self, payload: &Payload) -> bool {
            payload.get(&["kind"]).and_then(|v| v.as_str()) == Some(self.kind)
        }

        async fn execute(&self, payload: &Payload) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if payload.get(&["fail"]).and_then(|v| v.as_bool()) == Some(true) {
                anyhow::bail!("requested failure");
            }
            Ok(())
        }
    }

    fn dispatcher(calls: &Arc<AtomicUsize>) -> Dispatcher {
        let mut d = Dispatcher::default();
        d.register(Box::new(FakeHandler {
            kind: "alpha",
            calls: Arc::clone(calls),
        }));
        d.register(Box::new(FakeHandler {
            kind: "beta",
            calls: Arc::clone(calls),
        }));
        d
    }

    #[tokio::test]
    async fn dispatch_routes_to_valid_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let outcomes = dispatcher(&calls)
            .dispatch(r#"{"id":"j1","data":{"kind":"beta"}}"#)
            .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].handler, "beta");
        assert_eq!(outcomes[0].job_id.as_deref(), Some("j1"));
        assert!(outcomes[0].is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_wraps_handler_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let outcomes = dispatcher(&calls)
            .dispatch(r#"{"data":{"kind":"alpha","fail":true}}"#)
            .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(
            outcomes[0].status,
            JobStatus::Failed {
                reason: "requested failure".into()
            }
        );
    }

    #[tokio::test]
    async fn dispatch_ignores_bad_json_and_unclaimed_jobs() {
        let calls = Arc::new(AtomicUsize::new(0));
        let d = dispatcher(&calls);

        assert!(d.dispatch("{not json").await.is_empty());
        assert!(d.dispatch(r#"{"data":{"kind":"gamma"}}"#).await.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn run_forwards_outcomes_and_drains_on_close() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (ws_tx, ws_rx) = mpsc::channel(8);
        let (outcome_tx, mut outcome_rx) = mpsc::channel(8);

        let handle = tokio::spawn(run(ws_rx, outcome_tx, Arc::new(dispatcher(&calls))));

        let addr: std::net::SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let job = |raw: &str| WsEvent::Job(Payload::from_json(raw).unwrap());

        ws_tx.send(WsEvent::Connected { addr }).await.unwrap();
        ws_tx
            .send(job(r#"{"id":1,"data":{"kind":"alpha"}}"#))
            .await
            .unwrap();
        ws_tx
            .send(WsEvent::Malformed {
                addr,
                error: "expected value".into(),
            })
            .await
            .unwrap();
        ws_tx
            .send(job(r#"{"id":2,"data":{"kind":"beta","fail":true}}"#))
            .await
            .unwrap();
        ws_tx.send(WsEvent::Disconnected { addr }).await.unwrap();
        drop(ws_tx);

        handle.await.unwrap().unwrap();

        let mut outcomes = Vec::new();
        while let Some(outcome) = outcome_rx.recv().await {
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|o| o.job_id.clone());

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].job_id.as_deref(), Some("1"));
        assert!(outcomes[0].is_completed());
        assert_eq!(outcomes[1].job_id.as_deref(), Some("2"));
        assert!(!outcomes[1].is_completed());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn drain_reports_finished_loop() {
        let handle = tokio::spawn(async {});
        assert!(drain(handle, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn drain_gives_up_on_stuck_jobs() {
        let handle = tokio::spawn(std::future::pending::<()>());
        assert!(!drain(handle, Duration::from_millis(50)).await);
    }
}
