//! Operation gate
//!
//! Serializes the operations of one connection. A driver task owns the queue
//! and admits jobs in call order; at most one job is in flight, and the next
//! is admitted only once the in-flight one has been resolved by the
//! correlator, failed, or timed out. Callers that stop waiting do not stall
//! the queue: an issued operation is still awaited (or timed out) by the
//! driver and its result discarded.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{GattError, Result};
use crate::gatt::operation::{OperationKind, PendingOperation, Response, Target};

/// Fires the platform call of an admitted operation
pub type Issue = Box<dyn FnOnce() -> Result<()> + Send>;

struct Job {
    operation: PendingOperation,
    expects_callback: bool,
    issue: Issue,
    responder: oneshot::Sender<Result<Response>>,
}

struct InFlight {
    operation: PendingOperation,
    resolver: oneshot::Sender<Result<Response>>,
}

struct Shared {
    name: String,
    timeout: Duration,
    in_flight: Mutex<Option<InFlight>>,
    closed: AtomicBool,
}

impl Shared {
    fn slot(&self) -> std::sync::MutexGuard<'_, Option<InFlight>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-connection FIFO of operations with a single in-flight slot
pub struct OperationGate {
    shared: Arc<Shared>,
    queue: mpsc::UnboundedSender<Job>,
}

impl OperationGate {
    /// Creates the gate and spawns its driver. Must be called from within a
    /// tokio runtime.
    pub fn new(name: impl Into<String>, timeout: Duration) -> Self {
        let shared = Arc::new(Shared {
            name: name.into(),
            timeout,
            in_flight: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let (queue, jobs) = mpsc::unbounded_channel();
        tokio::spawn(drive(shared.clone(), jobs));
        Self { shared, queue }
    }

    /// Queues an operation and waits for its result.
    ///
    /// `issue` runs once the operation is admitted. Operations without a
    /// callback complete as soon as `issue` returns.
    pub async fn enqueue(
        &self,
        operation: PendingOperation,
        expects_callback: bool,
        issue: Issue,
    ) -> Result<Response> {
        let result = self.submit(operation, expects_callback, issue)?;
        result.await.unwrap_or(Err(GattError::ConnectionLost))
    }

    /// Queues an operation without waiting. The result arrives on the
    /// returned receiver; dropping it before admission withdraws the
    /// operation.
    pub fn submit(
        &self,
        operation: PendingOperation,
        expects_callback: bool,
        issue: Issue,
    ) -> Result<oneshot::Receiver<Result<Response>>> {
        if self.is_closed() {
            return Err(GattError::ConnectionLost);
        }
        let (responder, result) = oneshot::channel();
        self.queue
            .send(Job {
                operation,
                expects_callback,
                issue,
                responder,
            })
            .map_err(|_| GattError::ConnectionLost)?;
        Ok(result)
    }

    /// Hands a callback result to the in-flight operation if it matches by
    /// kind and target. Returns false when nothing was waiting for it.
    pub fn resolve(&self, kind: OperationKind, target: Target, result: Result<Response>) -> bool {
        self.resolve_with(kind, target, result, |_| {})
    }

    /// Like [`resolve`](Self::resolve), but runs `apply` on the matched
    /// result before the waiter is woken.
    pub fn resolve_with(
        &self,
        kind: OperationKind,
        target: Target,
        result: Result<Response>,
        apply: impl FnOnce(&Result<Response>),
    ) -> bool {
        let mut slot = self.shared.slot();
        let matched = slot
            .as_ref()
            .map(|f| f.operation.matches(kind, target))
            .unwrap_or(false);
        if !matched {
            return false;
        }
        apply(&result);
        match slot.take() {
            Some(in_flight) => {
                debug!(
                    "{}: {} resolved after {:?}",
                    self.shared.name,
                    in_flight.operation,
                    in_flight.operation.created.elapsed()
                );
                // The driver may already have given up on it
                let _ = in_flight.resolver.send(result);
                true
            }
            None => false,
        }
    }

    /// The operation currently waiting for its callback
    pub fn in_flight(&self) -> Option<PendingOperation> {
        self.shared.slot().as_ref().map(|f| f.operation.clone())
    }

    /// Fails the in-flight operation and every queued one with
    /// [`GattError::ConnectionLost`], in queue order. Later enqueues fail
    /// immediately.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("{}: gate closed", self.shared.name);
        if let Some(in_flight) = self.shared.slot().take() {
            let _ = in_flight.resolver.send(Err(GattError::ConnectionLost));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for OperationGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGate")
            .field("name", &self.shared.name)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn drive(shared: Arc<Shared>, mut jobs: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = jobs.recv().await {
        if shared.closed.load(Ordering::SeqCst) {
            let _ = job.responder.send(Err(GattError::ConnectionLost));
            continue;
        }
        if job.responder.is_closed() {
            trace!("{}: {} cancelled before admission", shared.name, job.operation);
            continue;
        }

        let result = admit(&shared, job.operation, job.expects_callback, job.issue).await;
        // The caller may have stopped waiting
        let _ = job.responder.send(result);
    }
    trace!("{}: gate driver finished", shared.name);
}

async fn admit(
    shared: &Shared,
    operation: PendingOperation,
    expects_callback: bool,
    issue: Issue,
) -> Result<Response> {
    debug!("{}: admitting {}", shared.name, operation);
    let kind = operation.kind;

    let (resolver, resolved) = oneshot::channel();
    if expects_callback {
        *shared.slot() = Some(InFlight {
            operation: operation.clone(),
            resolver,
        });
        // close() may have run after the driver checked the flag
        if shared.closed.load(Ordering::SeqCst) {
            shared.slot().take();
            return Err(GattError::ConnectionLost);
        }
    }

    if let Err(e) = issue() {
        warn!("{}: {} could not be issued: {}", shared.name, operation, e);
        shared.slot().take();
        return Err(e);
    }
    if !expects_callback {
        return Ok(Response::Done);
    }

    match tokio::time::timeout(shared.timeout, resolved).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(GattError::ConnectionLost),
        Err(_) => {
            warn!(
                "{}: {} timed out after {:?}, releasing gate",
                shared.name, operation, shared.timeout
            );
            let mut slot = shared.slot();
            if slot
                .as_ref()
                .map(|f| f.operation == operation)
                .unwrap_or(false)
            {
                slot.take();
            }
            Err(GattError::OperationTimeout { kind })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(kind: OperationKind) -> PendingOperation {
        PendingOperation::new(kind, Target::None)
    }

    fn record(log: &Arc<Mutex<Vec<u32>>>, id: u32) -> Issue {
        let log = log.clone();
        Box::new(move || {
            log.lock().unwrap().push(id);
            Ok(())
        })
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_second_operation_waits_for_first() {
        let gate = Arc::new(OperationGate::new("test", Duration::from_secs(30)));
        let issued = Arc::new(Mutex::new(Vec::new()));

        let g = gate.clone();
        let i = record(&issued, 1);
        let first = tokio::spawn(async move { g.enqueue(op(OperationKind::ReadRssi), true, i).await });
        settle().await;

        let g = gate.clone();
        let i = record(&issued, 2);
        let second = tokio::spawn(async move { g.enqueue(op(OperationKind::ReadPhy), true, i).await });
        settle().await;

        assert_eq!(*issued.lock().unwrap(), vec![1]);
        assert_eq!(gate.in_flight().map(|o| o.kind), Some(OperationKind::ReadRssi));

        assert!(gate.resolve(OperationKind::ReadRssi, Target::None, Ok(Response::Rssi(-42))));
        assert_eq!(first.await.unwrap(), Ok(Response::Rssi(-42)));
        settle().await;

        assert_eq!(*issued.lock().unwrap(), vec![1, 2]);
        assert!(gate.resolve(
            OperationKind::ReadPhy,
            Target::None,
            Ok(Response::Phy(Default::default()))
        ));
        assert!(second.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_mismatched_callback_is_ignored() {
        let gate = Arc::new(OperationGate::new("test", Duration::from_secs(30)));
        let issued = Arc::new(Mutex::new(Vec::new()));
        let target = Target::Characteristic(7);

        let g = gate.clone();
        let i = record(&issued, 1);
        let read = tokio::spawn(async move {
            g.enqueue(
                PendingOperation::new(OperationKind::ReadCharacteristic, target),
                true,
                i,
            )
            .await
        });
        settle().await;

        assert!(!gate.resolve(
            OperationKind::ReadCharacteristic,
            Target::Characteristic(5),
            Ok(Response::Value(vec![0xFF]))
        ));
        assert!(!gate.resolve(OperationKind::ReadRssi, Target::None, Ok(Response::Rssi(0))));
        assert!(gate.in_flight().is_some());

        assert!(gate.resolve(
            OperationKind::ReadCharacteristic,
            target,
            Ok(Response::Value(vec![0x01]))
        ));
        assert_eq!(read.await.unwrap(), Ok(Response::Value(vec![0x01])));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_callback_times_out_and_releases_gate() {
        let gate = OperationGate::new("test", Duration::from_secs(5));
        let issued = Arc::new(Mutex::new(Vec::new()));

        let result = gate
            .enqueue(op(OperationKind::RequestMtu), true, record(&issued, 1))
            .await;
        assert_eq!(
            result,
            Err(GattError::OperationTimeout {
                kind: OperationKind::RequestMtu
            })
        );
        assert!(gate.in_flight().is_none());

        let result = gate
            .enqueue(op(OperationKind::ReliableWriteAbort), false, record(&issued, 2))
            .await;
        assert_eq!(result, Ok(Response::Done));
        assert_eq!(*issued.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_issue_failure_goes_to_its_caller_only() {
        let gate = OperationGate::new("test", Duration::from_secs(30));
        let failing: Issue = Box::new(|| Err(GattError::Transport("busy".into())));

        let result = gate.enqueue(op(OperationKind::ReadRssi), true, failing).await;
        assert_eq!(result, Err(GattError::Transport("busy".into())));
        assert!(gate.in_flight().is_none());
        assert!(!gate.is_closed());
    }

    #[tokio::test]
    async fn test_close_fails_every_waiter_in_order() {
        let gate = Arc::new(OperationGate::new("test", Duration::from_secs(30)));
        let issued = Arc::new(Mutex::new(Vec::new()));
        let finished = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for id in 1..=3u32 {
            let g = gate.clone();
            let i = record(&issued, id);
            let f = finished.clone();
            tasks.push(tokio::spawn(async move {
                let result = g.enqueue(op(OperationKind::ReadRssi), true, i).await;
                f.lock().unwrap().push(id);
                result
            }));
            settle().await;
        }

        gate.close();
        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(GattError::ConnectionLost));
        }
        assert_eq!(*issued.lock().unwrap(), vec![1]);
        assert_eq!(*finished.lock().unwrap(), vec![1, 2, 3]);

        let late = gate
            .enqueue(op(OperationKind::ReadRssi), true, record(&issued, 4))
            .await;
        assert_eq!(late, Err(GattError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_cancelled_caller_does_not_stall_queue() {
        let gate = Arc::new(OperationGate::new("test", Duration::from_secs(30)));
        let issued = Arc::new(Mutex::new(Vec::new()));

        let g = gate.clone();
        let i = record(&issued, 1);
        let abandoned = tokio::spawn(async move { g.enqueue(op(OperationKind::ReadRssi), true, i).await });
        settle().await;
        abandoned.abort();
        settle().await;

        // Still in flight: the call went out and its callback is awaited
        assert_eq!(gate.in_flight().map(|o| o.kind), Some(OperationKind::ReadRssi));

        let g = gate.clone();
        let i = record(&issued, 2);
        let next = tokio::spawn(async move { g.enqueue(op(OperationKind::ReadPhy), true, i).await });
        settle().await;
        assert_eq!(*issued.lock().unwrap(), vec![1]);

        assert!(gate.resolve(OperationKind::ReadRssi, Target::None, Ok(Response::Rssi(-60))));
        settle().await;
        assert!(gate.resolve(
            OperationKind::ReadPhy,
            Target::None,
            Ok(Response::Phy(Default::default()))
        ));
        assert!(next.await.unwrap().is_ok());
        assert_eq!(*issued.lock().unwrap(), vec![1, 2]);
    }
}
