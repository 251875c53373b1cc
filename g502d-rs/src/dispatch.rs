/* Deferred transmitter: moves blocking sends off the caller's stack.
 *
 * The transport's send primitive may sleep until the device acknowledges
 * the report, while callers (DBus handlers, the inbound report path) must
 * never block. Callers therefore `submit` encoded packets into a bounded
 * FIFO, and one dedicated worker thread performs the actual transport
 * writes, strictly one at a time and in submission order. */

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

use crate::driver::Transport;
use crate::driver::hidpp::Packet;

/* Packets that may wait for the worker before `submit` reports back-pressure. */
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

/* Largest batch a single intent queues (set + get for rate and DPI). A */
/* shallower queue could never accept it. */
pub const MIN_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Dispatch queue is full ({0} packets pending)")]
    QueueFull(usize),

    #[error("Dispatch worker is no longer running")]
    Closed,
}

/* Messages consumed by the worker thread. */
#[derive(Debug)]
enum DispatchMessage {
    Send(Packet),
    /* Stop after everything queued before it has been sent. */
    Shutdown,
}

/* Outcome counters. Failed sends are logged and counted, never retried. */
#[derive(Debug, Default)]
pub struct TransmitStats {
    sent: AtomicU64,
    failed: AtomicU64,
}

impl TransmitStats {
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/* Cloneable submission handle shared by every producer. */
/*  */
/* `closed` doubles as the enqueue lock: producers hold it while checking */
/* the flag and queueing, and shutdown flips it under the same lock before */
/* queueing `Shutdown`, so no packet can land behind the stop marker. */
#[derive(Clone)]
pub struct DispatchHandle {
    tx: mpsc::Sender<DispatchMessage>,
    closed: Arc<Mutex<bool>>,
    stats: Arc<TransmitStats>,
    depth: usize,
}

impl DispatchHandle {
    /* A handle with no worker behind it. Every submit fails with `Closed`. */
    pub fn detached() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self {
            tx,
            closed: Arc::new(Mutex::new(true)),
            stats: Arc::new(TransmitStats::default()),
            depth: 0,
        }
    }

    /* Queue `packet` for transmission. Never blocks. */
    pub fn submit(&self, packet: Packet) -> Result<(), DispatchError> {
        self.submit_all(vec![packet], || {})
    }

    /* Queue every packet in `packets` or none of them. */
    /*  */
    /* Queue space for the whole batch is reserved first; `commit` runs only */
    /* once the reservation holds, so state changes tied to the batch are */
    /* never made for a batch that was refused. Never blocks. */
    pub fn submit_all<F>(&self, packets: Vec<Packet>, commit: F) -> Result<(), DispatchError>
    where
        F: FnOnce(),
    {
        let closed = self.closed.lock();
        if *closed {
            return Err(DispatchError::Closed);
        }
        if packets.is_empty() {
            commit();
            return Ok(());
        }

        let permits = match self.tx.try_reserve_many(packets.len()) {
            Ok(permits) => permits,
            Err(TrySendError::Full(())) => return Err(DispatchError::QueueFull(self.depth)),
            Err(TrySendError::Closed(())) => return Err(DispatchError::Closed),
        };

        commit();
        for (permit, packet) in permits.zip(packets) {
            permit.send(DispatchMessage::Send(packet));
        }
        Ok(())
    }

    pub fn stats(&self) -> &TransmitStats {
        &self.stats
    }
}

/* Owner of the worker thread. Dropping it without `shutdown` detaches the */
/* thread, which exits once the queue has been drained. */
pub struct DispatchWorker {
    tx: mpsc::Sender<DispatchMessage>,
    closed: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl DispatchWorker {
    /* Refuse new packets, send everything already queued, then join the */
    /* worker. Must be called from a context where blocking is allowed. */
    pub fn shutdown(mut self) {
        *self.closed.lock() = true;
        if self.tx.blocking_send(DispatchMessage::Shutdown).is_err() {
            debug!("Dispatch worker already gone");
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Dispatch worker panicked");
        }
    }
}

impl Drop for DispatchWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            *self.closed.lock() = true;
            let _ = self.tx.try_send(DispatchMessage::Shutdown);
        }
    }
}

/* Spawn the dispatch worker for `transport` and return the producer handle */
/* plus the worker owner. */
pub fn spawn_dispatcher(
    transport: Arc<dyn Transport>,
    depth: usize,
) -> std::io::Result<(DispatchHandle, DispatchWorker)> {
    let depth = depth.max(1);
    let (tx, rx) = mpsc::channel(depth);
    let closed = Arc::new(Mutex::new(false));
    let stats = Arc::new(TransmitStats::default());

    let worker_stats = Arc::clone(&stats);
    let handle = std::thread::Builder::new()
        .name("g502-dispatch".into())
        .spawn(move || run_worker(transport, rx, worker_stats))?;

    Ok((
        DispatchHandle {
            tx: tx.clone(),
            closed: Arc::clone(&closed),
            stats,
            depth,
        },
        DispatchWorker {
            tx,
            closed,
            handle: Some(handle),
        },
    ))
}

/* Worker loop: process packets until shutdown or channel close. */
fn run_worker(
    transport: Arc<dyn Transport>,
    mut rx: mpsc::Receiver<DispatchMessage>,
    stats: Arc<TransmitStats>,
) {
    info!("Dispatch worker started (transport: {})", transport.name());

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            DispatchMessage::Send(packet) => run_pending(transport.as_ref(), &packet, &stats),
            DispatchMessage::Shutdown => {
                info!("Dispatch worker shutting down");
                break;
            }
        }
    }

    debug!("Dispatch worker loop exited");
}

/* Perform one blocking send and report the outcome. */
fn run_pending(transport: &dyn Transport, packet: &Packet, stats: &TransmitStats) {
    match transport.send_blocking(packet.report_id(), packet.as_bytes()) {
        Ok(()) => {
            stats.sent.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Sent feature 0x{:02x} fn {} via {}",
                packet.feature_index(),
                packet.function(),
                transport.name()
            );
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            warn!("Failed to send {packet:?} via {}: {e}", transport.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use super::*;
    use crate::driver::TransportError;
    use crate::driver::hidpp::ReportKind;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl Transport for RecordingTransport {
        fn name(&self) -> &str {
            "recording"
        }

        fn send_blocking(&self, _report_id: u8, report: &[u8]) -> Result<(), TransportError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(TransportError::Disconnected);
            }
            self.sent.lock().push(report.to_vec());
            Ok(())
        }
    }

    /* Blocks every send until the test hands out a permit. */
    struct GatedTransport {
        entered: Mutex<std_mpsc::Sender<()>>,
        permits: Mutex<std_mpsc::Receiver<()>>,
        sent: Mutex<Vec<u8>>,
    }

    impl Transport for GatedTransport {
        fn name(&self) -> &str {
            "gated"
        }

        fn send_blocking(&self, _report_id: u8, report: &[u8]) -> Result<(), TransportError> {
            let _ = self.entered.lock().send(());
            let _ = self.permits.lock().recv();
            self.sent.lock().push(report[2]);
            Ok(())
        }
    }

    fn packet(feature: u8) -> Packet {
        Packet::encode(ReportKind::Short, feature, 0x01, &[]).expect("fits")
    }

    #[test]
    fn sends_in_submission_order() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, worker) =
            spawn_dispatcher(transport.clone(), DEFAULT_QUEUE_DEPTH).expect("spawn");

        for feature in 1..=5 {
            handle.submit(packet(feature)).expect("queued");
        }
        worker.shutdown();

        let features: Vec<u8> = transport.sent.lock().iter().map(|r| r[2]).collect();
        assert_eq!(features, [1, 2, 3, 4, 5]);
        assert_eq!(handle.stats().sent(), 5);
        assert_eq!(handle.stats().failed(), 0);
    }

    #[test]
    fn failures_are_counted_not_retried() {
        let transport = Arc::new(RecordingTransport::default());
        transport.fail.store(true, Ordering::Relaxed);
        let (handle, worker) = spawn_dispatcher(transport.clone(), 4).expect("spawn");

        handle.submit(packet(0x0A)).expect("queued");
        handle.submit(packet(0x0B)).expect("queued");
        worker.shutdown();

        assert!(transport.sent.lock().is_empty());
        assert_eq!(handle.stats().failed(), 2);
        assert_eq!(handle.stats().sent(), 0);
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, worker) = spawn_dispatcher(transport, 4).expect("spawn");
        worker.shutdown();
        assert_eq!(handle.submit(packet(1)), Err(DispatchError::Closed));
    }

    #[test]
    fn full_queue_reports_back_pressure_instead_of_overwriting() {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (permit_tx, permit_rx) = std_mpsc::channel();
        let transport = Arc::new(GatedTransport {
            entered: Mutex::new(entered_tx),
            permits: Mutex::new(permit_rx),
            sent: Mutex::new(Vec::new()),
        });
        let (handle, worker) = spawn_dispatcher(transport.clone(), 1).expect("spawn");

        handle.submit(packet(1)).expect("queued");
        entered_rx.recv().expect("worker picked up first packet");

        handle.submit(packet(2)).expect("fills the single slot");
        assert_eq!(handle.submit(packet(3)), Err(DispatchError::QueueFull(1)));

        permit_tx.send(()).expect("permit");
        permit_tx.send(()).expect("permit");
        worker.shutdown();

        assert_eq!(*transport.sent.lock(), [1, 2]);
    }

    #[test]
    fn refused_batch_queues_nothing_and_skips_commit() {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (permit_tx, permit_rx) = std_mpsc::channel();
        let transport = Arc::new(GatedTransport {
            entered: Mutex::new(entered_tx),
            permits: Mutex::new(permit_rx),
            sent: Mutex::new(Vec::new()),
        });
        let (handle, worker) = spawn_dispatcher(transport.clone(), 2).expect("spawn");

        handle.submit(packet(1)).expect("queued");
        entered_rx.recv().expect("worker picked up first packet");
        handle.submit(packet(2)).expect("queued");

        let mut committed = false;
        let result = handle.submit_all(vec![packet(3), packet(4)], || committed = true);
        assert_eq!(result, Err(DispatchError::QueueFull(2)));
        assert!(!committed);

        drop(permit_tx);
        worker.shutdown();
        assert_eq!(*transport.sent.lock(), [1, 2]);
    }

    #[test]
    fn every_accepted_packet_is_sent_across_shutdown() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, worker) = spawn_dispatcher(transport.clone(), 4).expect("spawn");

        let producer = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                let mut accepted = 0u64;
                loop {
                    match handle.submit(packet(1)) {
                        Ok(()) => accepted += 1,
                        Err(DispatchError::QueueFull(_)) => std::thread::yield_now(),
                        Err(DispatchError::Closed) => return accepted,
                    }
                }
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        worker.shutdown();
        let accepted = producer.join().expect("producer");

        assert_eq!(handle.stats().sent(), accepted);
        assert_eq!(transport.sent.lock().len() as u64, accepted);
    }

    #[test]
    fn detached_handle_refuses_everything() {
        let handle = DispatchHandle::detached();
        assert_eq!(handle.submit(packet(1)), Err(DispatchError::Closed));
        let mut committed = false;
        assert_eq!(
            handle.submit_all(Vec::new(), || committed = true),
            Err(DispatchError::Closed)
        );
        assert!(!committed);
    }
}
