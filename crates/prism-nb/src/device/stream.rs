//! In-order execution streams.
//!
//! Each [`Stream`] owns a worker thread draining a command queue in program
//! order, so work issued from the controlling thread runs asynchronously with
//! respect to it. Ordering between two streams exists only through
//! [`Event`]s.
//!
//! A failed command leaves a sticky error on the stream: later commands are
//! skipped (event records still retire so no other stream deadlocks) and every
//! subsequent issue or synchronize reports the failure.

use super::buffer::{DeviceBuffer, DeviceRepr, HostBuffer};
use super::event::Event;
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use prism_core::{NbError, Result};
use std::ops::Range;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Outcome of a device command; the message becomes the sticky error.
pub type CommandResult = std::result::Result<(), String>;

type Command = Box<dyn FnOnce() -> CommandResult + Send + 'static>;

enum Message {
    Run { label: String, op: Command },
    Record { event: Event, target: u64 },
    Wait { event: Event, target: u64 },
    Barrier(Sender<()>),
}

#[derive(Debug, Clone)]
struct StickyError {
    operation: String,
    message: String,
}

#[derive(Debug, Default)]
struct StreamShared {
    pending: AtomicUsize,
    error: Mutex<Option<StickyError>>,
}

/// In-order device command queue.
pub struct Stream {
    name: Arc<str>,
    sender: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn spawn(name: &str) -> Result<Self> {
        let (sender, receiver) = unbounded::<Message>();
        let shared = Arc::new(StreamShared::default());
        let name: Arc<str> = Arc::from(name);

        let worker_shared = Arc::clone(&shared);
        let worker_name = Arc::clone(&name);
        let worker = std::thread::Builder::new()
            .name(format!("prism-nb-{}", name))
            .spawn(move || {
                for message in receiver {
                    match message {
                        Message::Run { label, op } => {
                            let failed = worker_shared.error.lock().is_some();
                            if !failed {
                                let outcome = catch_unwind(AssertUnwindSafe(op))
                                    .unwrap_or_else(|_| Err("command panicked".to_string()));
                                if let Err(message) = outcome {
                                    log::error!(
                                        "{} stream: '{}' failed: {}",
                                        worker_name,
                                        label,
                                        message
                                    );
                                    *worker_shared.error.lock() = Some(StickyError {
                                        operation: label,
                                        message,
                                    });
                                }
                            }
                        }
                        Message::Record { event, target } => event.complete(target),
                        Message::Wait { event, target } => {
                            if worker_shared.error.lock().is_none() {
                                event.wait_for(target);
                            }
                        }
                        Message::Barrier(ack) => {
                            let _ = ack.send(());
                        }
                    }
                    worker_shared.pending.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .map_err(|e| NbError::device(name.to_string(), "spawn stream", e.to_string()))?;

        Ok(Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
            shared,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, message: Message) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| NbError::device(self.name.to_string(), "issue", "stream closed"))?;
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        sender.send(message).map_err(|_| {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            NbError::device(self.name.to_string(), "issue", "stream worker exited")
        })
    }

    /// Enqueue an arbitrary device command (kernel launch, host callback).
    pub fn enqueue<F>(&self, label: impl Into<String>, op: F) -> Result<()>
    where
        F: FnOnce() -> CommandResult + Send + 'static,
    {
        self.check_error()?;
        self.send(Message::Run {
            label: label.into(),
            op: Box::new(op),
        })
    }

    /// Asynchronous host-to-device copy of `src` into `dst[offset..]`.
    ///
    /// The source is owned by the command, so the caller may reuse its
    /// staging memory immediately.
    pub fn copy_to_device<T: DeviceRepr>(
        &self,
        dst: &DeviceBuffer<T>,
        offset: usize,
        src: Vec<T>,
    ) -> Result<()> {
        let end = offset + src.len();
        if end > dst.len() {
            return Err(NbError::device(
                self.name.to_string(),
                format!("H2D {}", dst.label()),
                format!("range {}..{} exceeds buffer length {}", offset, end, dst.len()),
            ));
        }
        let handle = dst.handle();
        self.enqueue(format!("H2D {}", dst.label()), move || {
            let mut data = handle.write();
            let slot = data
                .get_mut(offset..end)
                .ok_or_else(|| format!("range {}..{} outside allocation", offset, end))?;
            slot.copy_from_slice(&src);
            Ok(())
        })
    }

    /// Asynchronous fill of `dst[range]` with `value`.
    pub fn fill<T: DeviceRepr>(
        &self,
        dst: &DeviceBuffer<T>,
        range: Range<usize>,
        value: T,
    ) -> Result<()> {
        let handle = dst.handle();
        self.enqueue(format!("memset {}", dst.label()), move || {
            let mut data = handle.write();
            let slot = data
                .get_mut(range.clone())
                .ok_or_else(|| format!("range {:?} outside allocation", range))?;
            slot.fill(value);
            Ok(())
        })
    }

    /// Asynchronous device-to-host copy of `src[range]` into `dst[dst_offset..]`.
    pub fn copy_to_host<T: DeviceRepr>(
        &self,
        src: &DeviceBuffer<T>,
        range: Range<usize>,
        dst: &HostBuffer<T>,
        dst_offset: usize,
    ) -> Result<()> {
        if range.end > src.len() {
            return Err(NbError::device(
                self.name.to_string(),
                format!("D2H {}", src.label()),
                format!("range {:?} exceeds buffer length {}", range, src.len()),
            ));
        }
        let handle = src.handle();
        let host = dst.shared();
        self.enqueue(format!("D2H {}", src.label()), move || {
            let data = handle.read();
            let from = data
                .get(range.clone())
                .ok_or_else(|| format!("range {:?} outside allocation", range))?;
            let mut host = host.lock();
            let to = host
                .get_mut(dst_offset..dst_offset + from.len())
                .ok_or_else(|| "host buffer too small".to_string())?;
            to.copy_from_slice(from);
            Ok(())
        })
    }

    /// Record `event` at the current tail of this stream.
    pub fn record_event(&self, event: &Event) -> Result<()> {
        let target = event.issue();
        self.send(Message::Record {
            event: event.clone(),
            target,
        })
    }

    /// Make later work on this stream wait for the last record of `event`.
    pub fn wait_event(&self, event: &Event) -> Result<()> {
        let target = event.current_target();
        self.send(Message::Wait {
            event: event.clone(),
            target,
        })
    }

    /// Block the host until all issued work has retired, then report any
    /// sticky error.
    pub fn synchronize(&self) -> Result<()> {
        let (ack, done) = crossbeam_channel::bounded(1);
        self.send(Message::Barrier(ack))?;
        done.recv().map_err(|_| {
            NbError::device(self.name.to_string(), "synchronize", "stream worker exited")
        })?;
        self.check_error()
    }

    /// True when no issued work is outstanding.
    pub fn query(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire) == 0
    }

    /// Report the sticky error, if any.
    pub fn check_error(&self) -> Result<()> {
        match self.shared.error.lock().as_ref() {
            Some(err) => Err(NbError::device(
                self.name.to_string(),
                err.operation.clone(),
                err.message.clone(),
            )),
            None => Ok(()),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("{} stream worker panicked during shutdown", self.name);
            }
        }
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("pending", &self.shared.pending.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DeviceMemoryBudget, MemoryLedger};

    fn ledger() -> Arc<MemoryLedger> {
        Arc::new(MemoryLedger::new(DeviceMemoryBudget::from_bytes(1 << 20)))
    }

    #[test]
    fn test_copy_round_trip_in_order() {
        let ledger = ledger();
        let stream = Stream::spawn("test").unwrap();
        let mut buf: DeviceBuffer<f32> = DeviceBuffer::with_capacity(&ledger, "x", 4).unwrap();
        buf.reserve(4).unwrap();

        let host = HostBuffer::new(4);
        stream.fill(&buf, 0..4, 7.0).unwrap();
        stream.copy_to_device(&buf, 1, vec![1.0, 2.0]).unwrap();
        stream.copy_to_host(&buf, 0..4, &host, 0).unwrap();
        stream.synchronize().unwrap();

        assert_eq!(host.to_vec(), vec![7.0, 1.0, 2.0, 7.0]);
        assert!(stream.query());
    }

    #[test]
    fn test_out_of_range_copy_rejected_at_issue() {
        let ledger = ledger();
        let stream = Stream::spawn("test").unwrap();
        let mut buf: DeviceBuffer<u32> = DeviceBuffer::unallocated(&ledger, "types");
        buf.reserve(2).unwrap();
        let err = stream.copy_to_device(&buf, 1, vec![1, 2]).unwrap_err();
        assert!(matches!(err, NbError::DeviceOperation { .. }));
    }

    #[test]
    fn test_sticky_error_skips_later_work() {
        let stream = Stream::spawn("local").unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        stream.enqueue("kernel", || Err("illegal address".into())).unwrap();
        let counter = Arc::clone(&ran);
        let _ = stream.enqueue("after", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = stream.synchronize().unwrap_err();
        assert!(err.to_string().contains("illegal address"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(stream.enqueue("again", || Ok(())).is_err());
    }

    #[test]
    fn test_cross_stream_event_ordering() {
        let producer = Stream::spawn("non-local").unwrap();
        let consumer = Stream::spawn("local").unwrap();
        let done = Event::new("nonlocal_done");
        let gate = Event::new("gate");
        let log = Arc::new(Mutex::new(Vec::new()));

        // Hold the producer until the consumer's wait is already queued.
        let gate_target = gate.issue();
        let g = gate.clone();
        producer
            .enqueue("hold", move || {
                g.wait_for(gate_target);
                Ok(())
            })
            .unwrap();
        let l = Arc::clone(&log);
        producer
            .enqueue("produce", move || {
                l.lock().push("produce");
                Ok(())
            })
            .unwrap();
        producer.record_event(&done).unwrap();

        consumer.wait_event(&done).unwrap();
        let l = Arc::clone(&log);
        consumer
            .enqueue("consume", move || {
                l.lock().push("consume");
                Ok(())
            })
            .unwrap();

        gate.complete(gate_target);
        consumer.synchronize().unwrap();
        producer.synchronize().unwrap();
        assert_eq!(*log.lock(), vec!["produce", "consume"]);
    }

    #[test]
    fn test_failed_stream_still_retires_events() {
        let failing = Stream::spawn("non-local").unwrap();
        let waiting = Stream::spawn("local").unwrap();
        let done = Event::new("nonlocal_done");

        failing.enqueue("kernel", || Err("launch failure".into())).unwrap();
        failing.record_event(&done).unwrap();
        waiting.wait_event(&done).unwrap();

        waiting.synchronize().unwrap();
        assert!(failing.synchronize().is_err());
    }
}
