//! IRQ demultiplexing and worker scheduling.
//!
//! Grounded on `mhi_irq_handler`/`mhi_intvec_threaded_handler`/
//! `mhi_ev_task`/`mhi_ctrl_ev_task`/`mhi_process_ev_work` in the reference
//! driver. A real MSI arrives on whatever thread the interrupt controller
//! delivers it on; this crate never assumes that thread is safe to block
//! or to do expensive work on, so the top half only ever identifies which
//! ring fired and either processes it immediately (for latency-sensitive,
//! non-sleeping rings) or hands it to a background worker thread.
//!
//! Client-managed event rings (a client that wants to drain its own event
//! ring on its own schedule) are not drained here at all; they only get
//! their `pending` flag set, and the client calls [`Dispatcher::poll`]
//! itself, NAPI-style.

use std::collections::HashSet;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, warn};

use crate::controller::Controller;
use crate::register::RegisterIo;

/// Which MSI vector fired, translated from the raw interrupt number by
/// whatever platform glue owns the PCIe interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsiVector {
    /// The control event ring (command completions, state changes,
    /// execution-environment changes, bandwidth requests).
    Control,
    /// A data event ring, identified by index for installations with more
    /// than one.
    Data(u32),
}

/// How a data event ring's interrupt is serviced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityClass {
    /// Process inline, on whatever thread delivered the interrupt. Reserved
    /// for rings whose processing is guaranteed not to sleep or take long.
    HiNoSleep,
    /// Hand off to the background worker thread, processed before any
    /// `HiSleep` work queued after it.
    DefaultNoSleep,
    /// Hand off to the background worker thread; may block (e.g. briefly
    /// on the PM lock).
    HiSleep,
    /// The client drains this ring itself via [`Dispatcher::poll`]; the top
    /// half only records that data is pending.
    ClientManaged,
}

enum WorkItem {
    Control,
    Data(u32),
}

/// Demultiplexes MSI vectors into inline processing, background-thread
/// work, or a pending-data flag for client-managed rings.
pub struct Dispatcher {
    controller: Arc<Mutex<Controller>>,
    io: Arc<dyn RegisterIo>,
    data_priority: Mutex<std::collections::HashMap<u32, PriorityClass>>,
    pending: Mutex<HashSet<u32>>,
    worker_tx: Sender<WorkItem>,
    quota: usize,
}

impl Dispatcher {
    /// Spawns the background worker thread and returns a dispatcher driving
    /// `controller` through `io`. `quota` bounds how many events a single
    /// processing pass drains from one ring.
    pub fn new(controller: Arc<Mutex<Controller>>, io: Arc<dyn RegisterIo>, quota: usize) -> Self {
        let (worker_tx, worker_rx) = channel::<WorkItem>();
        let worker_controller = controller.clone();
        let worker_io = io.clone();
        thread::spawn(move || {
            for item in worker_rx {
                let mut controller = worker_controller.lock().unwrap();
                let result = match item {
                    WorkItem::Control => controller.poll_control_events(&*worker_io, quota),
                    WorkItem::Data(_id) => controller.poll_data_events(&*worker_io, quota),
                };
                if let Err(err) = result {
                    warn!(%err, "event-ring worker pass failed");
                }
            }
        });

        Dispatcher {
            controller,
            io,
            data_priority: Mutex::new(std::collections::HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            worker_tx,
            quota,
        }
    }

    /// Registers the priority class for a data event ring.
    pub fn set_data_priority(&self, ring_id: u32, priority: PriorityClass) {
        self.data_priority.lock().unwrap().insert(ring_id, priority);
    }

    /// Top-half entry point: called from interrupt context with the vector
    /// that fired.
    pub fn on_msi(&self, vector: MsiVector) {
        match vector {
            MsiVector::Control => {
                debug!("control MSI fired, scheduling worker");
                let _ = self.worker_tx.send(WorkItem::Control);
            }
            MsiVector::Data(id) => {
                let priority = self
                    .data_priority
                    .lock()
                    .unwrap()
                    .get(&id)
                    .copied()
                    .unwrap_or(PriorityClass::DefaultNoSleep);
                match priority {
                    PriorityClass::HiNoSleep => {
                        let mut controller = self.controller.lock().unwrap();
                        if let Err(err) = controller.poll_data_events(&*self.io, self.quota) {
                            warn!(%err, "inline data-ring processing failed");
                        }
                    }
                    PriorityClass::DefaultNoSleep | PriorityClass::HiSleep => {
                        let _ = self.worker_tx.send(WorkItem::Data(id));
                    }
                    PriorityClass::ClientManaged => {
                        self.pending.lock().unwrap().insert(id);
                    }
                }
            }
        }
    }

    /// Whether a client-managed data ring has pending work since it was
    /// last polled.
    pub fn has_pending(&self, ring_id: u32) -> bool {
        self.pending.lock().unwrap().contains(&ring_id)
    }

    /// NAPI-style drain for a client-managed ring: processes up to `budget`
    /// events and clears the pending flag if the ring ran dry.
    pub fn poll(&self, budget: usize) -> crate::error::MhiResult<usize> {
        let mut controller = self.controller.lock().unwrap();
        let processed = controller.poll_data_events(&*self.io, budget)?;
        if processed < budget {
            self.pending.lock().unwrap().clear();
        }
        Ok(processed)
    }
}
