//! Plan checkpoints: scan bounds, split keys, and topological cancellation
//!
//! A [`PlanCheckpoint`] owns one execution attempt of a plan tree: the
//! operator tasks, the per-scan key bounds restricting what each scan may
//! produce, the split keys deposited during cancellation, and the shared
//! document-finished lock through which operators coordinate rate.
//!
//! # How stop-and-checkpoint works
//!
//! Scans are assigned ids by `add_scan()` in a consistent order across
//! re-executions of the same plan, so a scan's bounds survive from one
//! checkpoint to the next. Operator tasks are registered with
//! `add_operation()` in topological order (producers before consumers),
//! which is the natural order of `Plan::execute` recursion.
//!
//! `stop()` signals each operator's stop token and awaits the task, in
//! registration order. When `stop_and_checkpoint()` has set the
//! bounds-wanted flag, each cancelled operator deposits, for every document
//! it has received but not yet emitted, the document's scan key as the
//! split key of its scan — walking its pending documents in reverse output
//! order so the earliest ends up winning within the operator. Because
//! consumers are cancelled after their producers, the final split key for a
//! scan is written by the last operator in the topology that still held one
//! of its documents: greater than every scan key emitted from the plan,
//! and at most the next key the scan could produce. A scan that ran to
//! completion deposits nothing and its split key keeps the sentinel `0xff`,
//! so the successor checkpoint's bounds `[split, end)` are empty.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::document::DocRef;
use crate::error::QueryError;
use crate::knobs::Knobs;
use crate::stream::{FlowControlLock, StreamSender};

/// Sentinel split key: greater than every valid scan key
const SPLIT_SENTINEL: u8 = 0xff;

/// Create a linked stop handle/token pair for one operator task
pub fn stop_pair() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopToken { rx })
}

/// Cancellation trigger held by the checkpoint for a registered operator
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    fn signal(&self) {
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal observed by an operator task
///
/// Every operator races this token against its other awaitables; a dropped
/// handle counts as cancellation so abandoned checkpoints wind down their
/// tasks.
#[derive(Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    /// Resolves once the operator has been asked to stop
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Race a future against a stop token; `None` means the operator was
/// cancelled before the future resolved
pub async fn or_stop<F: Future>(stop: &StopToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop.cancelled() => None,
        v = fut => Some(v),
    }
}

struct ScanState {
    begin: Vec<u8>,
    end: Vec<u8>,
    split: Vec<u8>,
}

impl Default for ScanState {
    fn default() -> Self {
        ScanState {
            begin: Vec::new(),
            end: vec![SPLIT_SENTINEL],
            split: vec![SPLIT_SENTINEL],
        }
    }
}

#[derive(Clone, Copy)]
struct IntCell {
    initial: i64,
    current: i64,
}

#[derive(Default)]
struct ScanTable {
    scans: Vec<ScanState>,
    added: usize,
}

#[derive(Default)]
struct IntCells {
    cells: Vec<IntCell>,
    added: usize,
}

struct Operation {
    stop: StopHandle,
    handle: JoinHandle<()>,
    output: StreamSender<DocRef>,
}

/// Owner of one execution attempt: scan bounds, int state, operator tasks
pub struct PlanCheckpoint {
    scans: Mutex<ScanTable>,
    int_cells: Arc<Mutex<IntCells>>,
    ops: Mutex<Vec<Operation>>,
    bounds_wanted: AtomicBool,
    doc_lock: Arc<FlowControlLock>,
}

impl PlanCheckpoint {
    /// A fresh checkpoint with default knobs
    pub fn new() -> Arc<Self> {
        Self::with_permits(Knobs::default().flow_control_lock_permits)
    }

    /// A fresh checkpoint whose document-finished lock has `permits` credits
    pub fn with_permits(permits: usize) -> Arc<Self> {
        Arc::new(PlanCheckpoint {
            scans: Mutex::new(ScanTable::default()),
            int_cells: Arc::new(Mutex::new(IntCells::default())),
            ops: Mutex::new(Vec::new()),
            bounds_wanted: AtomicBool::new(false),
            doc_lock: Arc::new(FlowControlLock::new(permits)),
        })
    }

    /// Allocate the next scan id. Called from `Plan::execute` in a
    /// deterministic order so ids are stable across re-executions.
    pub fn add_scan(&self) -> usize {
        let mut table = self.scans.lock();
        let id = table.added;
        table.added += 1;
        if id >= table.scans.len() {
            table.scans.push(ScanState::default());
        }
        id
    }

    /// The `[begin, end)` key range this scan must restrict itself to
    pub fn bounds(&self, scan_id: usize) -> (Vec<u8>, Vec<u8>) {
        let table = self.scans.lock();
        match table.scans.get(scan_id) {
            Some(scan) => (scan.begin.clone(), scan.end.clone()),
            None => (Vec::new(), vec![SPLIT_SENTINEL]),
        }
    }

    /// Deposit a split key for `scan_id` during cancellation
    pub fn set_split_bound(&self, scan_id: usize, key: Vec<u8>) {
        let mut table = self.scans.lock();
        debug_assert!(scan_id < table.scans.len());
        if let Some(scan) = table.scans.get_mut(scan_id) {
            scan.split = key;
        }
    }

    /// Whether cancelled operators should deposit split keys
    pub fn split_bound_wanted(&self) -> bool {
        self.bounds_wanted.load(Ordering::Acquire)
    }

    /// The split key currently recorded for `scan_id`
    pub fn split_bound(&self, scan_id: usize) -> Vec<u8> {
        let table = self.scans.lock();
        match table.scans.get(scan_id) {
            Some(scan) => scan.split.clone(),
            None => vec![SPLIT_SENTINEL],
        }
    }

    /// Register an operator task. Must be called in topological order:
    /// input producers before their consumers.
    pub fn add_operation(
        &self,
        stop: StopHandle,
        handle: JoinHandle<()>,
        output: StreamSender<DocRef>,
    ) {
        self.ops.lock().push(Operation { stop, handle, output });
    }

    /// Allocate the next int-state cell, or re-attach to it on
    /// re-execution. Cells keep their value across `stop_and_checkpoint`
    /// and reset to their round-start value when the same checkpoint is
    /// re-executed after a plain `stop()`.
    pub fn int_state(&self, default: i64) -> IntState {
        let mut cells = self.int_cells.lock();
        let index = cells.added;
        cells.added += 1;
        if index == cells.cells.len() {
            cells.cells.push(IntCell {
                initial: default,
                current: default,
            });
        } else {
            let cell = &mut cells.cells[index];
            cell.current = cell.initial;
        }
        IntState {
            cells: self.int_cells.clone(),
            index,
        }
    }

    /// The credit lock gating document emission at the root
    pub fn document_finished_lock(&self) -> &Arc<FlowControlLock> {
        &self.doc_lock
    }

    /// Cancel all operator tasks in registration order, then report
    /// `operation_cancelled` on the terminal output stream.
    ///
    /// Operator tasks registered on this checkpoint must not call this (a
    /// wrapper operator stopping its *inner* checkpoint is fine); each task
    /// is awaited after its stop token fires, which serializes split-key
    /// deposits in topological order.
    pub async fn stop(&self) {
        let ops: Vec<Operation> = {
            let mut guard = self.ops.lock();
            let ops = std::mem::take(&mut *guard);
            drop(guard);
            self.scans.lock().added = 0;
            self.int_cells.lock().added = 0;
            ops
        };
        let last_output = ops.last().map(|op| op.output.clone());
        for op in ops {
            op.stop.signal();
            if let Err(e) = op.handle.await {
                if e.is_panic() {
                    tracing::warn!(error = %e, "plan operator panicked during stop");
                }
            }
        }
        if let Some(output) = last_output {
            output.send_error(QueryError::OperationCancelled);
        }
    }

    /// Stop this execution attempt and derive the checkpoint that resumes
    /// it: each scan's new bounds are `[split, end)` and every int-state
    /// cell's default becomes its current value.
    ///
    /// Callers must not hold any of this checkpoint's operator tasks on
    /// their own call path.
    pub async fn stop_and_checkpoint(&self) -> Arc<PlanCheckpoint> {
        self.bounds_wanted.store(true, Ordering::Release);
        self.stop().await;
        self.bounds_wanted.store(false, Ordering::Release);

        let next = PlanCheckpoint::with_permits(self.doc_lock.permits());
        {
            let table = self.scans.lock();
            let mut next_table = next.scans.lock();
            for scan in &table.scans {
                next_table.scans.push(ScanState {
                    begin: scan.split.clone(),
                    end: scan.end.clone(),
                    split: vec![SPLIT_SENTINEL],
                });
            }
        }
        {
            let cells = self.int_cells.lock();
            let mut next_cells = next.int_cells.lock();
            for cell in &cells.cells {
                next_cells.cells.push(IntCell {
                    initial: cell.current,
                    current: cell.current,
                });
            }
        }
        next
    }

    /// Debugging aid: clamp each scan's end to its recorded split key
    pub fn bound_to_stop_point(&self) {
        let mut table = self.scans.lock();
        for scan in &mut table.scans {
            scan.end = scan.split.clone();
        }
    }
}

impl std::fmt::Debug for PlanCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.scans.lock();
        writeln!(f, "scans: {}", table.scans.len())?;
        for (i, scan) in table.scans.iter().enumerate() {
            writeln!(
                f,
                "\tscan {i} begin: {:02x?} split: {:02x?} end: {:02x?}",
                scan.begin, scan.split, scan.end
            )?;
        }
        Ok(())
    }
}

/// Handle to one of a checkpoint's int-state cells
pub struct IntState {
    cells: Arc<Mutex<IntCells>>,
    index: usize,
}

impl IntState {
    pub fn get(&self) -> i64 {
        self.cells.lock().cells[self.index].current
    }

    pub fn set(&self, value: i64) {
        self.cells.lock().cells[self.index].current = value;
    }

    /// Add `delta` and return the new value
    pub fn add(&self, delta: i64) -> i64 {
        let mut cells = self.cells.lock();
        let cell = &mut cells.cells[self.index];
        cell.current += delta;
        cell.current
    }
}

/// Deposit split keys for every scan-originated document in `docs`,
/// which must be supplied in reverse output order
pub(crate) fn deposit_split_bounds<'a>(
    checkpoint: &PlanCheckpoint,
    docs: impl IntoIterator<Item = &'a DocRef>,
) {
    if !checkpoint.split_bound_wanted() {
        return;
    }
    for doc in docs {
        if let Some(scan_id) = doc.scan_id() {
            checkpoint.set_split_bound(scan_id, doc.scan_key().to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::stream_channel;
    use serde_json::json;

    #[test]
    fn test_scan_allocation_and_default_bounds() {
        let cp = PlanCheckpoint::new();
        assert_eq!(cp.add_scan(), 0);
        assert_eq!(cp.add_scan(), 1);
        let (begin, end) = cp.bounds(0);
        assert!(begin.is_empty());
        assert_eq!(end, vec![0xff]);
        assert_eq!(cp.split_bound(1), vec![0xff]);
    }

    #[test]
    fn test_int_state_reattaches_on_reexecution() {
        let cp = PlanCheckpoint::new();
        let state = cp.int_state(10);
        state.add(-3);
        assert_eq!(state.get(), 7);
        // A plain stop resets allocation; re-registering yields the
        // round-start value again.
        cp.scans.lock().added = 0;
        cp.int_cells.lock().added = 0;
        let state = cp.int_state(10);
        assert_eq!(state.get(), 10);
    }

    #[tokio::test]
    async fn test_stop_and_checkpoint_carries_bounds_and_state() {
        let cp = PlanCheckpoint::new();
        let scan = cp.add_scan();
        let count = cp.int_state(5);
        count.set(2);
        cp.set_split_bound(scan, b"k".to_vec());

        let next = cp.stop_and_checkpoint().await;
        let (begin, end) = next.bounds(0);
        assert_eq!(begin, b"k".to_vec());
        assert_eq!(end, vec![0xff]);
        assert_eq!(next.split_bound(0), vec![0xff]);
        assert_eq!(next.int_state(5).get(), 2);
    }

    #[test]
    fn test_bound_to_stop_point_clamps_end() {
        let cp = PlanCheckpoint::new();
        let scan = cp.add_scan();
        cp.set_split_bound(scan, b"mid".to_vec());
        cp.bound_to_stop_point();
        let (_, end) = cp.bounds(scan);
        assert_eq!(end, b"mid".to_vec());
    }

    #[tokio::test]
    async fn test_stop_cancels_operators_in_order_and_reports() {
        let cp = PlanCheckpoint::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut last_rx = None;
        for i in 0..3 {
            let (tx, rx) = stream_channel::<DocRef>();
            let (stop_handle, stop) = stop_pair();
            let order = order.clone();
            let handle = tokio::spawn(async move {
                stop.cancelled().await;
                order.lock().push(i);
            });
            cp.add_operation(stop_handle, handle, tx);
            last_rx = Some(rx);
        }

        cp.stop().await;
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        let err = last_rx.unwrap().next().await.unwrap_err();
        assert_eq!(err, QueryError::OperationCancelled);
    }

    #[tokio::test]
    async fn test_deposit_only_when_wanted() {
        let cp = PlanCheckpoint::new();
        let scan = cp.add_scan();
        let doc = DocRef::synthetic(json!({}), Some(scan), b"pos".to_vec());
        deposit_split_bounds(&cp, [&doc]);
        assert_eq!(cp.split_bound(scan), vec![0xff]);

        cp.bounds_wanted.store(true, Ordering::Release);
        deposit_split_bounds(&cp, [&doc]);
        assert_eq!(cp.split_bound(scan), b"pos".to_vec());
    }
}
