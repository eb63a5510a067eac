//! Epoch publication.
//!
//! One immutable `(backend set, lookup table)` snapshot is shared by every
//! worker and replaced atomically on membership change. Workers load the
//! current epoch once per packet (an acquire load through `ArcSwap`), so a
//! publish never exposes a partially built table, and the old epoch stays
//! alive until the last reader drops its guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{debug, info};

use crate::backend::BackendSet;
use crate::error::BuildError;
use crate::table::{LookupTable, LookupTableBuilder, TableConfig};

/// An immutable routing snapshot: the backend set and the lookup table
/// built from it, tagged with a monotonically increasing sequence number.
#[derive(Debug)]
pub struct RouterEpoch {
    seq: u64,
    backends: BackendSet,
    table: LookupTable,
    hash_seed: u64,
}

impl RouterEpoch {
    #[inline]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[inline]
    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    #[inline]
    pub fn table(&self) -> &LookupTable {
        &self.table
    }

    /// Seed for the per-packet fingerprint, fixed at builder construction.
    #[inline]
    pub fn hash_seed(&self) -> u64 {
        self.hash_seed
    }
}

/// Control-plane handle owning the current epoch and the worker registry.
///
/// The data plane only ever reads through [`RouterControl::load`];
/// [`RouterControl::install`] is the single writer and is expected to be
/// called from one control-plane task at a time.
#[derive(Debug)]
pub struct RouterControl {
    builder: LookupTableBuilder,
    epoch: ArcSwap<RouterEpoch>,
    workers: Mutex<Vec<Weak<AtomicU64>>>,
}

impl RouterControl {
    /// Builds the initial table and publishes epoch 1.
    pub fn new(backends: BackendSet, config: TableConfig) -> Result<Self, BuildError> {
        let builder = LookupTableBuilder::new(config)?;
        let table = builder.build(&backends)?;
        let hash_seed = config.hash_seed;

        info!(
            backends = backends.len(),
            table_size = table.len(),
            "built initial lookup table"
        );

        Ok(Self {
            builder,
            epoch: ArcSwap::from_pointee(RouterEpoch {
                seq: 1,
                backends,
                table,
                hash_seed,
            }),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// The current epoch. The guard pins the snapshot for as long as it is
    /// held; per-packet callers should drop it before the next load.
    #[inline]
    pub fn load(&self) -> arc_swap::Guard<Arc<RouterEpoch>> {
        self.epoch.load()
    }

    /// Builds a table for `backends` and publishes it as the next epoch.
    ///
    /// Returns once every live worker has dispatched (or explicitly polled)
    /// against the new epoch, so the caller knows no packet is being steered
    /// by the previous backend set when this returns. On error nothing is
    /// published and the previous epoch remains in force.
    pub fn install(&self, backends: BackendSet) -> Result<(), BuildError> {
        let table = self.builder.build(&backends)?;
        let seq = self.epoch.load().seq + 1;
        let n = backends.len();

        self.epoch.store(Arc::new(RouterEpoch {
            seq,
            backends,
            table,
            hash_seed: self.builder.config().hash_seed,
        }));
        debug!(seq, backends = n, "published new epoch, draining workers");

        self.wait_for_ack(seq);
        info!(seq, backends = n, "installed new lookup table");
        Ok(())
    }

    /// Registers a worker and returns its acknowledgement cell. The worker
    /// stores the epoch sequence it last observed; dropping the cell (when
    /// the worker's dispatcher is dropped) deregisters it.
    pub(crate) fn register_worker(&self) -> Arc<AtomicU64> {
        let acked = Arc::new(AtomicU64::new(0));
        self.workers
            .lock()
            .expect("worker registry poisoned")
            .push(Arc::downgrade(&acked));
        acked
    }

    fn wait_for_ack(&self, seq: u64) {
        loop {
            let mut workers = self.workers.lock().expect("worker registry poisoned");
            workers.retain(|w| w.strong_count() > 0);
            let drained = workers.iter().all(|w| match w.upgrade() {
                Some(acked) => acked.load(Ordering::Acquire) >= seq,
                None => true,
            });
            drop(workers);

            if drained {
                return;
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn backends(n: usize) -> BackendSet {
        BackendSet::from_iter((0..n).map(|i| Ipv4Addr::new(10, 1, 0, i as u8 + 1)))
    }

    #[test]
    fn initial_epoch_is_one() {
        let control = RouterControl::new(backends(3), TableConfig::default()).unwrap();
        let epoch = control.load();
        assert_eq!(epoch.seq(), 1);
        assert_eq!(epoch.backends().len(), 3);
        assert_eq!(epoch.table().len(), 65537);
    }

    #[test]
    fn failed_install_keeps_previous_epoch() {
        let control = RouterControl::new(backends(3), TableConfig::default()).unwrap();

        let err = control.install(BackendSet::from_iter([])).unwrap_err();
        assert_eq!(err, BuildError::EmptyBackendSet);

        let epoch = control.load();
        assert_eq!(epoch.seq(), 1);
        assert_eq!(epoch.backends().len(), 3);
    }

    #[test]
    fn install_without_workers_returns_immediately() {
        let control = RouterControl::new(backends(3), TableConfig::default()).unwrap();
        control.install(backends(4)).unwrap();
        assert_eq!(control.load().seq(), 2);
    }

    #[test]
    fn install_waits_for_worker_ack() {
        let control = Arc::new(RouterControl::new(backends(3), TableConfig::default()).unwrap());
        let acked = control.register_worker();

        let installer = {
            let control = Arc::clone(&control);
            std::thread::spawn(move || control.install(backends(4)))
        };

        // Ack loop standing in for a polling worker.
        while !installer.is_finished() {
            acked.store(control.load().seq(), Ordering::Release);
            std::thread::yield_now();
        }
        installer.join().unwrap().unwrap();
        assert_eq!(control.load().seq(), 2);
    }

    #[test]
    fn dead_workers_do_not_block_install() {
        let control = RouterControl::new(backends(3), TableConfig::default()).unwrap();
        let acked = control.register_worker();
        drop(acked);

        control.install(backends(2)).unwrap();
        assert_eq!(control.load().seq(), 2);
    }
}
