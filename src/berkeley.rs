//! Berkeley synchronizer (C7): coordinator-driven clock averaging.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::codec::wall_time;
use crate::model::SyncHistoryEntry;
use crate::replication::{PeerAddr, ReplicationManager};
use crate::store::DataStore;
use crate::{pf_info, pf_warn};

const BERKELEY_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Coordinator-driven clock averaging. Only the current coordinator runs
/// rounds; every server (coordinator included) can receive and apply an
/// offset. The accumulated offset is informational -- per spec S9, it
/// feeds `local_time()` but not message `timestamp` fields.
pub struct BerkeleySynchronizer {
    my_name: String,
    store: DataStore,
    time_offset_bits: AtomicU64,
    history: Mutex<Vec<SyncHistoryEntry>>,
}

const HISTORY_DOC_PREFIX: &str = "berkeley_sync_";

impl BerkeleySynchronizer {
    pub fn new(my_name: String, store: DataStore) -> Self {
        BerkeleySynchronizer {
            my_name,
            store,
            time_offset_bits: AtomicU64::new(0.0f64.to_bits()),
            history: Mutex::new(Vec::new()),
        }
    }

    fn history_doc(&self) -> String {
        format!("{HISTORY_DOC_PREFIX}{}", self.my_name)
    }

    /// The accumulated offset applied so far.
    pub fn time_offset(&self) -> f64 {
        f64::from_bits(self.time_offset_bits.load(Ordering::SeqCst))
    }

    /// `wall_time() + accumulated_offset`. Only reads the adjusted clock
    /// for logging/diagnostics -- message timestamps intentionally keep
    /// using raw wall time (spec S9).
    pub fn local_time(&self) -> f64 {
        wall_time() + self.time_offset()
    }

    /// Applies `offset`, accumulating into `time_offset` and appending a
    /// history entry, matching `berkeley_sync.py::apply_offset`.
    pub async fn apply_offset(&self, offset: f64) {
        let mut cur = self.time_offset_bits.load(Ordering::SeqCst);
        let new_total = loop {
            let cur_val = f64::from_bits(cur);
            let new_total = cur_val + offset;
            match self.time_offset_bits.compare_exchange_weak(
                cur,
                new_total.to_bits(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break new_total,
                Err(observed) => cur = observed,
            }
        };
        let entry = SyncHistoryEntry {
            timestamp: wall_time(),
            offset_applied: offset,
            total_offset: new_total,
        };
        let mut history = self.history.lock().await;
        history.push(entry);
        if let Err(e) = self.store.replication_save(&self.history_doc(), &*history) {
            pf_warn!("failed to persist Berkeley sync history: {}", e);
        }
    }

    /// Step 1: collect a wall-clock sample from every known peer plus
    /// self. Unreachable peers are simply omitted. Each sample is tagged
    /// with the peer it came from (`None` for self) so a later step can
    /// distribute offsets back to the right origin even when some peers
    /// were skipped.
    pub async fn collect_timestamps(
        &self,
        ctx: &rzmq::Context,
        replication: &ReplicationManager,
        peers: &[PeerAddr],
    ) -> Vec<(Option<PeerAddr>, f64)> {
        let mut samples = vec![(None, self.local_time())];
        for addr in peers {
            match tokio::time::timeout(
                BERKELEY_RPC_TIMEOUT,
                replication.get_time(ctx, addr),
            )
            .await
            {
                Ok(Ok(t)) => samples.push((Some(addr.clone()), t)),
                Ok(Err(e)) => pf_warn!("get_time from {} failed: {}", addr, e),
                Err(_) => pf_warn!("get_time from {} timed out", addr),
            }
        }
        samples
    }

    /// Step 2/3: requires at least 2 samples; computes the mean and
    /// per-sample offsets (`offset_i = mean - t_i`). Returns `None` if
    /// fewer than 2 samples were collected (round aborted).
    pub fn calculate_offsets(samples: &[f64]) -> Option<Vec<f64>> {
        if samples.len() < 2 {
            return None;
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        Some(samples.iter().map(|t| mean - t).collect())
    }

    /// Step 4: unicasts `apply_offset` to every peer (including applying
    /// locally for self), ignoring individual failures. `samples` and
    /// `offsets` must be the same length and index-aligned (as produced by
    /// `collect_timestamps` and `calculate_offsets` respectively), so each
    /// peer receives the offset computed from its own sample rather than a
    /// positional neighbor's.
    pub async fn distribute_offsets(
        &self,
        ctx: &rzmq::Context,
        replication: &ReplicationManager,
        samples: &[(Option<PeerAddr>, f64)],
        offsets: &[f64],
    ) {
        for ((origin, _), offset) in samples.iter().zip(offsets.iter()) {
            match origin {
                None => self.apply_offset(*offset).await,
                Some(addr) => {
                    if let Err(e) = replication
                        .send_apply_offset(ctx, addr, *offset, &self.my_name)
                        .await
                    {
                        pf_warn!("apply_offset to {} failed: {}", addr, e);
                    }
                }
            }
        }
    }

    /// Runs one full Berkeley round as coordinator. No-op (returns false)
    /// if fewer than 2 samples are available.
    pub async fn run_round(
        &self,
        ctx: &rzmq::Context,
        replication: &ReplicationManager,
        peers: &[PeerAddr],
    ) -> bool {
        let samples = self.collect_timestamps(ctx, replication, peers).await;
        let values: Vec<f64> = samples.iter().map(|(_, t)| *t).collect();
        let Some(offsets) = Self::calculate_offsets(&values) else {
            pf_warn!("Berkeley round aborted: fewer than 2 samples");
            return false;
        };
        pf_info!("Berkeley round: {} samples, mean offset computed", samples.len());
        self.distribute_offsets(ctx, replication, &samples, &offsets).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calculate_offsets_requires_two_samples() {
        assert!(BerkeleySynchronizer::calculate_offsets(&[1.0]).is_none());
        assert!(BerkeleySynchronizer::calculate_offsets(&[]).is_none());
    }

    #[test]
    fn calculate_offsets_sums_to_near_zero() {
        let samples = vec![10.0, 12.0, 9.0];
        let offsets = BerkeleySynchronizer::calculate_offsets(&samples).unwrap();
        let sum: f64 = offsets.iter().sum();
        assert!(sum.abs() < 1e-9);
    }

    #[tokio::test]
    async fn apply_offset_accumulates() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::new(dir.keep()).unwrap();
        let sync = BerkeleySynchronizer::new("s1".into(), store);
        sync.apply_offset(1.5).await;
        sync.apply_offset(-0.5).await;
        assert!((sync.time_offset() - 1.0).abs() < 1e-9);
    }
}
