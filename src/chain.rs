use crate::com::api::{MiningInfoPayload, MiningInfoResponse};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use moka::sync::Cache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const BUCKET_TTL: Duration = Duration::from_secs(15 * 60);

/// One pending nonce submission, immutable after parsing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinerRound {
    pub account_id: u64,
    pub height: u64,
    pub nonce: u64,
    pub deadline: u64,
    pub secret_phrase: Option<String>,
    /// The miner already divided the deadline by the base target.
    pub adjusted: bool,
}

impl MinerRound {
    /// Deadline comparable across miners for the given base target.
    pub fn adjusted_deadline(&self, base_target: u64) -> u64 {
        if self.adjusted {
            self.deadline
        } else {
            self.deadline / base_target.max(1)
        }
    }
}

/// A published round snapshot. Replaced wholesale on every transition,
/// never mutated in place.
#[derive(Clone, Debug)]
pub struct MiningInfo {
    pub height: u64,
    pub base_target: u64,
    pub target_deadline: u64,
    pub generation_signature: String,
    /// The exact bytes served to miners on getMiningInfo.
    pub payload: Bytes,
    pub start_time: Instant,
}

impl MiningInfo {
    pub fn from_response(resp: &MiningInfoResponse) -> Self {
        let payload = MiningInfoPayload {
            height: resp.height,
            base_target: resp.base_target,
            generation_signature: &resp.generation_signature,
        };
        MiningInfo {
            height: resp.height,
            base_target: resp.base_target,
            target_deadline: resp.target_deadline,
            generation_signature: resp.generation_signature.clone(),
            payload: Bytes::from(serde_json::to_vec(&payload).expect("mining info serializes")),
            start_time: Instant::now(),
        }
    }

    /// A blank round that keeps redirected miners from scanning a stale one.
    pub fn zeroed() -> Self {
        MiningInfo::from_response(&MiningInfoResponse {
            height: 0,
            base_target: 0,
            generation_signature: String::new(),
            target_deadline: 0,
        })
    }
}

/// Submissions from one source address, keyed by account id.
pub type IpBucket = Mutex<HashMap<u64, MinerRound>>;

/// Per-upstream mining state and policy.
pub struct Chain {
    pub label: &'static str,
    pub mining_info: ArcSwapOption<MiningInfo>,
    pub best_deadline: AtomicU64,
    pub target_deadline: u64,
    pub ignore_worse_deadlines: bool,
    pub ip_forwarding: bool,
    pub buckets: Cache<String, Arc<IpBucket>>,
}

impl Chain {
    pub fn new(
        label: &'static str,
        target_deadline: u64,
        ignore_worse_deadlines: bool,
        ip_forwarding: bool,
    ) -> Self {
        Chain {
            label,
            mining_info: ArcSwapOption::from(None),
            best_deadline: AtomicU64::new(u64::MAX),
            target_deadline,
            ignore_worse_deadlines,
            ip_forwarding,
            buckets: Cache::builder().time_to_idle(BUCKET_TTL).build(),
        }
    }

    pub fn publish(&self, mi: Arc<MiningInfo>) {
        self.mining_info.store(Some(mi));
    }

    pub fn current(&self) -> Option<Arc<MiningInfo>> {
        self.mining_info.load_full()
    }

    pub fn reset_best(&self) {
        self.best_deadline.store(u64::MAX, Ordering::SeqCst);
    }

    pub fn lower_best(&self, deadline: u64) {
        self.best_deadline.fetch_min(deadline, Ordering::SeqCst);
    }

    pub fn best(&self) -> u64 {
        self.best_deadline.load(Ordering::SeqCst)
    }

    pub fn flush_buckets(&self) {
        self.buckets.invalidate_all();
    }
}

/// Process-wide view of the two most recent block transitions across both
/// chains. Scalars are written only after the new snapshot pointer is
/// published; readers tolerate one tick of staleness.
pub struct ChainState {
    pub primary: Chain,
    pub secondary: Option<Chain>,
    current_height: AtomicU64,
    current_base_target: AtomicU64,
    current_prim: AtomicBool,
    last_height: AtomicU64,
    last_base_target: AtomicU64,
    last_prim: AtomicBool,
}

impl ChainState {
    pub fn new(primary: Chain, secondary: Option<Chain>) -> Self {
        ChainState {
            primary,
            secondary,
            current_height: AtomicU64::new(0),
            current_base_target: AtomicU64::new(0),
            current_prim: AtomicBool::new(true),
            last_height: AtomicU64::new(0),
            last_base_target: AtomicU64::new(0),
            last_prim: AtomicBool::new(true),
        }
    }

    pub fn chain(&self, prim: bool) -> &Chain {
        if prim {
            &self.primary
        } else {
            self.secondary.as_ref().expect("secondary chain configured")
        }
    }

    pub fn current(&self) -> (u64, u64, bool) {
        (
            self.current_height.load(Ordering::SeqCst),
            self.current_base_target.load(Ordering::SeqCst),
            self.current_prim.load(Ordering::SeqCst),
        )
    }

    pub fn last(&self) -> (u64, u64, bool) {
        (
            self.last_height.load(Ordering::SeqCst),
            self.last_base_target.load(Ordering::SeqCst),
            self.last_prim.load(Ordering::SeqCst),
        )
    }

    /// Records a cross-chain hand-off: the outgoing round stays addressable
    /// for one more block.
    pub fn demote_current_to_last(&self) {
        let (height, base_target, prim) = self.current();
        self.last_height.store(height, Ordering::SeqCst);
        self.last_base_target.store(base_target, Ordering::SeqCst);
        self.last_prim.store(prim, Ordering::SeqCst);
    }

    pub fn advance_current(&self, height: u64, base_target: u64, prim: bool) {
        self.current_height.store(height, Ordering::SeqCst);
        self.current_base_target.store(base_target, Ordering::SeqCst);
        self.current_prim.store(prim, Ordering::SeqCst);
    }

    /// The snapshot served to miners right now.
    pub fn serving_mining_info(&self) -> Option<Arc<MiningInfo>> {
        let prim = self.current_prim.load(Ordering::SeqCst);
        let chain = if prim {
            &self.primary
        } else {
            match &self.secondary {
                Some(chain) => chain,
                None => &self.primary,
            }
        };
        chain.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(height: u64, base_target: u64) -> MiningInfo {
        MiningInfo::from_response(&MiningInfoResponse {
            height,
            base_target,
            generation_signature: "ab".to_owned(),
            target_deadline: 0,
        })
    }

    #[test]
    fn test_adjusted_deadline() {
        let mut round = MinerRound {
            account_id: 1,
            height: 100,
            nonce: 7,
            deadline: 5000,
            secret_phrase: None,
            adjusted: false,
        };
        assert_eq!(round.adjusted_deadline(10), 500);
        round.adjusted = true;
        assert_eq!(round.adjusted_deadline(10), 5000);
    }

    #[test]
    fn test_payload_bytes_are_stringified() {
        let mi = info(714_000, 70_000);
        let value: serde_json::Value = serde_json::from_slice(&mi.payload).unwrap();
        assert_eq!(value["height"], "714000");
        assert_eq!(value["baseTarget"], "70000");
        assert_eq!(value["generationSignature"], "ab");
        assert_eq!(value.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_zeroed_round() {
        let mi = MiningInfo::zeroed();
        assert_eq!(mi.height, 0);
        assert_eq!(mi.base_target, 0);
        assert!(mi.generation_signature.is_empty());
    }

    #[test]
    fn test_best_deadline_is_monotone() {
        let chain = Chain::new("primary", u64::MAX, false, false);
        assert_eq!(chain.best(), u64::MAX);
        chain.lower_best(500);
        chain.lower_best(700);
        assert_eq!(chain.best(), 500);
        chain.lower_best(400);
        assert_eq!(chain.best(), 400);
        chain.reset_best();
        assert_eq!(chain.best(), u64::MAX);
    }

    #[test]
    fn test_demote_then_advance() {
        let state = ChainState::new(
            Chain::new("primary", u64::MAX, false, false),
            Some(Chain::new("secondary", u64::MAX, false, false)),
        );
        state.advance_current(100, 10, true);
        state.demote_current_to_last();
        state.advance_current(200, 5, false);
        assert_eq!(state.current(), (200, 5, false));
        assert_eq!(state.last(), (100, 10, true));
    }

    #[test]
    fn test_serving_mining_info_follows_current_chain() {
        let state = ChainState::new(
            Chain::new("primary", u64::MAX, false, false),
            Some(Chain::new("secondary", u64::MAX, false, false)),
        );
        state.primary.publish(Arc::new(info(100, 10)));
        state.chain(false).publish(Arc::new(info(200, 5)));
        state.advance_current(100, 10, true);
        assert_eq!(state.serving_mining_info().unwrap().height, 100);
        state.advance_current(200, 5, false);
        assert_eq!(state.serving_mining_info().unwrap().height, 200);
    }
}
