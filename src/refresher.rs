use crate::chain::{ChainState, MiningInfo};
use crate::clients::ClientRegistry;
use crate::com::api::FetchError;
use crate::upstream::Upstream;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transition {
    NewBlock,
    ForkBack,
    SameHeightFork,
    None,
}

fn classify(cur: Option<&MiningInfo>, candidate: &MiningInfo) -> Transition {
    match cur {
        None => Transition::NewBlock,
        Some(cur) if cur.height < candidate.height => Transition::NewBlock,
        Some(cur) if cur.height > candidate.height => Transition::ForkBack,
        Some(cur) if cur.base_target != candidate.base_target => Transition::SameHeightFork,
        _ => Transition::None,
    }
}

/// Drives both upstreams once per second, rotates rounds and arbitrates
/// which chain miners are pointed at.
pub struct Refresher {
    pub chains: Arc<ChainState>,
    pub primary: Upstream,
    pub secondary: Option<Upstream>,
    pub clients: Arc<ClientRegistry>,
    pub scan_time: Duration,
}

impl Refresher {
    pub async fn refresh_once(&self) -> Result<(), FetchError> {
        let capacity = self.clients.total_capacity_gib();

        match self.primary.fetch_mining_info(capacity).await? {
            Some(candidate) => self.apply(true, candidate),
            None => {}
        }

        // while miners are still busy with a primary round, switching the
        // served info would waste their scan
        if let Some(secondary) = &self.secondary {
            let primary_scanning = self
                .chains
                .primary
                .current()
                .map(|mi| mi.start_time.elapsed() < self.scan_time)
                .unwrap_or(false);
            if !primary_scanning {
                if let Some(candidate) = secondary.fetch_mining_info(capacity).await? {
                    self.apply(false, candidate);
                }
            }
        }

        Ok(())
    }

    fn apply(&self, prim: bool, candidate: Arc<MiningInfo>) {
        let chain = self.chains.chain(prim);
        let cur = chain.current();
        let transition = classify(cur.as_deref(), &candidate);
        if transition == Transition::None {
            return;
        }

        let (_, _, cur_prim) = self.chains.current();
        if cur_prim != prim {
            self.chains.demote_current_to_last();
        }

        chain.publish(candidate.clone());
        match transition {
            Transition::NewBlock => {
                info!(
                    "{}: new block: height={}, baseTarget={}, targetDeadline={}, gensig={}",
                    chain.label,
                    candidate.height,
                    candidate.base_target,
                    candidate.target_deadline,
                    candidate.generation_signature
                );
            }
            Transition::ForkBack | Transition::SameHeightFork => {
                warn!(
                    "{}: fork: height={}, baseTarget={}",
                    chain.label, candidate.height, candidate.base_target
                );
                chain.flush_buckets();
            }
            Transition::None => unreachable!(),
        }
        chain.reset_best();
        self.chains
            .advance_current(candidate.height, candidate.base_target, prim);

        // miners redirected to primary must not keep scanning a secondary
        // round that was interrupted mid-scan
        if prim {
            if let Some(secondary) = &self.chains.secondary {
                if let Some(sec_mi) = secondary.current() {
                    if sec_mi.height != 0 && sec_mi.start_time.elapsed() < self.scan_time {
                        secondary.publish(Arc::new(MiningInfo::zeroed()));
                    }
                }
            }
        }
    }

    pub async fn run(self) {
        let mut outage = false;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            match self.refresh_once().await {
                Ok(()) => {
                    if outage {
                        error!("outage resolved.");
                        outage = false;
                    }
                }
                Err(e) => {
                    if !outage {
                        error!("error getting mining info => connection outage: {}", e);
                        outage = true;
                    }
                }
            }
        }
    }
}
