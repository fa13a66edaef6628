use crate::chain::{Chain, ChainState, MinerRound};
use crate::clients::ClientRegistry;
use crate::com::api::{self, FetchError, SubmitNonceResponse};
use crate::upstream::Upstream;
use bytes::Bytes;
use moka::sync::Cache;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use stopwatch::Stopwatch;
use tokio::sync::Mutex;

const LIAR_TTL: Duration = Duration::from_secs(15 * 60);

/// Decision for one incoming submission.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// Forwarded upstream; carries the body to relay to the miner.
    Updated(Bytes),
    /// Kept the previous state; ack with the locally computed deadline.
    NotUpdated(u64),
    WrongHeight,
    ExceededMinersPerIp,
    RemoteErr(FetchError),
}

pub struct Proxy {
    pub chains: Arc<ChainState>,
    pub primary_upstream: Upstream,
    pub secondary_upstream: Option<Upstream>,
    pub clients: Arc<ClientRegistry>,
    liars: Cache<String, ()>,
    miners_per_ip: usize,
    lie_detector: bool,
}

impl Proxy {
    pub fn new(
        chains: Arc<ChainState>,
        primary_upstream: Upstream,
        secondary_upstream: Option<Upstream>,
        clients: Arc<ClientRegistry>,
        miners_per_ip: usize,
        lie_detector: bool,
    ) -> Self {
        Proxy {
            chains,
            primary_upstream,
            secondary_upstream,
            clients,
            liars: Cache::builder().time_to_live(LIAR_TTL).build(),
            miners_per_ip,
            lie_detector,
        }
    }

    fn upstream_for(&self, prim: bool) -> &Upstream {
        if prim {
            &self.primary_upstream
        } else {
            self.secondary_upstream
                .as_ref()
                .expect("secondary upstream configured")
        }
    }

    /// Streaming upstreams learn the fleet size out of band.
    pub fn notify_capacity(&self, total: u64) {
        self.primary_upstream.update_capacity(total);
        if let Some(upstream) = &self.secondary_upstream {
            upstream.update_capacity(total);
        }
    }

    pub async fn submit_round(&self, remote: SocketAddr, round: MinerRound) -> SubmitOutcome {
        let ip_key = remote.to_string();
        let ip_host = remote.ip().to_string();

        let (cur_height, cur_base_target, cur_prim) = self.chains.current();
        let (last_height, last_base_target, last_prim) = self.chains.last();

        // a submission for the previous round only stays valid across a
        // chain switch
        if round.height != cur_height
            && (cur_prim == last_prim || round.height != last_height)
        {
            warn!(
                "wrong height: height={}, id={}, nonce={}, dl={}",
                round.height,
                round.account_id,
                round.nonce,
                dl_repr(&round)
            );
            return SubmitOutcome::WrongHeight;
        }

        let (prim, base_target) = if round.height == cur_height {
            (cur_prim, cur_base_target)
        } else {
            (last_prim, last_base_target)
        };
        let deadline = round.adjusted_deadline(base_target);

        if self.liars.contains_key(&ip_host) {
            info!(
                "quarantined ip, not forwarding: height={}, id={}, nonce={}, dl={}",
                round.height,
                round.account_id,
                round.nonce,
                dl_repr(&round)
            );
            return SubmitOutcome::NotUpdated(deadline);
        }

        let chain = self.chains.chain(prim);

        if deadline > chain.target_deadline {
            info!(
                "dl over target: height={}, id={}, nonce={}, dl={}",
                round.height,
                round.account_id,
                round.nonce,
                dl_repr(&round)
            );
            return SubmitOutcome::NotUpdated(deadline);
        }
        if chain.ignore_worse_deadlines && deadline > chain.best() {
            info!(
                "dl worse than best: height={}, id={}, nonce={}, dl={}",
                round.height,
                round.account_id,
                round.nonce,
                dl_repr(&round)
            );
            return SubmitOutcome::NotUpdated(deadline);
        }

        let bucket = match chain.buckets.get(&ip_key) {
            Some(bucket) => bucket,
            None => {
                // first submission from this address: forward before caching
                return match self.forward(chain, prim, &round, deadline, &ip_host).await {
                    Ok(body) => {
                        let mut entries = HashMap::new();
                        entries.insert(round.account_id, round);
                        chain.buckets.insert(ip_key, Arc::new(Mutex::new(entries)));
                        chain.lower_best(deadline);
                        SubmitOutcome::Updated(body)
                    }
                    Err(e) => {
                        error!(
                            "submission failed: height={}, id={}, nonce={}, dl={}, err={}",
                            round.height,
                            round.account_id,
                            round.nonce,
                            dl_repr(&round),
                            e
                        );
                        SubmitOutcome::RemoteErr(e)
                    }
                };
            }
        };

        let mut entries = bucket.lock().await;
        match entries.get(&round.account_id) {
            Some(stored) => {
                let stored_deadline = stored.adjusted_deadline(base_target);
                if stored.height > round.height
                    || (stored.height == round.height && stored_deadline < deadline)
                {
                    info!(
                        "dl not updated: height={}, id={}, nonce={}, dl={}",
                        round.height,
                        round.account_id,
                        round.nonce,
                        dl_repr(&round)
                    );
                    return SubmitOutcome::NotUpdated(deadline);
                }
            }
            None => {
                if entries.len() >= self.miners_per_ip {
                    // a round left over from an earlier block can make room
                    let stale = entries
                        .iter()
                        .find(|(_, stored)| stored.height < round.height)
                        .map(|(account, _)| *account);
                    match stale {
                        Some(account) => {
                            entries.remove(&account);
                        }
                        None => {
                            warn!(
                                "miners per ip exceeded: height={}, id={}, nonce={}, dl={}",
                                round.height,
                                round.account_id,
                                round.nonce,
                                dl_repr(&round)
                            );
                            return SubmitOutcome::ExceededMinersPerIp;
                        }
                    }
                }
            }
        }

        match self.forward(chain, prim, &round, deadline, &ip_host).await {
            Ok(body) => {
                entries.insert(round.account_id, round);
                chain.lower_best(deadline);
                SubmitOutcome::Updated(body)
            }
            Err(e) => {
                error!(
                    "submission failed: height={}, id={}, nonce={}, dl={}, err={}",
                    round.height,
                    round.account_id,
                    round.nonce,
                    dl_repr(&round),
                    e
                );
                SubmitOutcome::RemoteErr(e)
            }
        }
    }

    async fn forward(
        &self,
        chain: &Chain,
        prim: bool,
        round: &MinerRound,
        deadline: u64,
        ip_host: &str,
    ) -> Result<Bytes, FetchError> {
        let capacity = self.clients.total_capacity_gib();
        let miner_ip = if chain.ip_forwarding {
            Some(ip_host)
        } else {
            None
        };
        let sw = Stopwatch::start_new();
        let reply = self
            .upstream_for(prim)
            .submit_nonce(round, deadline, capacity, miner_ip)
            .await?;
        let latency = sw.elapsed_ms();

        let body = match reply {
            Some(body) => {
                if self.lie_detector {
                    if let Ok(resp) = serde_json::from_slice::<SubmitNonceResponse>(&body) {
                        if resp.deadline != deadline {
                            warn!(
                                "dl mismatch, quarantining: ip={}, dl={}, dl_upstream={}",
                                ip_host, deadline, resp.deadline
                            );
                            self.liars.insert(ip_host.to_owned(), ());
                        }
                    }
                }
                body
            }
            // the push protocol never answers a submission, ack optimistically
            None => Bytes::from(api::success_body(deadline)),
        };
        info!(
            "dl accepted: height={}, id={}, nonce={}, dl={}, latency={}ms",
            round.height,
            round.account_id,
            round.nonce,
            dl_repr(round),
            latency
        );
        Ok(body)
    }
}

fn dl_repr(round: &MinerRound) -> String {
    if round.adjusted {
        format!("X{}", round.deadline)
    } else {
        round.deadline.to_string()
    }
}
