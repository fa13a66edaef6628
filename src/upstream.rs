use crate::chain::{MinerRound, MiningInfo};
use crate::com::api::FetchError;
use crate::com::client::Client;
use crate::com::ws::WsTransport;
use bytes::Bytes;
use std::sync::Arc;

/// Transport seam between the proxy and an upstream. A `wss` URL selects
/// the push transport, anything else the pull transport.
#[derive(Clone)]
pub enum Upstream {
    Pull(Client),
    Push(Arc<WsTransport>),
    #[cfg(test)]
    Mock(Arc<mock::MockUpstream>),
}

impl Upstream {
    /// Candidate mining info for this tick. `None` means the upstream has
    /// nothing to offer yet (push transport before the first frame).
    pub async fn fetch_mining_info(
        &self,
        capacity: u64,
    ) -> Result<Option<Arc<MiningInfo>>, FetchError> {
        match self {
            Upstream::Pull(client) => {
                let resp = client.get_mining_info(capacity).await?;
                Ok(Some(Arc::new(MiningInfo::from_response(&resp))))
            }
            Upstream::Push(transport) => {
                if transport.available() {
                    Ok(transport.current_mining_info())
                } else {
                    Ok(None)
                }
            }
            #[cfg(test)]
            Upstream::Mock(mock) => mock.fetch(),
        }
    }

    /// Forward a submission. `Some` carries the upstream's reply body;
    /// `None` means the transport gives no per-submission reply.
    pub async fn submit_nonce(
        &self,
        round: &MinerRound,
        deadline: u64,
        capacity: u64,
        miner_ip: Option<&str>,
    ) -> Result<Option<Bytes>, FetchError> {
        match self {
            Upstream::Pull(client) => Ok(Some(client.submit_nonce(round, capacity, miner_ip).await?)),
            Upstream::Push(transport) => {
                transport.submit_nonce(round, deadline).await?;
                Ok(None)
            }
            #[cfg(test)]
            Upstream::Mock(mock) => mock.submit(round, deadline),
        }
    }

    pub fn update_capacity(&self, total: u64) {
        if let Upstream::Push(transport) = self {
            transport.update_capacity(total);
        }
    }
}
