use crate::chain::MinerRound;
use crate::com::api::{FetchError, MiningInfoResponse};
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Client as InnerClient;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// A client for communicating with a pull upstream (pool, wallet or
/// another proxy).
#[derive(Clone, Debug)]
pub struct Client {
    inner: InnerClient,
    base_uri: Url,
    passphrase: Arc<String>,
    account_key: Arc<String>,
    miner_name: Arc<String>,
    miner_alias: Arc<String>,
}

impl Client {
    fn ua() -> String {
        "Aggregator/".to_owned() + env!("CARGO_PKG_VERSION")
    }

    pub fn new(
        base_uri: Url,
        passphrase: String,
        account_key: String,
        miner_name: String,
        miner_alias: String,
        timeout: u64,
    ) -> Self {
        let inner = InnerClient::builder()
            .timeout(Duration::from_millis(timeout))
            .build()
            .unwrap();

        Self {
            inner,
            base_uri,
            passphrase: Arc::new(passphrase),
            account_key: Arc::new(account_key),
            miner_name: Arc::new(miner_name),
            miner_alias: Arc::new(miner_alias),
        }
    }

    fn headers(&self, capacity: u64, miner_ip: Option<&str>) -> HeaderMap {
        let ua = Client::ua();
        let mut headers = HeaderMap::new();
        headers.insert("User-Agent", ua.parse().unwrap());
        // It's amazing how a user agent is just not enough.
        headers.insert("X-Miner", ua.parse().unwrap());
        if let Ok(name) = self.miner_name.parse() {
            headers.insert("X-MinerName", name);
        }
        if let Ok(alias) = self.miner_alias.parse() {
            headers.insert("X-MinerAlias", alias);
        }
        headers.insert("X-Capacity", capacity.to_string().parse().unwrap());
        if let Ok(account) = self.account_key.parse() {
            headers.insert("X-Account", account);
        }
        if let Some(ip) = miner_ip {
            if let Ok(ip) = ip.parse() {
                headers.insert("X-Forwarded-For", ip);
            }
        }
        headers
    }

    pub fn uri_for(&self, path: &str) -> Url {
        let mut url = self.base_uri.clone();
        url.path_segments_mut()
            .map_err(|_| "cannot be base")
            .unwrap()
            .pop_if_empty()
            .push(path);
        url
    }

    /// Get the upstream's current mining info.
    pub async fn get_mining_info(&self, capacity: u64) -> Result<MiningInfoResponse, FetchError> {
        let res = self
            .inner
            .get(self.uri_for("burst"))
            .headers(self.headers(capacity, None))
            .query(&[("requestType", "getMiningInfo")])
            .send()
            .await?;
        let body = res.bytes().await?;
        crate::com::api::parse_json_result(&body)
    }

    /// Forward a miner's submission and return the upstream body verbatim.
    pub async fn submit_nonce(
        &self,
        round: &MinerRound,
        capacity: u64,
        miner_ip: Option<&str>,
    ) -> Result<Bytes, FetchError> {
        let mut url = self.uri_for("burst");
        {
            let mut query = url.query_pairs_mut();
            query.clear();
            for (key, value) in submit_nonce_query(round, &self.passphrase) {
                query.append_pair(key, &value);
            }
        }
        let res = self
            .inner
            .post(url)
            .headers(self.headers(capacity, miner_ip))
            .send()
            .await?;
        Ok(res.bytes().await?)
    }
}

/// Query for a forwarded submission. The chain passphrase overrides the
/// miner's; an empty final passphrase means pool mode (the deadline rides
/// along unless the miner pre-adjusted it), a non-empty one means wallet
/// mode (the upstream recomputes the deadline itself).
pub fn submit_nonce_query(round: &MinerRound, chain_passphrase: &str) -> Vec<(&'static str, String)> {
    let mut query = vec![
        ("requestType", "submitNonce".to_owned()),
        ("accountId", round.account_id.to_string()),
        ("nonce", round.nonce.to_string()),
        ("blockheight", round.height.to_string()),
    ];

    let passphrase = if chain_passphrase.is_empty() {
        round.secret_phrase.clone().unwrap_or_default()
    } else {
        chain_passphrase.to_owned()
    };

    if passphrase.is_empty() {
        if !round.adjusted {
            query.push(("deadline", round.deadline.to_string()));
        }
    } else {
        query.push(("secretPhrase", passphrase));
    }

    query
}
