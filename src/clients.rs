use moka::sync::Cache;
use std::time::Duration;

const CLIENT_TTL: Duration = Duration::from_secs(60);

/// What a miner most recently reported about itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientData {
    pub miner_name: String,
    pub alias: String,
    pub xpu: String,
    pub capacity_gib: u64,
}

/// Recently-seen miners, summed into the capacity reported upstream.
/// Entries expire after a minute of silence; getMiningInfo polls keep
/// an active miner registered.
pub struct ClientRegistry {
    clients: Cache<String, ClientData>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        ClientRegistry {
            clients: Cache::builder().time_to_live(CLIENT_TTL).build(),
        }
    }

    pub fn fingerprint(ip: &str, port: u16, miner_name: &str, xpu: &str) -> String {
        let canonical = format!("{}|{}|{}|{}", ip, port, miner_name, xpu);
        format!("{:x}", md5::compute(canonical))
    }

    pub fn update(&self, key: String, data: ClientData) {
        self.clients.insert(key, data);
    }

    pub fn total_capacity_gib(&self) -> u64 {
        self.clients.iter().map(|(_, c)| c.capacity_gib).sum()
    }

    pub fn snapshot(&self) -> Vec<(String, ClientData)> {
        self.clients
            .iter()
            .map(|(key, data)| ((*key).clone(), data))
            .collect()
    }
}
