use std::fs;
use url::Url;

#[derive(Debug, Serialize, Deserialize)]
pub struct Cfg {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default = "default_stats_listen_address")]
    pub stats_listen_address: String,

    #[serde(default = "default_miners_per_ip")]
    pub miners_per_ip: usize,

    pub primary_submit_url: Url,

    #[serde(default)]
    pub secondary_submit_url: Option<Url>,

    #[serde(default = "default_passphrase")]
    pub primary_passphrase: String,

    #[serde(default = "default_passphrase")]
    pub secondary_passphrase: String,

    #[serde(default)]
    pub primary_ip_forwarding: bool,

    #[serde(default)]
    pub secondary_ip_forwarding: bool,

    #[serde(default)]
    pub primary_ignore_worse_deadlines: bool,

    #[serde(default)]
    pub secondary_ignore_worse_deadlines: bool,

    #[serde(default = "default_account_key")]
    pub primary_account_key: String,

    #[serde(default = "default_account_key")]
    pub secondary_account_key: String,

    #[serde(default = "default_target_deadline")]
    pub primary_target_deadline: u64,

    #[serde(default = "default_target_deadline")]
    pub secondary_target_deadline: u64,

    #[serde(default = "default_scan_time")]
    pub scan_time: u64,

    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    #[serde(default = "default_burst_rate")]
    pub burst_rate: u32,

    #[serde(default = "default_lie_detector")]
    pub lie_detector: bool,

    #[serde(default = "default_miner_name")]
    pub miner_name: String,

    #[serde(default = "default_miner_alias")]
    pub miner_alias: String,

    #[serde(default = "default_timeout")]
    pub timeout: u64,

    #[serde(default)]
    pub file_logging: bool,

    #[serde(default = "default_cert_file")]
    pub cert_file: String,

    #[serde(default = "default_key_file")]
    pub key_file: String,

    #[serde(default = "default_console_log_level")]
    pub console_log_level: String,

    #[serde(default = "default_logfile_log_level")]
    pub logfile_log_level: String,

    #[serde(default = "default_logfile_max_count")]
    pub logfile_max_count: u32,

    #[serde(default = "default_logfile_max_size")]
    pub logfile_max_size: u64,

    #[serde(default = "default_console_log_pattern")]
    pub console_log_pattern: String,

    #[serde(default = "default_logfile_log_pattern")]
    pub logfile_log_pattern: String,
}

fn default_listen_address() -> String {
    "0.0.0.0:8124".to_owned()
}

fn default_stats_listen_address() -> String {
    "0.0.0.0:8125".to_owned()
}

fn default_miners_per_ip() -> usize {
    5
}

fn default_passphrase() -> String {
    "".to_owned()
}

fn default_account_key() -> String {
    "".to_owned()
}

fn default_target_deadline() -> u64 {
    u64::from(u32::MAX)
}

fn default_scan_time() -> u64 {
    30
}

fn default_rate_limit() -> u32 {
    20
}

fn default_burst_rate() -> u32 {
    40
}

fn default_lie_detector() -> bool {
    true
}

fn default_miner_name() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "".to_owned())
}

fn default_miner_alias() -> String {
    "".to_owned()
}

fn default_timeout() -> u64 {
    5000
}

fn default_cert_file() -> String {
    "".to_owned()
}

fn default_key_file() -> String {
    "".to_owned()
}

fn default_console_log_level() -> String {
    "Info".to_owned()
}

fn default_logfile_log_level() -> String {
    "Warn".to_owned()
}

fn default_logfile_max_count() -> u32 {
    10
}

fn default_logfile_max_size() -> u64 {
    20
}

fn default_console_log_pattern() -> String {
    "\r{d(%H:%M:%S.%3f%z)} [{h({l}):<5}] [{T}] [{t}] - {M}:{m}{n}".to_owned()
}

fn default_logfile_log_pattern() -> String {
    "\r{d(%Y-%m-%dT%H:%M:%S.%3f%z)} [{h({l}):<5}] [{T}] [{f}:{L}] [{t}] - {M}:{m}{n}".to_owned()
}

pub fn load_cfg(config: &str) -> Cfg {
    let cfg_str =
        fs::read_to_string(config).expect(&format!("failed to open config, config={}", config));
    let cfg: Cfg = serde_yaml::from_str(&cfg_str).expect("failed to parse config");
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_cfg() {
        let cfg = load_cfg("config.yaml");
        assert_eq!(cfg.listen_address, "0.0.0.0:8124");
        assert_eq!(cfg.miners_per_ip, 5);
        assert_eq!(cfg.scan_time, 30);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg: Cfg = serde_yaml::from_str("primary_submit_url: http://pool.example:8080\n")
            .unwrap();
        assert_eq!(cfg.primary_submit_url.as_str(), "http://pool.example:8080/");
        assert!(cfg.secondary_submit_url.is_none());
        assert_eq!(cfg.primary_target_deadline, u64::from(u32::MAX));
        assert!(cfg.lie_detector);
        assert_eq!(cfg.timeout, 5000);
        assert!(!cfg.file_logging);
        assert!(cfg.cert_file.is_empty());
    }

    #[test]
    fn test_dual_chain_config() {
        let cfg: Cfg = serde_yaml::from_str(
            "primary_submit_url: wss://pool.example/ws\n\
             secondary_submit_url: http://wallet.example:8125\n\
             secondary_passphrase: lazy fox\n\
             secondary_target_deadline: 1000000\n",
        )
        .unwrap();
        assert_eq!(cfg.primary_submit_url.scheme(), "wss");
        assert_eq!(
            cfg.secondary_submit_url.unwrap().as_str(),
            "http://wallet.example:8125/"
        );
        assert_eq!(cfg.secondary_passphrase, "lazy fox");
        assert_eq!(cfg.secondary_target_deadline, 1_000_000);
    }
}
