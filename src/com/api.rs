use serde::de::DeserializeOwned;
use thiserror::Error;

/// Upstreams are inconsistent about numbers: wallets send JSON integers,
/// pools and other proxies send decimal strings. Accept both, emit strings.
pub mod flex {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    struct FlexVisitor;

    impl<'de> Visitor<'de> for FlexVisitor {
        type Value = u64;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("an unsigned integer or a decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
            u64::try_from(v).map_err(|_| E::custom("number out of range"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
            v.parse().map_err(de::Error::custom)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        d.deserialize_any(FlexVisitor)
    }

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(v)
    }
}

/// A u64 carried as a decimal string on the wire.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlexU64(pub u64);

impl serde::Serialize for FlexU64 {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        flex::serialize(&self.0, s)
    }
}

impl<'de> serde::Deserialize<'de> for FlexU64 {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        flex::deserialize(d).map(FlexU64)
    }
}

/// An upstream's view of the current round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiningInfoResponse {
    #[serde(with = "flex")]
    pub height: u64,

    #[serde(rename = "baseTarget", with = "flex")]
    pub base_target: u64,

    #[serde(rename = "generationSignature")]
    pub generation_signature: String,

    #[serde(rename = "targetDeadline", default, with = "flex")]
    pub target_deadline: u64,
}

/// The exact body served to miners: three fields, decimal-stringified.
#[derive(Serialize)]
pub struct MiningInfoPayload<'a> {
    #[serde(with = "flex")]
    pub height: u64,

    #[serde(rename = "baseTarget", with = "flex")]
    pub base_target: u64,

    #[serde(rename = "generationSignature")]
    pub generation_signature: &'a str,
}

/// Reply a pool or wallet gives for a nonce submission.
#[derive(Clone, Debug, Deserialize)]
pub struct SubmitNonceResponse {
    #[serde(with = "flex")]
    pub deadline: u64,

    #[serde(default)]
    pub result: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolError {
    pub code: i32,
    pub message: String,
}

#[derive(Deserialize)]
struct PoolErrorWrapper {
    error: PoolError,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pool error {}: {}", .0.code, .0.message)]
    Pool(PoolError),
    #[error("{0}")]
    Unavailable(&'static str),
}

pub fn parse_json_result<T: DeserializeOwned>(body: &[u8]) -> Result<T, FetchError> {
    match serde_json::from_slice(body) {
        Ok(x) => Ok(x),
        Err(e) => match serde_json::from_slice::<PoolErrorWrapper>(body) {
            Ok(wrapped) => Err(FetchError::Pool(wrapped.error)),
            Err(_) => Err(FetchError::Json(e)),
        },
    }
}

pub fn success_body(deadline: u64) -> String {
    serde_json::json!({ "deadline": deadline, "result": "success" }).to_string()
}

pub fn error_body(code: u32, message: &str) -> String {
    serde_json::json!({ "error": { "code": code, "message": message } }).to_string()
}

pub fn wrong_height_body() -> String {
    serde_json::json!({ "errorCode": "1005", "errorDescription": "Submitted on wrong height" })
        .to_string()
}

// Envelopes for the streaming upstream protocol.

#[derive(Serialize)]
pub struct WsCommand<T> {
    pub cmd: &'static str,
    pub para: T,
}

#[derive(Serialize)]
pub struct WsSubscribe {
    pub event: &'static str,
    pub data: WsChannel,
    pub cid: u32,
}

#[derive(Serialize)]
pub struct WsChannel {
    pub channel: &'static str,
}

#[derive(Clone, Debug, Serialize)]
pub struct ClientInfo {
    pub account_key: String,
    pub miner_name: String,
    pub miner_mark: String,
    pub capacity: u64,
}

#[derive(Serialize)]
pub struct SubmitEntry {
    #[serde(rename = "accountId")]
    pub account_id: u64,
    pub height: u64,
    pub nonce: FlexU64,
    pub deadline: u64,
    pub ts: u64,
}

#[derive(Serialize)]
pub struct SubmitPara {
    pub account_key: String,
    pub miner_name: String,
    pub miner_mark: String,
    pub capacity: u64,
    pub submit: Vec<SubmitEntry>,
}

#[derive(Debug, Deserialize)]
pub struct WsInbound {
    pub cmd: Option<String>,
    #[serde(default)]
    pub para: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flex_accepts_numbers_and_strings() {
        assert_eq!(serde_json::from_str::<FlexU64>("42").unwrap(), FlexU64(42));
        assert_eq!(serde_json::from_str::<FlexU64>("\"42\"").unwrap(), FlexU64(42));
        assert!(serde_json::from_str::<FlexU64>("\"x\"").is_err());
        assert!(serde_json::from_str::<FlexU64>("-1").is_err());
    }

    #[test]
    fn test_flex_serializes_as_decimal_string() {
        let v: FlexU64 = serde_json::from_str("42").unwrap();
        assert_eq!(serde_json::to_string(&v).unwrap(), "\"42\"");
    }

    #[test]
    fn test_mining_info_response_mixed_fields() {
        let body = r#"{"height":"714000","baseTarget":70000,"generationSignature":"ab12","targetDeadline":"31536000"}"#;
        let info: MiningInfoResponse = serde_json::from_str(body).unwrap();
        assert_eq!(info.height, 714_000);
        assert_eq!(info.base_target, 70_000);
        assert_eq!(info.target_deadline, 31_536_000);

        let body = r#"{"height":1,"baseTarget":2,"generationSignature":""}"#;
        let info: MiningInfoResponse = serde_json::from_str(body).unwrap();
        assert_eq!(info.target_deadline, 0);
    }

    #[test]
    fn test_mining_info_payload_is_three_stringified_fields() {
        let payload = MiningInfoPayload {
            height: 100,
            base_target: 10,
            generation_signature: "ab",
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&payload).unwrap()).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.len(), 3);
        assert_eq!(obj["height"], "100");
        assert_eq!(obj["baseTarget"], "10");
        assert_eq!(obj["generationSignature"], "ab");
    }

    #[test]
    fn test_parse_json_result_pool_error() {
        let err = parse_json_result::<SubmitNonceResponse>(
            br#"{"error":{"code":3,"message":"limit exceeded"}}"#,
        )
        .unwrap_err();
        match err {
            FetchError::Pool(e) => {
                assert_eq!(e.code, 3);
                assert_eq!(e.message, "limit exceeded");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_json_result_ok() {
        let resp: SubmitNonceResponse =
            parse_json_result(br#"{"deadline":"500","result":"success"}"#).unwrap();
        assert_eq!(resp.deadline, 500);
        assert_eq!(resp.result.as_deref(), Some("success"));
    }
}
