use crate::chain::{MinerRound, MiningInfo};
use crate::com::api::{
    ClientInfo, FetchError, FlexU64, MiningInfoResponse, SubmitEntry, SubmitPara, WsChannel,
    WsCommand, WsInbound, WsSubscribe,
};
use arc_swap::ArcSwapOption;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECONNECT_DELAY: u64 = 10;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// A push upstream: one persistent websocket, redialled forever. Mining
/// info arrives asynchronously and is published through an atomic pointer;
/// submissions are fire-and-forget. The send and receive sides each have
/// their own mutex, created once for the life of the transport.
pub struct WsTransport {
    url: Url,
    account_key: String,
    miner_name: String,
    capacity: AtomicU64,
    available: AtomicBool,
    epoch: Instant,
    last_ack_ms: AtomicU64,
    mining_info: ArcSwapOption<MiningInfo>,
    writer: Mutex<Option<WsSink>>,
    reader: Mutex<Option<WsSource>>,
}

impl WsTransport {
    pub fn new(url: Url, account_key: String, miner_name: String) -> Arc<Self> {
        Arc::new(WsTransport {
            url,
            account_key,
            miner_name,
            capacity: AtomicU64::new(0),
            available: AtomicBool::new(false),
            epoch: Instant::now(),
            last_ack_ms: AtomicU64::new(0),
            mining_info: ArcSwapOption::from(None),
            writer: Mutex::new(None),
            reader: Mutex::new(None),
        })
    }

    fn miner_mark(&self) -> String {
        format!("{}.hdproxy.exe.{}", self.miner_name, env!("CARGO_PKG_VERSION"))
    }

    fn client_info(&self) -> ClientInfo {
        ClientInfo {
            account_key: self.account_key.clone(),
            miner_name: self.miner_name.clone(),
            miner_mark: self.miner_mark(),
            capacity: self.capacity.load(Ordering::SeqCst),
        }
    }

    pub fn update_capacity(&self, total: u64) {
        self.capacity.store(total, Ordering::SeqCst);
    }

    pub fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Latest round received over the stream, if any arrived yet.
    pub fn current_mining_info(&self) -> Option<Arc<MiningInfo>> {
        self.mining_info.load_full()
    }

    fn touch_ack(&self) {
        let elapsed = Instant::now().duration_since(self.epoch).as_millis() as u64;
        self.last_ack_ms.store(elapsed, Ordering::SeqCst);
    }

    fn ack_deadline(&self) -> Instant {
        self.epoch + Duration::from_millis(self.last_ack_ms.load(Ordering::SeqCst)) + HEARTBEAT_TIMEOUT
    }

    fn ack_expired(&self) -> bool {
        Instant::now() > self.ack_deadline()
    }

    /// Spawns the dial loop and returns immediately.
    pub fn start(self: Arc<Self>) {
        tokio::spawn(async move { self.run().await });
    }

    async fn run(self: Arc<Self>) {
        let mut delay = 1u64;
        loop {
            match connect_async(self.url.as_str()).await {
                Ok((stream, _)) => {
                    info!("ws: connected to {}", self.url);
                    delay = 1;
                    let (sink, source) = stream.split();
                    *self.writer.lock().await = Some(sink);
                    *self.reader.lock().await = Some(source);
                    self.touch_ack();

                    match self.subscribe().await {
                        Ok(()) => {
                            let heartbeat = tokio::spawn({
                                let transport = self.clone();
                                async move { transport.heartbeat_loop().await }
                            });
                            self.receive_loop().await;
                            heartbeat.abort();
                        }
                        Err(e) => warn!("ws: subscribe failed: {}", e),
                    }

                    self.available.store(false, Ordering::SeqCst);
                    *self.writer.lock().await = None;
                    *self.reader.lock().await = None;
                    warn!("ws: connection to {} lost, redialling", self.url);
                }
                Err(e) => {
                    warn!("ws: connect to {} failed: {}", self.url, e);
                }
            }
            tokio::time::sleep(Duration::from_secs(delay)).await;
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }
    }

    /// One-shot mining info request plus the channel subscription.
    async fn subscribe(&self) -> Result<(), FetchError> {
        let request = WsCommand {
            cmd: "mining_info",
            para: serde_json::json!({}),
        };
        self.send_text(serde_json::to_string(&request)?).await?;

        let subscription = WsSubscribe {
            event: "#subscribe",
            data: WsChannel {
                channel: "poolmgr.mining_info",
            },
            cid: 0,
        };
        self.send_text(serde_json::to_string(&subscription)?).await
    }

    async fn send_text(&self, text: String) -> Result<(), FetchError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(sink) => {
                sink.send(Message::Text(text)).await?;
                Ok(())
            }
            None => Err(FetchError::Unavailable("websocket not connected")),
        }
    }

    async fn heartbeat_loop(&self) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            let deadline = self.ack_deadline();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    warn!("ws: no heartbeat ack in {:?}, closing connection", HEARTBEAT_TIMEOUT);
                    let mut writer = self.writer.lock().await;
                    if let Some(sink) = writer.as_mut() {
                        let _ = sink.send(Message::Close(None)).await;
                    }
                    return;
                }
                _ = ticker.tick() => {
                    let frame = WsCommand {
                        cmd: "poolmgr.heartbeat",
                        para: self.client_info(),
                    };
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("ws: cannot encode heartbeat: {}", e);
                            return;
                        }
                    };
                    if let Err(e) = self.send_text(text).await {
                        warn!("ws: heartbeat send failed: {}", e);
                        return;
                    }
                }
            }
        }
    }

    async fn receive_loop(&self) {
        let mut reader = self.reader.lock().await;
        let source = match reader.as_mut() {
            Some(source) => source,
            None => return,
        };
        while let Some(frame) = source.next().await {
            match frame {
                Ok(Message::Text(text)) => self.handle_frame(&text),
                Ok(Message::Close(_)) => {
                    info!("ws: server closed the connection");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("ws: receive failed: {}", e);
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) {
        let inbound: WsInbound = match serde_json::from_str(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                debug!("ws: undecodable frame: {}", e);
                return;
            }
        };
        match inbound.cmd.as_deref() {
            Some("poolmgr.heartbeat") => self.touch_ack(),
            Some("mining_info") | Some("poolmgr.mining_info") => {
                match serde_json::from_value::<MiningInfoResponse>(inbound.para) {
                    Ok(resp) => {
                        info!(
                            "ws: mining info: height={}, baseTarget={}",
                            resp.height, resp.base_target
                        );
                        self.mining_info
                            .store(Some(Arc::new(MiningInfo::from_response(&resp))));
                        self.available.store(true, Ordering::SeqCst);
                    }
                    Err(e) => warn!("ws: bad mining_info payload: {}", e),
                }
            }
            _ => {}
        }
    }

    /// Fire-and-forget submission; the protocol has no per-submission reply.
    pub async fn submit_nonce(&self, round: &MinerRound, deadline: u64) -> Result<(), FetchError> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let para = SubmitPara {
            account_key: self.account_key.clone(),
            miner_name: self.miner_name.clone(),
            miner_mark: String::new(),
            capacity: self.capacity.load(Ordering::SeqCst),
            submit: vec![SubmitEntry {
                account_id: round.account_id,
                height: round.height,
                nonce: FlexU64(round.nonce),
                deadline,
                ts,
            }],
        };
        let frame = WsCommand {
            cmd: "poolmgr.submit_nonce",
            para,
        };
        self.send_text(serde_json::to_string(&frame)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> Arc<WsTransport> {
        WsTransport::new(
            "ws://127.0.0.1:1".parse().unwrap(),
            "key".to_owned(),
            "proxy".to_owned(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_fresh_after_29s_of_silence() {
        let transport = transport();
        transport.touch_ack();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!transport.ack_expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_expired_after_31s_of_silence() {
        let transport = transport();
        transport.touch_ack();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(transport.ack_expired());
        transport.touch_ack();
        assert!(!transport.ack_expired());
    }

    #[tokio::test]
    async fn test_miner_mark_includes_name_and_version() {
        let transport = transport();
        let mark = transport.miner_mark();
        assert!(mark.starts_with("proxy.hdproxy.exe."));
        assert!(mark.ends_with(env!("CARGO_PKG_VERSION")));
    }

    #[tokio::test]
    async fn test_heartbeat_frame_shape() {
        let transport = transport();
        transport.update_capacity(123);
        let frame = WsCommand {
            cmd: "poolmgr.heartbeat",
            para: transport.client_info(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["cmd"], "poolmgr.heartbeat");
        assert_eq!(value["para"]["account_key"], "key");
        assert_eq!(value["para"]["miner_name"], "proxy");
        assert_eq!(value["para"]["capacity"], 123);
    }

    #[tokio::test]
    async fn test_mining_info_frame_publishes_snapshot() {
        let transport = transport();
        assert!(!transport.available());
        transport.handle_frame(
            r#"{"cmd":"poolmgr.mining_info","para":{"height":"714000","baseTarget":70000,"generationSignature":"ab"}}"#,
        );
        let mi = transport.current_mining_info().unwrap();
        assert_eq!(mi.height, 714_000);
        assert_eq!(mi.base_target, 70_000);
        assert!(transport.available());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_frame_refreshes_ack() {
        let transport = transport();
        transport.touch_ack();
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(transport.ack_expired());
        transport.handle_frame(r#"{"cmd":"poolmgr.heartbeat","para":{}}"#);
        assert!(!transport.ack_expired());
    }

    #[tokio::test]
    async fn test_handshake_publish_and_reconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url: Url = format!("ws://{}", addr).parse().unwrap();
        let transport = WsTransport::new(url, "key".to_owned(), "proxy".to_owned());
        transport.clone().start();

        let (stream, _) = listener.accept().await.unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();

        let first = recv_text(&mut server).await;
        assert!(first.contains("\"cmd\":\"mining_info\""));
        let second = recv_text(&mut server).await;
        assert!(second.contains("#subscribe"));
        assert!(second.contains("poolmgr.mining_info"));
        let third = recv_text(&mut server).await;
        assert!(third.contains("poolmgr.heartbeat"));
        assert!(third.contains("proxy.hdproxy.exe."));

        server
            .send(Message::Text(
                r#"{"cmd":"mining_info","para":{"height":100,"baseTarget":"10","generationSignature":"ab"}}"#
                    .to_owned(),
            ))
            .await
            .unwrap();

        let mi = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(mi) = transport.current_mining_info() {
                    return mi;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(mi.height, 100);
        assert_eq!(mi.base_target, 10);
        assert!(transport.available());

        // dropping the server connection forces a redial with a fresh handshake
        drop(server);
        let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut server = tokio_tungstenite::accept_async(stream).await.unwrap();
        let replay = recv_text(&mut server).await;
        assert!(replay.contains("\"cmd\":\"mining_info\""));
    }

    async fn recv_text(server: &mut WebSocketStream<tokio::net::TcpStream>) -> String {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), server.next())
                .await
                .unwrap()
            {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    }
}
