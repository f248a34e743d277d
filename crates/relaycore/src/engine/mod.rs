//! 連線引擎
//!
//! 擁有對遊戲伺服器的 TCP 連線，驅動整條下行管線：
//! 線路位元組 → 切行解碼 → 協定修復 → 區段平衡 → 下行掛鉤鏈 →
//! { 廣播緩衝區發佈, 客戶端轉送 }。上行方向對稱地經過上行掛鉤鏈
//! 後寫回伺服器，但不發佈到緩衝區。

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::buffer::{class, BroadcastBuffer, Line};
use crate::debug_log::WireLogger;
use crate::encoding::{decode_wire, encode_wire};
use crate::hooks::HookChain;
use crate::repair;

pub mod region;

use region::RegionBalancer;

/// 連線引擎錯誤
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("連線失敗: {0}")]
    ConnectionFailed(#[from] io::Error),

    #[error("連線逾時")]
    Timeout,

    #[error("未連線")]
    NotConnected,

    #[error("DNS 解析失敗: {0}")]
    DnsResolutionFailed(String),
}

/// 連線狀態機
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// 連線引擎配置
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 連線逾時
    pub connect_timeout: Duration,
    /// 讀取緩衝區大小
    pub read_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_buffer_size: 8192,
        }
    }
}

/// 前端客戶端的雙向通道：引擎把處理後的行送進 `to_client`，
/// 從 `from_client` 收玩家指令。
pub struct ClientLink {
    pub to_client: mpsc::Sender<String>,
    pub from_client: mpsc::Receiver<String>,
}

/// 連線引擎
///
/// 每條連線一個實例；掛鉤鏈與廣播緩衝區由建構方注入，
/// 可在多條連線或測試間各自獨立。
pub struct ConnectionEngine {
    config: EngineConfig,
    state: EngineState,
    stream: Option<TcpStream>,
    balancer: RegionBalancer,
    downstream: Arc<HookChain>,
    upstream: Arc<HookChain>,
    buffer: Arc<BroadcastBuffer>,
    /// 尚未湊滿一行的原始位元組
    pending: BytesMut,
    /// 最後一次自伺服器收到資料的時間
    last_receive: Option<Instant>,
}

impl ConnectionEngine {
    pub fn new(
        config: EngineConfig,
        downstream: Arc<HookChain>,
        upstream: Arc<HookChain>,
        buffer: Arc<BroadcastBuffer>,
    ) -> Self {
        Self {
            config,
            state: EngineState::Connecting,
            stream: None,
            balancer: RegionBalancer::new(),
            downstream,
            upstream,
            buffer,
            pending: BytesMut::new(),
            last_receive: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn last_receive(&self) -> Option<Instant> {
        self.last_receive
    }

    /// 連線到遊戲伺服器
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), EngineError> {
        self.state = EngineState::Connecting;
        info!("正在連線到 {}:{}", host, port);

        let addr = format!("{}:{}", host, port);
        let socket_addrs: Vec<SocketAddr> = tokio::net::lookup_host(&addr)
            .await
            .map_err(|e| EngineError::DnsResolutionFailed(e.to_string()))?
            .collect();

        if socket_addrs.is_empty() {
            return Err(EngineError::DnsResolutionFailed(format!(
                "無法解析主機: {}",
                host
            )));
        }

        debug!("已解析到位址: {:?}", socket_addrs);

        let stream = timeout(
            self.config.connect_timeout,
            TcpStream::connect(&socket_addrs[0]),
        )
        .await
        .map_err(|_| EngineError::Timeout)?
        .map_err(EngineError::ConnectionFailed)?;

        stream.set_nodelay(true)?;

        info!("已連線到 {}:{}", host, port);
        self.stream = Some(stream);
        self.state = EngineState::Open;

        Ok(())
    }

    /// 把一段線路位元組切成完整的行（CRLF 或 LF 結尾）並解碼
    ///
    /// 未湊滿一行的尾段留在內部緩衝，下一段到達時續接。
    /// 公開此方法以便測試。
    pub fn extract_lines(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let mut raw = self.pending.split_to(pos + 1);
            raw.truncate(raw.len() - 1);
            if raw.last() == Some(&b'\r') {
                raw.truncate(raw.len() - 1);
            }
            lines.push(decode_wire(&raw));
        }
        lines
    }

    /// 下行管線：修復 → 區段平衡 → 下行掛鉤鏈 → 分類
    ///
    /// 返回待發佈兼轉送的行；`None` 表示此行被丟棄或抑制。
    /// 公開此方法以便測試。
    pub fn process_downstream(&mut self, raw: &str) -> Option<Line> {
        let repaired = match repair::repair(raw) {
            Some(r) => r,
            None => {
                debug!("丟棄無法修復的協定行: {:?}", raw);
                return None;
            }
        };
        if repaired.is_empty() {
            return None;
        }

        let balanced = self.balancer.balance(&repaired);
        if balanced.is_empty() {
            return None;
        }

        let output = self.downstream.run(&balanced)?;

        let mut classes = class::RAW_NARRATIVE;
        if output != balanced {
            classes |= class::MODIFIED_NARRATIVE;
        }
        if repair::strip_tags(&output) == output {
            classes |= class::STRIPPED_NARRATIVE;
        }

        Some(Line::new(output, classes))
    }

    /// 上行管線：玩家指令經上行掛鉤鏈改寫；`None` 表示指令被丟棄
    ///
    /// 上行不發佈到廣播緩衝區。
    pub fn process_upstream(&self, command: &str) -> Option<String> {
        self.upstream.run(command)
    }

    /// 讀取迴圈：驅動雙向流量直到連線結束或收到關閉信號
    ///
    /// 消耗引擎本身；結束時連線進入 `Closed`。
    pub async fn run(
        mut self,
        link: ClientLink,
        mut shutdown: mpsc::Receiver<()>,
    ) -> Result<(), EngineError> {
        let stream = self.stream.take().ok_or(EngineError::NotConnected)?;
        let (mut reader, mut writer) = stream.into_split();
        let ClientLink {
            to_client,
            mut from_client,
        } = link;

        let mut buffer = vec![0u8; self.config.read_buffer_size];

        loop {
            tokio::select! {
                result = reader.read(&mut buffer) => {
                    match result {
                        Ok(0) => {
                            info!("伺服器已關閉連線");
                            break;
                        }
                        Ok(n) => {
                            self.last_receive = Some(Instant::now());
                            WireLogger::log_bytes("RECV", &buffer[..n]);

                            for raw in self.extract_lines(&buffer[..n]) {
                                if let Some(line) = self.process_downstream(&raw) {
                                    let text = line.text.clone();
                                    self.buffer.publish(line);
                                    if to_client.send(text).await.is_err() {
                                        warn!("客戶端已離線，停止轉送");
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!("讀取錯誤: {}", e);
                            break;
                        }
                    }
                }
                command = from_client.recv() => {
                    match command {
                        Some(command) => {
                            match self.process_upstream(&command) {
                                Some(outgoing) => {
                                    let mut data = encode_wire(&outgoing);
                                    data.extend_from_slice(b"\r\n");
                                    WireLogger::log_bytes("SEND", &data);
                                    if let Err(e) = writer.write_all(&data).await {
                                        error!("寫入錯誤: {}", e);
                                        break;
                                    }
                                    if let Err(e) = writer.flush().await {
                                        error!("寫入錯誤: {}", e);
                                        break;
                                    }
                                }
                                None => debug!("指令被上行掛鉤丟棄: {}", command),
                            }
                        }
                        None => {
                            info!("客戶端通道已關閉");
                            break;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("收到關閉信號");
                    break;
                }
            }
        }

        self.state = EngineState::Closing;
        drop(reader);
        drop(writer);
        self.state = EngineState::Closed;
        info!("連線已關閉");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::class;

    fn engine_with(retention: usize) -> (ConnectionEngine, Arc<BroadcastBuffer>) {
        let downstream = Arc::new(HookChain::new("downstream"));
        let upstream = Arc::new(HookChain::new("upstream"));
        let buffer = Arc::new(BroadcastBuffer::new(retention));
        let engine = ConnectionEngine::new(
            EngineConfig::default(),
            downstream,
            upstream,
            Arc::clone(&buffer),
        );
        (engine, buffer)
    }

    #[test]
    fn test_new_engine_is_connecting() {
        let (engine, _) = engine_with(200);
        assert_eq!(engine.state(), EngineState::Connecting);
        assert!(engine.last_receive().is_none());
    }

    #[test]
    fn test_combat_region_scenario() {
        let (mut engine, buffer) = engine_with(200);

        let inputs = [
            r#"<pushStream id="combat"/>"#,
            "Orc hits you for 5 damage!",
            "<prompt/>",
        ];
        let mut emitted = Vec::new();
        for input in inputs {
            if let Some(line) = engine.process_downstream(input) {
                let text = line.text.clone();
                buffer.publish(line);
                emitted.push(text);
            }
        }

        // 第三個單元在提示符前補上缺少的關閉標記
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[2], r#"<popStream id="combat"/><prompt/>"#);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.base_offset(), 0);
    }

    #[test]
    fn test_tagfree_line_is_stripped_class() {
        let (mut engine, _) = engine_with(200);
        let line = engine.process_downstream("Orc hits you for 5 damage!").unwrap();
        assert_eq!(
            line.classes,
            class::RAW_NARRATIVE | class::STRIPPED_NARRATIVE
        );
    }

    #[test]
    fn test_hook_rewrite_sets_modified_class() {
        let (mut engine, _) = engine_with(200);
        engine.downstream.add(
            "upper",
            "test",
            Arc::new(|t: &str| Some(t.to_uppercase())),
        );

        let line = engine.process_downstream("orc").unwrap();
        assert_eq!(line.text, "ORC");
        assert!(line.classes & class::MODIFIED_NARRATIVE != 0);
    }

    #[test]
    fn test_suppressed_line_not_emitted() {
        let (mut engine, buffer) = engine_with(200);
        engine
            .downstream
            .add("gag", "test", Arc::new(|_: &str| None));

        assert!(engine.process_downstream("secret text").is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_irreparable_line_dropped_silently() {
        let (mut engine, _) = engine_with(200);
        assert!(engine.process_downstream("</output>leftover text").is_none());
    }

    #[test]
    fn test_upstream_discard() {
        let (engine, _) = engine_with(200);
        engine
            .upstream
            .add("block", "test", Arc::new(|_: &str| None));

        assert_eq!(engine.process_upstream("kill orc"), None);
    }

    #[test]
    fn test_extract_lines_across_fragments() {
        let (mut engine, _) = engine_with(200);

        assert!(engine.extract_lines(b"Hello wo").is_empty());
        assert_eq!(
            engine.extract_lines(b"rld\r\nnext line\r\ntail"),
            vec!["Hello world", "next line"]
        );
        assert_eq!(engine.extract_lines(b"\n"), vec!["tail"]);
    }

    #[tokio::test]
    async fn test_run_bridges_server_and_client() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket
                .write_all(
                    b"<pushStream id=\"combat\"/>\r\nOrc hits you for 5 damage!\r\n<prompt/>\r\n",
                )
                .await
                .unwrap();

            // 讀回玩家指令
            let mut buf = vec![0u8; 64];
            let n = socket.read(&mut buf).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });

        let (mut engine, buffer) = engine_with(200);
        engine.connect(&addr.ip().to_string(), addr.port()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Open);

        let (to_client_tx, mut to_client_rx) = mpsc::channel(16);
        let (from_client_tx, from_client_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let link = ClientLink {
            to_client: to_client_tx,
            from_client: from_client_rx,
        };
        let run = tokio::spawn(engine.run(link, shutdown_rx));

        let first = to_client_rx.recv().await.unwrap();
        let second = to_client_rx.recv().await.unwrap();
        let third = to_client_rx.recv().await.unwrap();
        assert_eq!(first, r#"<pushStream id="combat"/>"#);
        assert_eq!(second, "Orc hits you for 5 damage!");
        assert_eq!(third, r#"<popStream id="combat"/><prompt/>"#);
        assert_eq!(buffer.len(), 3);

        from_client_tx.send("kill orc".to_string()).await.unwrap();
        let received = server.await.unwrap();
        assert_eq!(received, "kill orc\r\n");

        // 伺服器端此時可能已先關閉連線而結束迴圈
        let _ = shutdown_tx.send(()).await;
        run.await.unwrap().unwrap();
    }
}
