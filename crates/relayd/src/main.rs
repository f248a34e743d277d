//! 中繼服務主程式
//!
//! 連上遊戲伺服器、在本機埠等待一個前端客戶端連入，
//! 然後以連線引擎橋接雙向流量。

mod config;

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaycore::debug_log::WireLogger;
use relaycore::{BroadcastBuffer, ClientLink, ConnectionEngine, EngineConfig, HookChain};

use config::RelayConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日誌
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = RelayConfig::load();
    if let Some(path) = &config.wire_log {
        WireLogger::init(path.clone());
        info!("線路傾印已啟用: {:?}", path);
    }

    let downstream = Arc::new(HookChain::new("downstream"));
    let upstream = Arc::new(HookChain::new("upstream"));
    let buffer = Arc::new(BroadcastBuffer::new(config.retention));

    let mut engine = ConnectionEngine::new(
        EngineConfig::default(),
        Arc::clone(&downstream),
        Arc::clone(&upstream),
        Arc::clone(&buffer),
    );
    engine.connect(&config.game.host, config.game.port).await?;

    // 等待一個前端客戶端連入
    let listener = TcpListener::bind(("127.0.0.1", config.listen_port)).await?;
    info!("等待前端客戶端連入 127.0.0.1:{}", config.listen_port);
    let (client_socket, peer) = listener.accept().await?;
    info!("前端客戶端已連入: {}", peer);

    let (client_reader, mut client_writer) = client_socket.into_split();

    let (to_client_tx, mut to_client_rx) = mpsc::channel::<String>(256);
    let (from_client_tx, from_client_rx) = mpsc::channel::<String>(256);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

    // 客戶端 → 引擎：逐行讀入玩家指令
    tokio::spawn(async move {
        let mut lines = BufReader::new(client_reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if from_client_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("前端客戶端已離線");
                    break;
                }
                Err(e) => {
                    warn!("讀取前端客戶端失敗: {}", e);
                    break;
                }
            }
        }
    });

    // 引擎 → 客戶端：轉送處理後的行
    tokio::spawn(async move {
        while let Some(text) = to_client_rx.recv().await {
            let mut data = text.into_bytes();
            data.extend_from_slice(b"\r\n");
            if client_writer.write_all(&data).await.is_err() {
                warn!("寫入前端客戶端失敗");
                break;
            }
        }
    });

    // Ctrl-C 觸發關閉
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("收到中斷信號，關閉中");
            let _ = shutdown_tx.send(()).await;
        }
    });

    let link = ClientLink {
        to_client: to_client_tx,
        from_client: from_client_rx,
    };
    if let Err(e) = engine.run(link, shutdown_rx).await {
        error!("引擎結束於錯誤: {}", e);
    }

    Ok(())
}
