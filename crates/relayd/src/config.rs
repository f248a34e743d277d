//! 設定檔模組
//!
//! 連線主機、監聽埠、緩衝區保留量等由設定檔提供，
//! 核心程式庫本身不讀任何檔案。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// 遊戲伺服器連線資訊
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameConfig {
    pub host: String,
    pub port: u16,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8900,
        }
    }
}

/// 中繼服務設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// 遊戲伺服器
    #[serde(default)]
    pub game: GameConfig,
    /// 本機前端連入的監聽埠
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// 廣播緩衝區保留行數
    #[serde(default = "default_retention")]
    pub retention: usize,
    /// 原始線路傾印檔路徑（未設定則不傾印）
    #[serde(default)]
    pub wire_log: Option<PathBuf>,
}

fn default_listen_port() -> u16 {
    8000
}

fn default_retention() -> usize {
    200
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            game: GameConfig::default(),
            listen_port: default_listen_port(),
            retention: default_retention(),
            wire_log: None,
        }
    }
}

impl RelayConfig {
    /// 設定檔路徑
    pub fn config_path() -> PathBuf {
        config_dir().join("config.json")
    }

    /// 從檔案載入設定；不存在或損毀時退回預設值
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(config) = serde_json::from_str(&content) {
                    return config;
                }
                tracing::warn!("設定檔損毀，改用預設值: {:?}", path);
            }
        }
        Self::default()
    }

    /// 儲存設定到檔案
    pub fn save(&self) -> Result<(), std::io::Error> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&path, content)?;
        Ok(())
    }
}

/// 獲取設定目錄
pub fn config_dir() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        config_dir.join("mudrelay")
    } else {
        PathBuf::from(".")
    }
}
