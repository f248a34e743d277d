//! 線路除錯日誌
//!
//! 可選的原始線路傾印：啟用後把每段收送的位元組以十六進位
//! 加可讀預覽寫進檔案，供排查協定缺陷。未啟用時為無操作。

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

lazy_static::lazy_static! {
    static ref WIRE_LOGGER: Mutex<Option<WireLogger>> = Mutex::new(None);
}

pub struct WireLogger {
    file: File,
}

impl WireLogger {
    /// 啟用線路日誌；建檔失敗則維持停用
    pub fn init(path: PathBuf) {
        if let Ok(file) = File::create(path) {
            let mut logger = WIRE_LOGGER.lock().unwrap();
            *logger = Some(WireLogger { file });
        }
    }

    pub fn is_enabled() -> bool {
        WIRE_LOGGER.lock().unwrap().is_some()
    }

    pub fn log(msg: &str) {
        let mut logger = WIRE_LOGGER.lock().unwrap();
        if let Some(l) = logger.as_mut() {
            let _ = writeln!(l.file, "[{}] {}", timestamp_millis(), msg);
        }
    }

    /// 傾印一段位元組：十六進位 + 可讀預覽
    pub fn log_bytes(direction: &str, bytes: &[u8]) {
        if !Self::is_enabled() {
            return;
        }
        let hex = bytes
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ");
        let preview: String = bytes
            .iter()
            .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
            .collect();
        Self::log(&format!("{} [{}] |{}|", direction, hex, preview));
    }
}

fn timestamp_millis() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}
