//! 廣播緩衝區模組
//!
//! 有界、共享、有序的行日誌：連線引擎在尾端發佈，
//! 任意數量的腳本執行緒各持獨立游標與訂閱遮罩讀取。
//! 所有讀者看到的都是同一個全域發佈順序（只會因遮罩不同而取子序列）。

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};

use thiserror::Error;
use tracing::debug;

/// 串流類別位元遮罩
pub mod class {
    /// 去除標記後的敘事純文字
    pub const STRIPPED_NARRATIVE: u32 = 1;
    /// 帶原始標記的敘事文字
    pub const RAW_NARRATIVE: u32 = 2;
    /// 經掛鉤改寫過的敘事文字
    pub const MODIFIED_NARRATIVE: u32 = 4;
    /// 指令回顯
    pub const COMMAND_ECHO: u32 = 8;
    /// 腳本輸出
    pub const SCRIPT_OUTPUT: u32 = 16;
    /// 全部類別
    pub const ALL: u32 = STRIPPED_NARRATIVE
        | RAW_NARRATIVE
        | MODIFIED_NARRATIVE
        | COMMAND_ECHO
        | SCRIPT_OUTPUT;
}

/// 緩衝區操作錯誤
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("訂閱遮罩無效: {0:#b}")]
    InvalidMask(u32),

    #[error("未知的訂閱者")]
    UnknownConsumer,
}

/// 一條已發佈的行：內容發佈後不再變動
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// 行文字
    pub text: String,
    /// 所屬串流類別（位元遮罩）
    pub classes: u32,
}

impl Line {
    pub fn new(text: impl Into<String>, classes: u32) -> Self {
        Self {
            text: text.into(),
            classes,
        }
    }
}

/// 訂閱者識別碼（由 `subscribe` 發出，取代以執行緒身分為鍵的隱式對應）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsumerId(u64);

#[derive(Debug)]
struct ConsumerState {
    /// 下一條要讀的絕對序號
    cursor: u64,
    /// 訂閱遮罩
    mask: u32,
    /// 因淘汰而被跳過的行數
    lost: u64,
}

#[derive(Debug, Default)]
struct BufferInner {
    lines: VecDeque<Line>,
    /// 佇列頭的絕對序號
    base: u64,
    consumers: HashMap<ConsumerId, ConsumerState>,
    next_id: u64,
}

/// 廣播緩衝區
///
/// 單一互斥鎖保護尾端、基準位移與游標表；鎖只在 O(1) 更新時持有，
/// 等待新資料一律透過條件變數，不佔鎖。
#[derive(Debug)]
pub struct BroadcastBuffer {
    inner: Mutex<BufferInner>,
    readable: Condvar,
    capacity: usize,
}

impl BroadcastBuffer {
    /// 建立保留上限為 `capacity` 條的緩衝區
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner::default()),
            readable: Condvar::new(),
            capacity,
        }
    }

    /// 發佈一條行到尾端；超出保留上限時自頭端淘汰
    pub fn publish(&self, line: Line) {
        let mut inner = self.inner.lock().unwrap();
        inner.lines.push_back(line);
        while inner.lines.len() > self.capacity {
            inner.lines.pop_front();
            inner.base += 1;
        }
        self.readable.notify_all();
    }

    /// 註冊新訂閱者，游標自目前尾端開始
    pub fn subscribe(&self, mask: u32) -> Result<ConsumerId, BufferError> {
        validate_mask(mask)?;
        let mut inner = self.inner.lock().unwrap();
        let id = ConsumerId(inner.next_id);
        inner.next_id += 1;
        let cursor = inner.base + inner.lines.len() as u64;
        inner.consumers.insert(
            id,
            ConsumerState {
                cursor,
                mask,
                lost: 0,
            },
        );
        Ok(id)
    }

    /// 阻塞讀取下一條符合訂閱遮罩的行
    ///
    /// 游標落後於基準位移時會先向前夾取（被淘汰的行靜默跳過，
    /// 計入 `lost`）。不符遮罩的行游標照樣前進但不返回。
    pub fn read(&self, id: ConsumerId) -> Result<Line, BufferError> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match Self::take_next(&mut inner, id)? {
                Some(line) => return Ok(line),
                None => {
                    inner = self.readable.wait(inner).unwrap();
                }
            }
        }
    }

    /// 非阻塞讀取：游標已追上尾端時返回 `None`
    pub fn read_nonblocking(&self, id: ConsumerId) -> Result<Option<Line>, BufferError> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_next(&mut inner, id)
    }

    /// 讀出並消耗目前所有符合遮罩的行（不阻塞）
    pub fn drain(&self, id: ConsumerId) -> Result<Vec<Line>, BufferError> {
        let mut inner = self.inner.lock().unwrap();
        let mut lines = Vec::new();
        while let Some(line) = Self::take_next(&mut inner, id)? {
            lines.push(line);
        }
        Ok(lines)
    }

    /// 將游標重設到目前基準位移（忘掉歷史，從最舊的保留行重讀）
    pub fn rewind(&self, id: ConsumerId) -> Result<(), BufferError> {
        let mut inner = self.inner.lock().unwrap();
        let base = inner.base;
        let state = inner
            .consumers
            .get_mut(&id)
            .ok_or(BufferError::UnknownConsumer)?;
        state.cursor = base;
        Ok(())
    }

    /// 更新訂閱遮罩
    pub fn set_subscription(&self, id: ConsumerId, mask: u32) -> Result<(), BufferError> {
        validate_mask(mask)?;
        let mut inner = self.inner.lock().unwrap();
        let state = inner
            .consumers
            .get_mut(&id)
            .ok_or(BufferError::UnknownConsumer)?;
        state.mask = mask;
        Ok(())
    }

    /// 因淘汰而被跳過的行數（明確的「落差偵測」查詢）
    pub fn lost(&self, id: ConsumerId) -> Result<u64, BufferError> {
        let inner = self.inner.lock().unwrap();
        inner
            .consumers
            .get(&id)
            .map(|s| s.lost)
            .ok_or(BufferError::UnknownConsumer)
    }

    /// 釋放訂閱者的登記項；擁有它的執行脈絡結束後必須呼叫，否則洩漏
    pub fn forget(&self, id: ConsumerId) {
        let mut inner = self.inner.lock().unwrap();
        inner.consumers.remove(&id);
    }

    /// 目前保留的行數
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 佇列頭的絕對序號
    pub fn base_offset(&self) -> u64 {
        self.inner.lock().unwrap().base
    }

    /// 在鎖內向前掃描：返回下一條符合遮罩的行，追上尾端則返回 `None`
    fn take_next(
        inner: &mut BufferInner,
        id: ConsumerId,
    ) -> Result<Option<Line>, BufferError> {
        let BufferInner {
            lines,
            base,
            consumers,
            ..
        } = inner;
        let base = *base;
        let len = lines.len() as u64;
        let state = consumers
            .get_mut(&id)
            .ok_or(BufferError::UnknownConsumer)?;

        if state.cursor < base {
            let skipped = base - state.cursor;
            state.lost += skipped;
            state.cursor = base;
            debug!("訂閱者落後保留窗口，向前夾取 {} 行", skipped);
        }

        while state.cursor < base + len {
            let idx = (state.cursor - base) as usize;
            let line = &lines[idx];
            state.cursor += 1;
            if line.classes & state.mask != 0 {
                return Ok(Some(line.clone()));
            }
        }
        Ok(None)
    }
}

fn validate_mask(mask: u32) -> Result<(), BufferError> {
    if mask == 0 || mask & !class::ALL != 0 {
        return Err(BufferError::InvalidMask(mask));
    }
    Ok(())
}
