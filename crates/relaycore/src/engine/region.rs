//! 區段平衡模組
//!
//! 伺服器有時只送出區段的開啟標記（`<pushStream id="combat"/>`），
//! 對應的關閉標記卻在多個封包之後才來、甚至永遠不來。本模組追蹤
//! 已知會如此的區段種類，遇到自然終結標記（提示符、清流、元件）
//! 時在其前方補上缺少的關閉標記，並合併來回開關的冗餘對。

use tracing::debug;

/// 已知會不平衡送達的區段種類
const TRACKED_REGIONS: &[&str] = &["combat", "atmospherics"];

/// 區段的自然終結標記：出現時所有串流區段都隱含結束
const TERMINATORS: &[&str] = &["<prompt", "<clearStream", "<component"];

/// 堆疊項：追蹤種類記名，其餘區段以匿名佔位維持巢狀深度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenRegion {
    Tracked(&'static str),
    Other,
}

/// 每條連線一份的區段平衡狀態，不跨連線共享
#[derive(Debug, Default)]
pub struct RegionBalancer {
    /// 尚未關閉的區段（巢狀順序）
    open: Vec<OpenRegion>,
    /// 區段跨越片段邊界仍然開著
    carried: bool,
}

impl RegionBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 目前仍開著的追蹤區段數
    pub fn open_regions(&self) -> usize {
        self.open
            .iter()
            .filter(|r| matches!(r, OpenRegion::Tracked(_)))
            .count()
    }

    /// 是否有區段跨片段邊界未關
    pub fn is_carried(&self) -> bool {
        self.carried
    }

    /// 平衡一行：補上缺少的關閉標記、合併冗餘的開關對
    pub fn balance(&mut self, line: &str) -> String {
        let line = collapse_pairs(line);
        let mut out = String::with_capacity(line.len());
        let mut rest = line.as_str();

        while let Some(event) = next_event(rest) {
            let (pos, kind) = event;
            out.push_str(&rest[..pos]);
            rest = &rest[pos..];

            match kind {
                Event::Push(region) => {
                    let tag_len = tag_end(rest);
                    out.push_str(&rest[..tag_len]);
                    rest = &rest[tag_len..];
                    self.open.push(region);
                }
                Event::Pop => {
                    let tag_len = tag_end(rest);
                    out.push_str(&rest[..tag_len]);
                    rest = &rest[tag_len..];
                    self.open.pop();
                }
                Event::Terminator(marker) => {
                    // 終結標記前補上所有缺少的關閉，內層先關
                    for region in self.open.drain(..).rev() {
                        if let OpenRegion::Tracked(name) = region {
                            debug!("於終結標記前補上 <popStream id=\"{}\"/>", name);
                            out.push_str(&format!("<popStream id=\"{}\"/>", name));
                        }
                    }
                    out.push_str(marker);
                    rest = &rest[marker.len()..];
                }
            }
        }

        out.push_str(rest);
        self.carried = !self.open.is_empty();
        out
    }
}

enum Event {
    Push(OpenRegion),
    Pop,
    Terminator(&'static str),
}

/// 找出剩餘文字中最早出現的事件
fn next_event(rest: &str) -> Option<(usize, Event)> {
    let mut best: Option<(usize, Event)> = None;

    let mut consider = |pos: Option<usize>, event: Event| {
        if let Some(p) = pos {
            if best.as_ref().map_or(true, |(bp, _)| p < *bp) {
                best = Some((p, event));
            }
        }
    };

    if let Some(p) = rest.find("<pushStream") {
        let region = TRACKED_REGIONS
            .iter()
            .find(|k| {
                rest[p..].starts_with(&format!("<pushStream id=\"{}\"", k))
                    || rest[p..].starts_with(&format!("<pushStream id='{}'", k))
            })
            .map(|k| OpenRegion::Tracked(k))
            .unwrap_or(OpenRegion::Other);
        consider(Some(p), Event::Push(region));
    }
    consider(rest.find("<popStream"), Event::Pop);
    for marker in TERMINATORS {
        consider(rest.find(marker), Event::Terminator(marker));
    }

    best
}

/// 標籤自目前位置起的長度（到第一個 `>` 為止；行尾截斷則到行尾）
fn tag_end(rest: &str) -> usize {
    rest.find('>').map(|p| p + 1).unwrap_or(rest.len())
}

/// 合併背靠背的冗餘開關對
///
/// `關+開` 同種區段表示串流其實沒斷，`開+關` 是空區段，兩者都消去。
fn collapse_pairs(line: &str) -> String {
    let mut out = line.to_string();
    loop {
        let before = out.len();
        for kind in TRACKED_REGIONS {
            for quote in ['"', '\''] {
                let push = format!("<pushStream id={q}{k}{q}/>", q = quote, k = kind);
                out = out.replace(&format!("<popStream/>{}", push), "");
                out = out.replace(&format!("{}<popStream/>", push), "");
            }
        }
        if out.len() == before {
            return out;
        }
    }
}
