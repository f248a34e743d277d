//! 掛鉤鏈模組
//!
//! 具名、有序的文字轉換管線。下行鏈改寫伺服器送往客戶端
//! （與廣播緩衝區）的文字；上行鏈改寫玩家即將送往伺服器的指令。
//! 單一掛鉤故障只移除該掛鉤，不中斷整條管線。

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::warn;

/// 掛鉤函數：返回 `None` 表示「抑制此行」，後續掛鉤不再執行
pub type HookFn = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

struct HookEntry {
    source: String,
    func: HookFn,
}

#[derive(Default)]
struct HookTable {
    hooks: HashMap<String, HookEntry>,
    /// 註冊順序即執行順序
    order: Vec<String>,
}

/// 掛鉤鏈
///
/// `add`/`remove` 可能來自任何腳本執行緒，與連線執行緒上的 `run`
/// 並行；`run` 開跑前先快照整張表，之後的增刪不影響本輪。
pub struct HookChain {
    /// 診斷用標籤（"downstream" / "upstream"）
    label: &'static str,
    inner: Mutex<HookTable>,
}

impl HookChain {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            inner: Mutex::new(HookTable::default()),
        }
    }

    /// 註冊掛鉤；同名覆寫（保留原本的執行順位），並記錄來源供診斷
    pub fn add(&self, name: impl Into<String>, source: impl Into<String>, func: HookFn) {
        let name = name.into();
        let mut table = self.inner.lock().unwrap();
        if !table.hooks.contains_key(&name) {
            table.order.push(name.clone());
        }
        table.hooks.insert(
            name,
            HookEntry {
                source: source.into(),
                func,
            },
        );
    }

    /// 移除掛鉤；存在則返回 `true`
    pub fn remove(&self, name: &str) -> bool {
        let mut table = self.inner.lock().unwrap();
        table.order.retain(|n| n != name);
        table.hooks.remove(name).is_some()
    }

    /// 依註冊順序列出掛鉤名稱
    pub fn list(&self) -> Vec<String> {
        self.inner.lock().unwrap().order.clone()
    }

    /// 列出（名稱, 來源）供營運診斷
    pub fn sources(&self) -> Vec<(String, String)> {
        let table = self.inner.lock().unwrap();
        table
            .order
            .iter()
            .filter_map(|name| {
                table
                    .hooks
                    .get(name)
                    .map(|e| (name.clone(), e.source.clone()))
            })
            .collect()
    }

    /// 將來源表渲染為對齊的文字表格
    pub fn render_sources(&self) -> String {
        let sources = self.sources();
        let width = sources.iter().map(|(n, _)| n.len()).max().unwrap_or(4);
        let mut out = format!("{:<width$}  source\n", "hook", width = width);
        for (name, source) in sources {
            out.push_str(&format!("{:<width$}  {}\n", name, source, width = width));
        }
        out
    }

    /// 依序套用所有掛鉤，前一個的輸出是後一個的輸入
    ///
    /// 掛鉤發生 panic 時：捕捉、自表中除名、發出警告，然後以
    /// 故障前的文字繼續執行其餘掛鉤。掛鉤返回 `None` 時：立即
    /// 停止並返回 `None`（此行被抑制）。
    pub fn run(&self, text: &str) -> Option<String> {
        let snapshot: Vec<(String, HookFn)> = {
            let table = self.inner.lock().unwrap();
            table
                .order
                .iter()
                .filter_map(|name| {
                    table
                        .hooks
                        .get(name)
                        .map(|e| (name.clone(), Arc::clone(&e.func)))
                })
                .collect()
        };

        let mut current = text.to_string();
        let mut failed: Vec<String> = Vec::new();

        for (name, func) in snapshot {
            let result = panic::catch_unwind(AssertUnwindSafe(|| func(&current)));
            match result {
                Ok(Some(next)) => current = next,
                Ok(None) => {
                    self.deregister_failed(&failed);
                    return None;
                }
                Err(_) => {
                    warn!("{} 掛鉤 '{}' 執行失敗，已自管線移除", self.label, name);
                    failed.push(name);
                    // 以故障前的文字繼續
                }
            }
        }

        self.deregister_failed(&failed);
        Some(current)
    }

    fn deregister_failed(&self, failed: &[String]) {
        for name in failed {
            self.remove(name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook(f: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> HookFn {
        Arc::new(f)
    }

    #[test]
    fn test_hooks_run_in_registration_order() {
        let chain = HookChain::new("downstream");
        chain.add("a", "test", hook(|t| Some(format!("{}a", t))));
        chain.add("b", "test", hook(|t| Some(format!("{}b", t))));
        chain.add("c", "test", hook(|t| Some(format!("{}c", t))));

        assert_eq!(chain.run("x").as_deref(), Some("xabc"));
    }

    #[test]
    fn test_same_name_overwrites_keeping_order() {
        let chain = HookChain::new("downstream");
        chain.add("first", "s1", hook(|t| Some(format!("{}1", t))));
        chain.add("second", "s1", hook(|t| Some(format!("{}2", t))));
        chain.add("first", "s2", hook(|t| Some(format!("{}X", t))));

        assert_eq!(chain.list(), vec!["first", "second"]);
        assert_eq!(chain.run("").as_deref(), Some("X2"));
        assert_eq!(
            chain.sources(),
            vec![
                ("first".to_string(), "s2".to_string()),
                ("second".to_string(), "s1".to_string())
            ]
        );
    }

    #[test]
    fn test_panicking_hook_is_isolated_and_removed() {
        let chain = HookChain::new("downstream");
        chain.add("one", "test", hook(|t| Some(format!("{}1", t))));
        chain.add("two", "test", hook(|_| panic!("boom")));
        chain.add("three", "test", hook(|t| Some(format!("{}3", t))));

        // 故障掛鉤如同不存在：輸出等於只跑 1 與 3
        assert_eq!(chain.run("x").as_deref(), Some("x13"));
        assert_eq!(chain.list(), vec!["one", "three"]);

        // 下一輪不再觸發故障
        assert_eq!(chain.run("y").as_deref(), Some("y13"));
    }

    #[test]
    fn test_none_suppresses_and_short_circuits() {
        let chain = HookChain::new("upstream");
        let ran_third = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&ran_third);

        chain.add("one", "test", hook(|t| Some(t.to_string())));
        chain.add("gag", "test", hook(|_| None));
        chain.add("three", "test", hook(move |t| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            Some(t.to_string())
        }));

        assert_eq!(chain.run("kill orc"), None);
        assert!(!ran_third.load(std::sync::atomic::Ordering::SeqCst));
        // 抑制不等於故障，掛鉤仍在表中
        assert_eq!(chain.list(), vec!["one", "gag", "three"]);
    }

    #[test]
    fn test_remove_and_list() {
        let chain = HookChain::new("downstream");
        chain.add("a", "s", hook(|t| Some(t.to_string())));
        assert!(chain.remove("a"));
        assert!(!chain.remove("a"));
        assert!(chain.list().is_empty());
    }

    #[test]
    fn test_render_sources_table() {
        let chain = HookChain::new("downstream");
        chain.add("mapper", "map.lua", hook(|t| Some(t.to_string())));
        let table = chain.render_sources();
        assert!(table.contains("mapper"));
        assert!(table.contains("map.lua"));
    }

    #[test]
    fn test_run_on_empty_chain_is_identity() {
        let chain = HookChain::new("downstream");
        assert_eq!(chain.run("unchanged").as_deref(), Some("unchanged"));
    }
}
