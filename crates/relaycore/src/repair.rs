//! 協定修復模組
//!
//! 伺服器送來的標記流偶爾帶有已知缺陷：屬性值內嵌同種引號、
//! 裸露的 `&`、CP1252 漏出的控制位元組、跨行被截斷的串流標籤。
//! 本模組以無狀態的啟發式逐行修復，讓後續解析不致中斷。

use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

/// 已知會「開了不關」跨行送達的串流標籤
const STREAMING_TAGS: &[&str] = &["output", "style", "spell"];

lazy_static! {
    /// 合法實體參照（`&` 之後的部分）
    static ref ENTITY_RE: Regex = Regex::new(r"^([A-Za-z][A-Za-z0-9]*|#[0-9]+);").unwrap();
}

/// 判斷引號是否為「合法收尾」：其後是空白、`/`、`>` 或標籤結尾
fn quote_closes(next: Option<char>) -> bool {
    matches!(next, None | Some(' ') | Some('\t') | Some('/') | Some('>'))
}

/// 輕量檢查一行是否已可安全解析
///
/// 檢查三類缺陷：屬性值內嵌同種引號、未轉義的 `&` 與殘留控制位元組、
/// 串流標籤開閉不平衡。未在行內收尾的標籤（封包切割）不視為缺陷。
pub fn check_markup(line: &str) -> bool {
    let chars: Vec<char> = line.chars().collect();
    let mut in_tag = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if c == '\u{7}' || c == '\u{92}' {
            return false;
        }

        if !in_tag {
            if c == '<' {
                in_tag = true;
            } else if c == '&' {
                let rest: String = chars[i + 1..].iter().collect();
                if !ENTITY_RE.is_match(&rest) {
                    return false;
                }
            }
            i += 1;
            continue;
        }

        // 標籤內部
        match c {
            '>' => in_tag = false,
            '&' => {
                let rest: String = chars[i + 1..].iter().collect();
                if !ENTITY_RE.is_match(&rest) {
                    return false;
                }
            }
            '=' if matches!(chars.get(i + 1), Some('\'') | Some('"')) => {
                let q = chars[i + 1];
                let mut j = i + 2;
                loop {
                    match chars.get(j) {
                        None => break, // 行尾截斷，交由串流標籤邏輯
                        Some(&ch) if ch == q => {
                            if quote_closes(chars.get(j + 1).copied()) {
                                break;
                            }
                            return false; // 內嵌同種引號
                        }
                        Some(_) => j += 1,
                    }
                }
                i = j;
            }
            _ => {}
        }
        i += 1;
    }

    for kind in STREAMING_TAGS {
        if count_opens(line, kind) != count_closes(line, kind) {
            return false;
        }
    }

    true
}

/// 修復屬性值內嵌的同種引號（轉義為 `&apos;` / `&quot;`）
pub fn fix_nested_quotes(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];

        if !in_tag {
            if c == '<' {
                in_tag = true;
            }
            out.push(c);
            i += 1;
            continue;
        }

        if c == '>' {
            in_tag = false;
            out.push(c);
            i += 1;
            continue;
        }

        if c == '=' && matches!(chars.get(i + 1), Some('\'') | Some('"')) {
            let q = chars[i + 1];
            out.push('=');
            out.push(q);
            let mut j = i + 2;
            loop {
                match chars.get(j) {
                    None => break,
                    Some(&ch) if ch == q => {
                        if quote_closes(chars.get(j + 1).copied()) {
                            out.push(q);
                            j += 1;
                            break;
                        }
                        // 內嵌引號：轉義後繼續掃描
                        out.push_str(if q == '\'' { "&apos;" } else { "&quot;" });
                        j += 1;
                    }
                    Some(&ch) => {
                        out.push(ch);
                        j += 1;
                    }
                }
            }
            i = j;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

/// 修復非法字元：裸露的 `&`、殘留的 BEL、CP1252 漏出的 0x92 撇號
pub fn fix_invalid_chars(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\u{7}' => {} // 直接剝除
            '\u{92}' => out.push('’'),
            '&' => {
                let rest: String = chars[i + 1..].iter().collect();
                if ENTITY_RE.is_match(&rest) {
                    out.push('&');
                } else {
                    out.push_str("&amp;");
                }
            }
            c => out.push(c),
        }
        i += 1;
    }

    out
}

/// 修復開閉不平衡的串流標籤
///
/// 只開不關的在行尾補上結尾標籤；整行只剩一個落單結尾標籤的
/// （封包切割的殘渣）改寫為空行，呼叫端視同丟棄。
pub fn fix_unbalanced_tags(line: &str) -> String {
    let trimmed = line.trim();
    for kind in STREAMING_TAGS {
        if trimmed == format!("</{}>", kind) {
            return String::new();
        }
    }

    let mut out = line.to_string();
    for kind in STREAMING_TAGS {
        let opens = count_opens(&out, kind);
        let closes = count_closes(&out, kind);
        for _ in closes..opens {
            out.push_str(&format!("</{}>", kind));
        }
    }
    out
}

/// 計算指定標籤的「開啟」次數（不含自閉合）
fn count_opens(line: &str, kind: &str) -> usize {
    let pattern = format!("<{}", kind);
    let mut count = 0;
    let mut start = 0;
    while let Some(pos) = line[start..].find(&pattern) {
        let abs = start + pos;
        let after = abs + pattern.len();
        // 確認標籤名稱到此為止（避免 <style 誤配 <styleX）
        let boundary = matches!(
            line[after..].chars().next(),
            None | Some(' ') | Some('\t') | Some('>') | Some('/')
        );
        if boundary {
            // 找到標籤結尾，自閉合（.../>）不算開啟
            match line[after..].find('>') {
                Some(end) => {
                    let inner = &line[after..after + end];
                    if !inner.trim_end().ends_with('/') {
                        count += 1;
                    }
                }
                None => count += 1, // 行尾未收的開標籤
            }
        }
        start = abs + pattern.len();
    }
    count
}

/// 計算指定標籤的「結尾」次數
fn count_closes(line: &str, kind: &str) -> usize {
    line.matches(&format!("</{}>", kind)).count()
}

/// 修復一行協定文字
///
/// 已可解析的行原樣返回。否則依固定順序套用各類修復，
/// 每修復一類就重新檢查一次；全部套用後仍不可解析則返回
/// `None`，由呼叫端記錄並丟棄（保住後續行的完整性優先於搶救這一行）。
pub fn repair(line: &str) -> Option<String> {
    if check_markup(line) {
        return Some(line.to_string());
    }

    let passes: [fn(&str) -> String; 3] = [fix_nested_quotes, fix_invalid_chars, fix_unbalanced_tags];

    let mut fixed = line.to_string();
    for pass in passes {
        let out = pass(&fixed);
        if out != fixed {
            debug!("套用協定修復: {:?} -> {:?}", fixed, out);
            fixed = out;
        }
        if check_markup(&fixed) {
            return Some(fixed);
        }
    }

    debug!("無法修復的協定行，丟棄: {:?}", line);
    None
}

/// 移除標記，還原純文字（常用實體一併解碼）
pub fn strip_tags(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_tag = false;

    for c in line.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }

    out.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wellformed_line_unchanged() {
        let line = r#"<pushStream id="combat"/>You swing at the orc!"#;
        assert_eq!(repair(line).as_deref(), Some(line));
    }

    #[test]
    fn test_repair_is_idempotent() {
        let line = "He said 'hi' & left <output class=\"mono\">";
        let once = repair(line).unwrap();
        let twice = repair(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_nested_single_quotes_escaped() {
        let line = "<preset id='he said 'hi''>text</preset>";
        let fixed = fix_nested_quotes(line);
        assert_eq!(fixed, "<preset id='he said &apos;hi&apos;'>text</preset>");
        assert!(check_markup(&fixed));
    }

    #[test]
    fn test_nested_double_quotes_escaped() {
        let line = r#"<d cmd="say "yes"">ok</d>"#;
        let fixed = fix_nested_quotes(line);
        assert_eq!(fixed, r#"<d cmd="say &quot;yes&quot;">ok</d>"#);
    }

    #[test]
    fn test_bare_ampersand_escaped() {
        assert_eq!(fix_invalid_chars("salt & pepper"), "salt &amp; pepper");
        // 已是實體的不得再轉義
        assert_eq!(fix_invalid_chars("salt &amp; pepper"), "salt &amp; pepper");
        assert_eq!(fix_invalid_chars("&#39;"), "&#39;");
    }

    #[test]
    fn test_control_chars_fixed() {
        assert_eq!(fix_invalid_chars("ding\u{7}!"), "ding!");
        assert_eq!(fix_invalid_chars("the orc\u{92}s club"), "the orc’s club");
    }

    #[test]
    fn test_unclosed_streaming_tag_gets_close() {
        let fixed = fix_unbalanced_tags("<output class=\"mono\">table text");
        assert_eq!(fixed, "<output class=\"mono\">table text</output>");
        assert!(check_markup(&fixed));
    }

    #[test]
    fn test_selfclosing_tag_needs_no_close() {
        let line = "<output class=\"mono\"/>";
        assert_eq!(fix_unbalanced_tags(line), line);
        assert!(check_markup(line));
    }

    #[test]
    fn test_dangling_close_tag_discarded() {
        assert_eq!(fix_unbalanced_tags("</output>"), "");
        assert_eq!(repair("</output>").as_deref(), Some(""));
    }

    #[test]
    fn test_irreparable_line_dropped() {
        // 落單的結尾標籤後面還跟著文字，無從判斷歸屬
        assert_eq!(repair("</output>leftover text"), None);
    }

    #[test]
    fn test_strip_tags() {
        assert_eq!(
            strip_tags(r#"<pushStream id="combat"/>Orc hits you!<popStream/>"#),
            "Orc hits you!"
        );
        assert_eq!(strip_tags("salt &amp; pepper"), "salt & pepper");
        assert_eq!(strip_tags("no markup"), "no markup");
    }
}
