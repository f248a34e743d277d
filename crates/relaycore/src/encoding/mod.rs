//! 線路編碼模組
//!
//! 遊戲伺服器的線路編碼是 Windows-1252（而非 UTF-8），彎引號、
//! 破折號等落在 0x80–0x9F 區段。集中在這裡轉換，其餘模組一律
//! 只處理 UTF-8 字串。

use encoding_rs::WINDOWS_1252;

/// 將線路位元組解碼為 UTF-8 字串
///
/// 無法對映的位元組以 U+FFFD 取代，不會失敗。
pub fn decode_wire(data: &[u8]) -> String {
    let (decoded, _, _) = WINDOWS_1252.decode(data);
    decoded.into_owned()
}

/// 將 UTF-8 字串編碼為線路位元組
///
/// Windows-1252 表達不了的字元由 encoding_rs 以數值實體替代。
pub fn encode_wire(text: &str) -> Vec<u8> {
    let (encoded, _, _) = WINDOWS_1252.encode(text);
    encoded.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_roundtrip() {
        let text = "look at the orc";
        assert_eq!(decode_wire(text.as_bytes()), text);
        assert_eq!(encode_wire(text), text.as_bytes());
    }

    #[test]
    fn test_decode_smart_quote() {
        // 0x92 是 CP1252 的右單引號
        assert_eq!(decode_wire(&[0x92]), "\u{2019}");
        assert_eq!(decode_wire(b"the orc\x92s club"), "the orc\u{2019}s club");
    }

    #[test]
    fn test_decode_accented_letter() {
        assert_eq!(decode_wire(&[0xE9]), "é");
        assert_eq!(encode_wire("é"), vec![0xE9]);
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode_wire(&[]), "");
    }
}
