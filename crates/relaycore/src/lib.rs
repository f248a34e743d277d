//! Relay Core Library
//!
//! 提供腳本中繼的核心功能：
//! - `repair`: 協定行修復啟發式
//! - `buffer`: 多訂閱者廣播緩衝區
//! - `hooks`: 下行/上行掛鉤鏈
//! - `engine`: 連線引擎與區段平衡
//! - `encoding`: Windows-1252 線路編解碼
//! - `debug_log`: 原始線路傾印

pub mod buffer;
pub mod debug_log;
pub mod encoding;
pub mod engine;
pub mod hooks;
pub mod repair;

pub use buffer::{class, BroadcastBuffer, BufferError, ConsumerId, Line};
pub use encoding::{decode_wire, encode_wire};
pub use engine::region::RegionBalancer;
pub use engine::{ClientLink, ConnectionEngine, EngineConfig, EngineError, EngineState};
pub use hooks::{HookChain, HookFn};
