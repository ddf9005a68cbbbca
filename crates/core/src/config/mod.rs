//! 配置管理
//!
//! 加载顺序：内置默认值 → TOML配置文件 → `TASKHUB_` 前缀环境变量

pub mod models;

pub use models::*;
