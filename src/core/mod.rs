//! 核心层：引擎错误类型

pub mod error;

pub use error::EngineError;
