pub mod history;

pub use history::{RunHistoryQuery, RunHistoryResponse};
