pub mod binance;
pub mod deepseek;
pub mod mock;
pub mod paper;
pub mod persistence;
pub mod snapshot_feed;
pub mod state_files;
pub mod telegram;
