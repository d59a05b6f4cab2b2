pub mod analysis;
pub mod backend;
pub mod backup;
pub mod cli;
pub mod config;
pub mod contacts;
pub mod db;
pub mod migrate;
pub mod probe;
pub mod rls;
pub mod sql;
pub mod storage;

pub use db::DbPool;
