//! Infrastructure layer: stores, transaction scope, configuration.

pub mod config;
pub mod issuance;
pub mod service;
pub mod store;

mod integration_tests;

pub use config::ServiceConfig;
pub use issuance::allocate_issue;
pub use service::StockService;
pub use store::{
    InMemoryStockStore, LotStore, MovementLedger, PostgresStockStore, PostgresTransaction, StockTransaction,
    StoreError, TransactionSource,
};
