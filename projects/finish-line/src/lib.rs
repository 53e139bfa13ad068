pub mod error;
pub mod ledger;
pub mod pipeline;
pub mod run_context;
pub mod timing;
pub mod video;
