pub mod agent;
pub mod config;
pub mod error;
pub mod ledger;
pub mod run;
pub mod server;
pub mod shutdown;
pub mod variant;
pub mod workspace;
