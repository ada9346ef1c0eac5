pub mod background;
pub mod batch;
pub mod config;
pub mod contracts;
pub mod gas;
pub mod liquidity;
pub mod orchestrator;
pub mod portfolio;
pub mod pricing;
pub mod recipients;
pub mod report;
pub mod rpc;
pub mod tokens;
