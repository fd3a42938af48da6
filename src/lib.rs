//! docflux - document query, projection and live-query engine
//!
//! - [`query`]: query builder, descriptor and server-side executor
//! - [`filter`]: portable to store-native filter translation
//! - [`projection`]: projections and dotted path trees
//! - [`pointer`]: pointer codec and resolution
//! - [`cache`]: TTL document cache
//! - [`hooks`]: before / after mutation hooks
//! - [`store`]: document store seam with in-memory and MongoDB backends
//! - [`realtime`]: live-query engine, server and client

pub mod cache;
pub mod cli;
pub mod config;
pub mod filter;
pub mod hooks;
pub mod pointer;
pub mod projection;
pub mod query;
pub mod realtime;
pub mod store;
