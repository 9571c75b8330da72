//! Local caching and freshness coordination for a blog client.
//!
//! [`cache`] holds the policy engine, the single-flight refresh coordinator,
//! eviction and background sync. [`store`] defines the persistent store
//! contract; [`infra::db`] implements it on SQLite and [`infra::remote`]
//! fetches from the blog API.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod remote;
pub mod store;
