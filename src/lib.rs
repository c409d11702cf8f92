//! # Campaign Dispatcher
//!
//! Dispatch engine that fans Telegram campaigns out to their recipients.
//!
//! ## Features
//! - Push triggers from the database notification channel, with a periodic poll as fallback
//! - At most one active dispatch per campaign, enforced by a per-campaign lock
//! - Batched, paced delivery with per-recipient retries and an outcome ledger
//! - Interrupted runs resume without re-sending to delivered recipients
//! - Scheduled broadcasts released by a time-based tick
//! - SQLite or PostgreSQL storage

/// Configuration management and environment variables
pub mod config;
/// Shared handles used by every dispatch component
pub mod context;
/// Database models, connections, and the campaign store
pub mod database;
/// Listener, poller, scheduler, and dispatcher
pub mod dispatch;
/// Message delivery, background jobs, and the HTTP surface
pub mod services;
/// Utility functions for backoff, logging, and validation
pub mod utils;
