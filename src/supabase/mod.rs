//! Supabase-backed task storage: REST client, wire types and domain rows.

pub mod api_types;
pub mod cache;
pub mod client;
pub mod types;

pub use client::SupabaseClient;
