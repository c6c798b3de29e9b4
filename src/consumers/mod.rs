//! The three consumers registered with the dispatch hub: a DB inserter pool,
//! a live broadcaster, and a windowed statistics aggregator (spec §4.7).

pub mod broadcast;
pub mod db;
pub mod stats;
