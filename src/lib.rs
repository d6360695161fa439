pub mod builder;
pub mod config;
pub mod domain;
pub mod error;
pub mod graph;
pub mod grouping;
pub mod mapper;
pub mod merge;
pub mod output;
pub mod panther;
pub mod root;
pub mod source;
pub mod store;
pub mod target;
