/// Device controller trait and the per-kind registry
pub mod controller;

/// Flow engine and its driver tasks
pub mod engine;

/// Live status fan-out and the interlock gate over it
pub mod status_board;
