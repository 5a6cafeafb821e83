pub mod eval;
pub mod export;
pub mod train;
