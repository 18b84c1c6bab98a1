//! Constant weights used to price error recovery (`error_cost` accounting,
//! §3 invariant 2 and §4.4.1). Mirrors `error_costs.h`.

pub const ERROR_COST_PER_SKIPPED_CHAR: u32 = 8;
pub const ERROR_COST_PER_SKIPPED_LINE: u32 = 30;
pub const ERROR_COST_PER_SKIPPED_TREE: u32 = 100;
pub const ERROR_COST_PER_RECOVERY: u32 = 500;
pub const ERROR_COST_PER_MISSING_TREE: u32 = 110;
