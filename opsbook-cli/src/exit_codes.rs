pub const OK: i32 = 0;
pub const RUN_FAILURE: i32 = 1;
pub const USAGE_ERROR: i32 = 2;
pub const RUNTIME_ERROR: i32 = 3;
