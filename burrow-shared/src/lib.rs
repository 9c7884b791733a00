pub mod diagnostics;
pub mod exit;
