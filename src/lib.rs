#![warn(clippy::pedantic)]
// Noisy doc/signature lints
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
// format!("{}", x) is kept alongside inline args
#![allow(clippy::uninlined_format_args)]
// Counts, intervals and timestamps move between u32/u64/i64/f64
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::module_name_repetitions)]

pub mod autonomy;
pub mod cli;
pub mod config;
pub mod errors;
pub mod scheduler;
pub mod utils;

pub use errors::{CadenceError, CadenceResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
