//! CLI command implementations.
//!
//! | Module   | Commands handled   |
//! |----------|--------------------|
//! | `serve`  | `Serve`, `Init`    |
//! | `token`  | `Token`            |

pub mod serve;
pub mod token;

pub use serve::{cmd_init, cmd_serve};
pub use token::cmd_token;
