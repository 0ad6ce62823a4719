//! CLI command implementations.
//!
//! Each submodule owns one `Commands` variant:
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `submit` | `Submit`         |
//! | `config` | `Config`         |

pub mod config;
pub mod serve;
pub mod submit;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use submit::{SubmitArgs, cmd_submit};
