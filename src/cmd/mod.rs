//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `init`   | `Init`           |
//! | `serve`  | `Serve`          |
//! | `worker` | `Worker`         |
//! | `ingest` | `Ingest`         |

pub mod ingest;
pub mod init;
pub mod serve;
pub mod worker;

pub use ingest::cmd_ingest;
pub use init::cmd_init;
pub use serve::cmd_serve;
pub use worker::cmd_worker;
