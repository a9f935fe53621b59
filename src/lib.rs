pub mod chunk;
pub mod chunkserver;
pub mod common;
pub mod config;
pub mod error;
pub mod logging;
pub mod master;

pub use crate::chunkserver::{ChunkserverClient, NetworkShim};
pub use crate::config::MasterConfig;
pub use crate::error::{MasterError, Result};
pub use crate::master::Master;
