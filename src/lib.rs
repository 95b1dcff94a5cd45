mod buffer;
mod config;
mod driver;
mod error;
mod huffman;
mod key;
mod loser_tree;
mod pool;
mod run_index;
mod run_io;
mod stage1;
mod stage2;
mod validate;

pub mod cli;

pub use config::Config;
pub use error::{SortError, SortResult};
pub use key::Key;

/// Runs the full sort for key type `K` (`u32` or `u64`) per `config`.
pub fn sort<K: Key>(config: &Config) -> SortResult<()> {
    driver::run::<K>(config)
}
