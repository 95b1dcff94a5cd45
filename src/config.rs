//! Validated, CLI-derived settings for one sort run.

use std::path::{Path, PathBuf};

use crate::error::{SortError, SortResult};

#[derive(Debug, Clone)]
pub struct Config {
    pub input: PathBuf,
    pub output: PathBuf,
    pub prefix: PathBuf,
    /// `B`: buffer capacity in keys.
    pub buffer_capacity: usize,
    /// `K`: merge fan-in.
    pub fan_in: usize,
    pub validate: bool,
    /// Key width in bytes: 4 (`u32`) or 8 (`u64`).
    pub key_bytes: u8,
}

impl Config {
    /// Derives the run-file prefix from the output path when the caller
    /// does not supply one explicitly.
    pub fn default_prefix(output: &Path) -> PathBuf {
        let mut name = output.file_name().map(|s| s.to_os_string()).unwrap_or_default();
        name.push(".run-");
        match output.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(name),
            _ => PathBuf::from(name),
        }
    }

    pub fn validate(&self) -> SortResult<()> {
        if self.buffer_capacity < 1 {
            return Err(SortError::Config("buffer capacity B must be at least 1".into()));
        }
        if self.fan_in < 2 {
            return Err(SortError::Config("merge fan-in K must be at least 2".into()));
        }
        if self.key_bytes != 4 && self.key_bytes != 8 {
            return Err(SortError::Config(format!(
                "key width must be 4 or 8 bytes, got {}",
                self.key_bytes
            )));
        }
        if !self.input.exists() {
            return Err(SortError::Config(format!("input file {} does not exist", self.input.display())));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            input: PathBuf::from("/dev/null"),
            output: PathBuf::from("/tmp/out"),
            prefix: PathBuf::from("/tmp/out.run-"),
            buffer_capacity: 1024,
            fan_in: 8,
            validate: false,
            key_bytes: 4,
        }
    }

    #[test]
    fn default_prefix_appends_suffix_in_same_directory() {
        let prefix = Config::default_prefix(Path::new("/tmp/sorted.bin"));
        assert_eq!(prefix, PathBuf::from("/tmp/sorted.bin.run-"));
    }

    #[test]
    fn rejects_zero_buffer_capacity() {
        let mut c = base_config();
        c.buffer_capacity = 0;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_fan_in_below_two() {
        let mut c = base_config();
        c.fan_in = 1;
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_unsupported_key_width() {
        let mut c = base_config();
        c.key_bytes = 5;
        assert!(c.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_config() {
        assert!(base_config().validate().is_ok());
    }
}
