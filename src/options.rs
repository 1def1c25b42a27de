use flate2::Compression;

/// Tunables for a repository handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    /// zlib level for object files, 0-9.
    pub compression: u32,
    /// Sync files and directories before reporting a write as done. Only worth turning off in
    /// tests and throwaway repositories.
    pub fsync: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            compression: Compression::fast().level(),
            fsync: true,
        }
    }
}

impl Options {
    /// Defaults, overridden by `RIFT_COMPRESSION` and `RIFT_FSYNC` where those are set and valid.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(level) = std::env::var("RIFT_COMPRESSION")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            options.compression = level.min(9);
        }
        if let Ok(fsync) = std::env::var("RIFT_FSYNC") {
            options.fsync = !matches!(fsync.as_str(), "0" | "false" | "no" | "off");
        }
        options
    }

    pub(crate) fn compression(&self) -> Compression {
        Compression::new(self.compression.min(9))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.compression, 1);
        assert!(options.fsync);
        assert_eq!(Options { compression: 42, fsync: false }.compression().level(), 9);
    }
}
