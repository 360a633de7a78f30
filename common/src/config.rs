//! Configuration types for runtime, output and transfer settings

/// Runtime configuration for tokio and thread pools
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
    /// Number of blocking threads (0 = tokio default of 512)
    pub max_blocking_threads: usize,
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

/// Transfer tuning: how bytes are moved and how often progress is reported
#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    /// Bytes moved by a single read/write step
    pub chunk_size: u64,
    /// Number of chunks between emitted progress events
    pub progress_freq: u64,
    /// Number of progress events between rate/ETA re-estimation
    pub rate_freq: u64,
    /// Sync the destination to storage before reporting a file as done
    pub fsync: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4096,
            progress_freq: 1000,
            rate_freq: 50,
            fsync: true,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.chunk_size == 0 {
            return Err("chunk_size must be greater than 0".to_string());
        }
        if self.chunk_size > crate::copy::MAX_CHUNK_SIZE {
            return Err(format!(
                "chunk_size must be at most {}",
                bytesize::ByteSize(crate::copy::MAX_CHUNK_SIZE)
            ));
        }
        if self.progress_freq == 0 {
            return Err("progress_freq must be greater than 0".to_string());
        }
        if self.rate_freq == 0 {
            return Err("rate_freq must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn copy_settings(&self) -> crate::copy::Settings {
        crate::copy::Settings {
            chunk_size: self.chunk_size,
            progress_freq: self.progress_freq,
            fsync: self.fsync,
        }
    }

    pub fn monitor_settings(&self) -> crate::progress::MonitorSettings {
        crate::progress::MonitorSettings {
            rate_freq: self.rate_freq,
        }
    }
}
