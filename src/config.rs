use lazy_static::lazy_static;
use parking_lot::RwLock;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

lazy_static! {
    static ref CONFIG: RwLock<PipelineConfig> = RwLock::new(PipelineConfig::load());
}

const CONFIG_PATHS: [&str; 2] = ["./avpipe.toml", "./avpipe_config.toml"];

/// Tunables shared by the demux and decode stages.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Size of the per-task read buffer behind the I/O adapter.
    pub read_buffer_size: usize,
    /// Bytes inspected when detecting the container format.
    pub probe_size: usize,
    /// Upper bound handed to format parsers for stream analysis.
    pub max_probe_duration_ms: u64,
    /// Queue depth used when a caller does not supply one.
    pub min_queue_length: usize,
    /// How long a hardware flush may take before undrained frames are dropped.
    pub hardware_flush_timeout: Duration,
    /// In-place hardware reopen attempts before falling back to software.
    pub hardware_retry_limit: u32,
    /// Software engine input depth above which the decode loop yields.
    pub software_queue_cap: usize,
    /// Maximum live buffers per pool; `None` means unbounded.
    pub pool_capacity: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 32 * 1024,
            probe_size: 4096,
            max_probe_duration_ms: 5000,
            min_queue_length: 8,
            hardware_flush_timeout: Duration::from_millis(2000),
            hardware_retry_limit: 3,
            software_queue_cap: 16,
            pool_capacity: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults, then environment variables, then the first config file found.
    pub fn load() -> Self {
        let mut config = PipelineConfig::default();

        for (key, value) in env::vars() {
            if let Some(name) = key.strip_prefix("AVPIPE_") {
                config.apply(&name.to_ascii_lowercase(), &value);
            }
        }

        for path in &CONFIG_PATHS {
            if let Ok(mut file) = File::open(path) {
                let mut content = String::new();
                if file.read_to_string(&mut content).is_ok() {
                    config.apply_file(&content);
                    break;
                }
            }
        }

        config
    }

    /// Applies every `key = value` line of a config file.
    pub fn apply_file(&mut self, content: &str) {
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                self.apply(key.trim(), value);
            }
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        let parsed = value.parse::<u64>();
        let Ok(number) = parsed else {
            log::warn!("ignoring non-numeric config value {} = {}", key, value);
            return;
        };

        match key {
            "read_buffer_size" => self.read_buffer_size = number as usize,
            "probe_size" => self.probe_size = number as usize,
            "max_probe_duration_ms" => self.max_probe_duration_ms = number,
            "min_queue_length" => self.min_queue_length = number as usize,
            "hw_flush_timeout_ms" => self.hardware_flush_timeout = Duration::from_millis(number),
            "hw_retry_limit" => self.hardware_retry_limit = number as u32,
            "sw_queue_cap" => self.software_queue_cap = number as usize,
            "pool_capacity" => {
                self.pool_capacity = if number == 0 { None } else { Some(number as usize) }
            }
            _ => log::debug!("unknown config key {}", key),
        }
    }

    pub fn reload() {
        let new_config = PipelineConfig::load();
        *CONFIG.write() = new_config;
    }
}

/// Returns the process-wide configuration.
pub fn current() -> PipelineConfig {
    CONFIG.read().clone()
}

/// Creates a default config template file if it doesn't exist
pub fn create_default_config_template<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    if !path.as_ref().exists() {
        let template = r#"# avpipe configuration
# Every key may also be set through an AVPIPE_<KEY> environment variable.

read_buffer_size = 32768
probe_size = 4096
max_probe_duration_ms = 5000
min_queue_length = 8
hw_flush_timeout_ms = 2000
hw_retry_limit = 3
sw_queue_cap = 16
# 0 disables the limit
pool_capacity = 0
"#;
        std::fs::write(path, template)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_apply_file() {
        let mut config = PipelineConfig::default();
        config.apply_file(
            "# comment\nmin_queue_length = 3\nhw_flush_timeout_ms = \"50\"\npool_capacity = 0\nbogus = x\n",
        );

        assert_eq!(config.min_queue_length, 3);
        assert_eq!(config.hardware_flush_timeout, Duration::from_millis(50));
        assert_eq!(config.pool_capacity, None);
        assert_eq!(config.read_buffer_size, 32 * 1024);
    }

    #[test]
    fn test_template_round_trip() {
        let dir = env::temp_dir().join(format!("avpipe-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("avpipe.toml");
        let _ = std::fs::remove_file(&path);

        create_default_config_template(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let mut config = PipelineConfig::default();
        config.apply_file(&content);
        assert_eq!(config, PipelineConfig::default());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
