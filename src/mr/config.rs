//! Configuration loading and machine-file parsing.
//!
//! Kept out of THE CORE by spec.md §1, but every binary still needs it to
//! start up; `serde_json` replaces the original's `json.load(open(fconf))`
//! (`examples/original_source/src/master.py`, `src/server.py`).

use serde::Deserialize;
use std::fs;
use std::path::Path;

fn default_ping_max() -> u64 {
    5
}

fn default_ping_interval() -> u64 {
    5
}

fn default_sleep_interval() -> f64 {
    1.0
}

fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "machine-file")]
    pub machine_file: Option<String>,

    #[serde(rename = "num-mapper")]
    pub num_mapper: usize,
    #[serde(rename = "num-reducer")]
    pub num_reducer: usize,

    #[serde(rename = "threshold-nfile")]
    pub threshold_nfile: usize,
    #[serde(rename = "threshold-size", default)]
    pub threshold_size: u64,

    #[serde(rename = "sleep-interval", default = "default_sleep_interval")]
    pub sleep_interval: f64,

    #[serde(rename = "master-url")]
    pub master_url: String,
    #[serde(rename = "master-host")]
    pub master_host: String,
    #[serde(rename = "master-port")]
    pub master_port: u16,

    #[serde(rename = "input-module", default)]
    pub input_module: Option<String>,
    #[serde(rename = "map-module", default)]
    pub map_module: Option<String>,
    #[serde(rename = "reduce-module", default)]
    pub reduce_module: Option<String>,
    #[serde(rename = "map-executable", default)]
    pub map_executable: Option<String>,
    #[serde(rename = "reduce-executable", default)]
    pub reduce_executable: Option<String>,

    pub datadir: String,
    #[serde(rename = "input-prefix")]
    pub input_prefix: String,
    #[serde(rename = "output-prefix")]
    pub output_prefix: String,

    #[serde(rename = "dfs-enabled", default = "default_false")]
    pub dfs_enabled: bool,
    #[serde(rename = "dfs-conf", default)]
    pub dfs_conf: Option<serde_json::Value>,

    #[serde(rename = "ping-max", default = "default_ping_max")]
    pub ping_max: u64,
    #[serde(rename = "ping-interval", default = "default_ping_interval")]
    pub ping_interval: u64,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn output_path(&self) -> std::path::PathBuf {
        Path::new(&self.datadir).join(&self.output_prefix)
    }
}

/// Parse a machine file: `#` comments, each non-empty line either `host` or
/// `host:N`; total slots = sum of N (N defaults to 1).
pub fn count_machine_slots(path: impl AsRef<Path>) -> anyhow::Result<usize> {
    let contents = fs::read_to_string(path)?;
    let mut total = 0usize;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let slots = match line.rsplit_once(':') {
            Some((_, n)) => n.trim().parse::<usize>().unwrap_or(1),
            None => 1,
        };

        total += slots;
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn counts_default_and_explicit_slots() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "host-a").unwrap();
        writeln!(file, "host-b:3").unwrap();
        writeln!(file).unwrap();

        let total = count_machine_slots(file.path()).unwrap();
        assert_eq!(total, 4);
    }
}
