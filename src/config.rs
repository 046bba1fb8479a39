// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Fan-table configuration.
//!
//! The file is JSON with one breakpoint list per zone:
//!
//! ```json
//! {
//!   "cpu": [ { "temp": 10, "duty": 0 }, { "temp": 40, "duty": 35 } ],
//!   "gpu": [ { "temp": 10, "duty": 0 }, { "temp": 50, "duty": 35 } ]
//! }
//! ```
//!
//! Anything unusable -- a missing file, bad JSON, an empty or unordered
//! list -- falls back to the built-in table for that zone. Startup never
//! fails on configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::curve::{self, CurvePoint, FanTable, FanTables};

/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/clevo-fanctl/config.json";

// ---------------------------------------------------------------------------
// File schema
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    cpu: Vec<CurvePoint>,
    #[serde(default)]
    gpu: Vec<CurvePoint>,
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load both zone tables from `path`, falling back per zone.
pub fn load_tables(path: &Path) -> FanTables {
    let file = match fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ConfigFile>(&contents) {
            Ok(file) => {
                log::info!("loaded fan tables from {}", path.display());
                file
            }
            Err(e) => {
                log::warn!("ignoring {}: {e}", path.display());
                ConfigFile::default()
            }
        },
        Err(e) => {
            log::info!("no fan table config at {} ({e}), using defaults", path.display());
            ConfigFile::default()
        }
    };

    FanTables {
        cpu: zone_table("cpu", file.cpu, curve::default_cpu_table),
        gpu: zone_table("gpu", file.gpu, curve::default_gpu_table),
    }
}

/// Build one zone's table, replacing an absent or invalid list with the
/// built-in one. Configured breakpoints never merge with defaults.
fn zone_table(zone: &str, points: Vec<CurvePoint>, default: fn() -> FanTable) -> FanTable {
    if points.is_empty() {
        return default();
    }
    match FanTable::new(points) {
        Ok(table) => table,
        Err(e) => {
            log::warn!("invalid {zone} fan table ({e}), using the built-in one");
            default()
        }
    }
}

/// Resolve the config file path from the CLI arg or the default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    cli_path
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_zone_lists() {
        let file: ConfigFile = serde_json::from_str(
            r#"{
                "cpu": [ { "temp": 10, "duty": 0 }, { "temp": 60, "duty": 50 } ],
                "gpu": [ { "temp": 20, "duty": 10 } ]
            }"#,
        )
        .unwrap();
        assert_eq!(file.cpu.len(), 2);
        assert_eq!(file.gpu.len(), 1);
        assert_eq!(file.cpu[1], CurvePoint { temp: 60, duty: 50 });
    }

    #[test]
    fn missing_zone_list_parses_as_empty() {
        let file: ConfigFile = serde_json::from_str(r#"{ "cpu": [] }"#).unwrap();
        assert!(file.cpu.is_empty());
        assert!(file.gpu.is_empty());
    }

    #[test]
    fn empty_list_falls_back_to_the_builtin_table() {
        let table = zone_table("cpu", Vec::new(), curve::default_cpu_table);
        assert_eq!(table, curve::default_cpu_table());
    }

    #[test]
    fn invalid_list_falls_back_to_the_builtin_table() {
        let points = vec![
            CurvePoint { temp: 50, duty: 40 },
            CurvePoint { temp: 30, duty: 20 },
        ];
        let table = zone_table("gpu", points, curve::default_gpu_table);
        assert_eq!(table, curve::default_gpu_table());
    }

    #[test]
    fn valid_list_replaces_the_builtin_table() {
        let points = vec![
            CurvePoint { temp: 30, duty: 20 },
            CurvePoint { temp: 50, duty: 40 },
        ];
        let table = zone_table("cpu", points.clone(), curve::default_cpu_table);
        assert_eq!(table, FanTable::new(points).unwrap());
    }

    #[test]
    fn missing_file_yields_the_defaults() {
        let tables = load_tables(Path::new("/definitely/not/here/config.json"));
        assert_eq!(tables.cpu, curve::default_cpu_table());
        assert_eq!(tables.gpu, curve::default_gpu_table());
    }

    #[test]
    fn loads_a_real_file_per_zone() {
        let path = std::env::temp_dir().join(format!("clevo-fanctl-test-{}.json", std::process::id()));
        fs::write(
            &path,
            r#"{ "cpu": [ { "temp": 30, "duty": 20 }, { "temp": 60, "duty": 55 } ] }"#,
        )
        .unwrap();

        let tables = load_tables(&path);
        fs::remove_file(&path).unwrap();

        // The configured CPU table replaces the default; the absent GPU
        // list falls back.
        assert_ne!(tables.cpu, curve::default_cpu_table());
        assert_eq!(tables.gpu, curve::default_gpu_table());
    }

    #[test]
    fn cli_path_overrides_the_default() {
        assert_eq!(
            resolve_config_path(Some("/tmp/custom.json")),
            PathBuf::from("/tmp/custom.json")
        );
        assert_eq!(resolve_config_path(None), PathBuf::from(DEFAULT_CONFIG_PATH));
    }
}
