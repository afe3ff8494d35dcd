//! Run configuration.
//!
//! The YAML file lists the HTO libraries, the libraries to be demultiplexed,
//! read positions, HTO sequences, optional cutoffs and expected cell numbers.
//! [`Config::validate`] turns it into one [`LibraryPlan`] per library before
//! any input is read or output is created.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::categorize::HtoTable;
use crate::error::{DemuxError, Result};
use crate::extract::{FieldPosition, Mate, PositionSpec};
use crate::io::FileType;

#[derive(Debug, Clone, Deserialize)]
pub struct LibraryEntry {
    pub htolib_name: String,
    #[serde(rename = "R12")]
    pub mate: Mate,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionEntry {
    pub name: String,
    pub position: usize,
    #[serde(rename = "R12")]
    pub mate: Mate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HtoEntry {
    pub htolib_name: String,
    pub sample_name: String,
    pub hto_sequence: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Cutoffs {
    pub min_umi: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CellNumberEntry {
    pub htolib_name: String,
    pub sample_name: String,
    pub estimate_number: usize,
}

/// The configuration file as written. Sections are optional here so that a
/// missing one is reported by [`Config::validate`] by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(rename = "libraries_with_HTOs")]
    pub libraries_with_htos: Option<Vec<LibraryEntry>>,
    pub positions: Option<Vec<PositionEntry>>,
    pub libraries_to_be_demultiplexed: Option<Vec<LibraryEntry>>,
    #[serde(rename = "HTO_sequences")]
    pub hto_sequences: Option<Vec<HtoEntry>>,
    pub cutoffs: Option<Cutoffs>,
    pub expected_cell_number: Option<Vec<CellNumberEntry>>,
    /// Relative input paths are resolved against this directory.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

/// Everything needed to process one HTO library and its GEX library.
#[derive(Debug, Clone)]
pub struct LibraryPlan {
    pub name: String,
    pub hto_r1: PathBuf,
    pub hto_r2: PathBuf,
    pub gex_r1: PathBuf,
    pub gex_r2: PathBuf,
    pub positions: PositionSpec,
    pub htos: HtoTable,
    pub expected_cells: HashMap<String, usize>,
    pub min_umi: Option<usize>,
}

impl LibraryPlan {
    /// Output compression, following the GEX input.
    pub fn output_type(&self) -> FileType {
        FileType::from_path(&self.gex_r1).unwrap_or(FileType::Fastq)
    }
}

/// The validated run, libraries in configuration order.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub libraries: Vec<LibraryPlan>,
}

impl Config {
    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("Failed to parse configuration")
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let mut config = Self::from_yaml(&text).with_context(|| format!("Invalid configuration {}", path.display()))?;
        config.base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Check every section and build the per-library plans.
    pub fn validate(&self) -> Result<RunPlan> {
        let hto_libs = required("libraries_with_HTOs", &self.libraries_with_htos)?;
        let positions = required("positions", &self.positions)?;
        let gex_libs = required("libraries_to_be_demultiplexed", &self.libraries_to_be_demultiplexed)?;
        let htos = required("HTO_sequences", &self.hto_sequences)?;
        let cell_numbers = required("expected_cell_number", &self.expected_cell_number)?;

        let positions = parse_positions(positions)?;
        let min_umi = self.cutoffs.as_ref().and_then(|c| c.min_umi);

        let mut names: Vec<&str> = Vec::new();
        for entry in hto_libs {
            if !names.contains(&entry.htolib_name.as_str()) {
                names.push(&entry.htolib_name);
            }
        }
        if names.is_empty() {
            return Err(DemuxError::configuration("libraries_with_HTOs is empty"));
        }

        let mut libraries = Vec::with_capacity(names.len());
        for name in names {
            let (hto_r1, hto_r2) = self.mate_paths("libraries_with_HTOs", hto_libs, name)?;
            let (gex_r1, gex_r2) = self.mate_paths("libraries_to_be_demultiplexed", gex_libs, name)?;
            for gex in [&gex_r1, &gex_r2] {
                FileType::from_path(gex).map_err(|e| DemuxError::configuration(format!("{e}")))?;
            }

            let table = HtoTable::new(
                htos.iter()
                    .filter(|h| h.htolib_name == name)
                    .map(|h| (h.sample_name.as_str(), h.hto_sequence.as_bytes())),
            )
            .map_err(|e| DemuxError::configuration(format!("library '{name}': {e}")))?;
            if table.is_empty() {
                return Err(DemuxError::configuration(format!("no HTO sequences for library '{name}'")));
            }

            let mut expected_cells = HashMap::new();
            for entry in cell_numbers.iter().filter(|c| c.htolib_name == name) {
                if table.sample_id(&entry.sample_name).is_none() {
                    warn!("Expected cell number given for unknown sample '{}' of library '{}'", entry.sample_name, name);
                }
                expected_cells.insert(entry.sample_name.clone(), entry.estimate_number);
            }
            if let Some(sample) = table.samples().iter().find(|s| !expected_cells.contains_key(*s)) {
                return Err(DemuxError::MissingCellCount { library: name.to_string(), sample: sample.clone() });
            }

            libraries.push(LibraryPlan {
                name: name.to_string(),
                hto_r1,
                hto_r2,
                gex_r1,
                gex_r2,
                positions,
                htos: table,
                expected_cells,
                min_umi,
            });
        }

        info!("Configuration file validated successfully.");
        Ok(RunPlan { libraries })
    }

    /// The R1 and R2 paths of `library` in one of the library sections.
    fn mate_paths(&self, section: &str, entries: &[LibraryEntry], library: &str) -> Result<(PathBuf, PathBuf)> {
        let mut r1 = None;
        let mut r2 = None;
        for entry in entries.iter().filter(|e| e.htolib_name == library) {
            let slot = match entry.mate {
                Mate::R1 => &mut r1,
                Mate::R2 => &mut r2,
            };
            if slot.is_some() {
                return Err(DemuxError::configuration(format!(
                    "{section}: {} listed twice for library '{library}'",
                    entry.mate
                )));
            }
            let path = self.base_dir.join(&entry.path);
            if !path.exists() {
                return Err(DemuxError::configuration(format!("File does not exist: {}", path.display())));
            }
            *slot = Some(path);
        }
        match (r1, r2) {
            (Some(r1), Some(r2)) => Ok((r1, r2)),
            _ => Err(DemuxError::configuration(format!("{section}: missing R1 or R2 for library '{library}'"))),
        }
    }
}

fn required<'a, T>(section: &str, value: &'a Option<Vec<T>>) -> Result<&'a [T]> {
    value
        .as_deref()
        .ok_or_else(|| DemuxError::configuration(format!("Missing required section: {section}")))
}

fn find_position<'a>(entries: &'a [PositionEntry], name: &str) -> Result<&'a PositionEntry> {
    let mut found = entries.iter().filter(|p| p.name == name);
    let entry = found
        .next()
        .ok_or_else(|| DemuxError::configuration(format!("Missing position info: {name}")))?;
    if found.next().is_some() {
        return Err(DemuxError::configuration(format!("position {name} listed twice")));
    }
    Ok(entry)
}

fn parse_field(entries: &[PositionEntry], field: &str) -> Result<FieldPosition> {
    let start = find_position(entries, &format!("{field}_start"))?;
    let end = find_position(entries, &format!("{field}_end"))?;
    if start.mate != end.mate {
        return Err(DemuxError::configuration(format!(
            "{field} starts on {} but ends on {}",
            start.mate, end.mate
        )));
    }
    FieldPosition::new(start.mate, start.position, end.position)
        .map_err(|e| DemuxError::configuration(format!("{field}: {e}")))
}

fn parse_positions(entries: &[PositionEntry]) -> Result<PositionSpec> {
    Ok(PositionSpec {
        cell_barcode: parse_field(entries, "cell_barcode")?,
        umi: parse_field(entries, "umi")?,
        hto: parse_field(entries, "hto")?,
    })
}
