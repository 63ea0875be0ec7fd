use crate::grading::{GradeBand, GradeScaleTable};
use crate::model::EducationLevel;
use anyhow::{anyhow, bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const LOG_ENV: &str = "GRADEBOOKD_LOG";
pub const WORKSPACE_ENV: &str = "GRADEBOOKD_WORKSPACE";
pub const SCALES_ENV: &str = "GRADEBOOKD_SCALES";

/// Name of the optional per-workspace seed override.
pub const WORKSPACE_SCALES_FILE: &str = "grade_scales.json";

const BUILTIN_SCALES: &str = include_str!("../config/grade_scales.json");

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub workspace: Option<PathBuf>,
    pub scales_path: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        Self {
            log_filter: non_empty(LOG_ENV).unwrap_or_else(|| "info".to_string()),
            workspace: non_empty(WORKSPACE_ENV).map(PathBuf::from),
            scales_path: non_empty(SCALES_ENV).map(PathBuf::from),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScaleSeedFile {
    bands: Vec<SeedBand>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SeedBand {
    level: EducationLevel,
    grade: String,
    min_mark: i64,
    max_mark: i64,
    grade_point: f64,
    #[serde(default = "default_true")]
    is_passing: bool,
    display_order: i64,
    #[serde(default)]
    description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Where the applied seed came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedSource {
    Env(PathBuf),
    Workspace(PathBuf),
    Builtin,
}

impl SeedSource {
    pub fn describe(&self) -> String {
        match self {
            SeedSource::Env(p) => format!("env:{}", p.to_string_lossy()),
            SeedSource::Workspace(p) => format!("workspace:{}", p.to_string_lossy()),
            SeedSource::Builtin => "builtin".to_string(),
        }
    }
}

pub fn parse_scale_seed(text: &str) -> anyhow::Result<Vec<GradeBand>> {
    let file: ScaleSeedFile = serde_json::from_str(text).context("invalid grade scale seed JSON")?;
    if file.bands.is_empty() {
        bail!("grade scale seed has no bands");
    }

    let mut bands = Vec::with_capacity(file.bands.len());
    for (i, b) in file.bands.into_iter().enumerate() {
        let grade = b.grade.trim().to_string();
        if grade.is_empty() || grade.chars().count() > 5 {
            bail!("band {}: grade must be 1-5 characters", i);
        }
        if !(0..=100).contains(&b.min_mark) || !(0..=100).contains(&b.max_mark) {
            bail!("band {} ({}): marks must be between 0 and 100", i, grade);
        }
        if b.min_mark > b.max_mark {
            bail!("band {} ({}): minMark exceeds maxMark", i, grade);
        }
        if !(0.0..=9.99).contains(&b.grade_point) {
            bail!("band {} ({}): gradePoint must be between 0 and 9.99", i, grade);
        }
        bands.push(GradeBand {
            id: None,
            grade,
            min_mark: b.min_mark,
            max_mark: b.max_mark,
            level: b.level,
            description: b.description.map(|d| d.trim().to_string()).filter(|d| !d.is_empty()),
            grade_point: crate::grading::round_2dp(b.grade_point),
            is_passing: b.is_passing,
            display_order: b.display_order,
        });
    }

    let table = GradeScaleTable::new(bands.clone());
    for level in EducationLevel::ALL {
        let report = table.check_partition(*level);
        if report.band_count == 0 {
            continue;
        }
        if let Some(r) = report.overlaps.first() {
            bail!(
                "{} bands overlap at marks {}-{}",
                level.label(),
                r.from,
                r.to
            );
        }
        if !report.gaps.is_empty() {
            tracing::warn!(
                level = level.as_str(),
                gaps = ?report.gaps,
                "grade scale seed leaves marks uncovered"
            );
        }
    }
    for level in EducationLevel::ALL {
        let mut seen = std::collections::HashSet::new();
        for b in bands.iter().filter(|b| b.level == *level) {
            if !seen.insert(b.grade.to_ascii_uppercase()) {
                return Err(anyhow!("{} grade {} appears twice", level.label(), b.grade));
            }
        }
    }
    Ok(bands)
}

pub fn builtin_scale_seed() -> anyhow::Result<Vec<GradeBand>> {
    parse_scale_seed(BUILTIN_SCALES)
}

/// Seed precedence: explicit path, then the workspace file, then the
/// built-in CBC/UACE tables.
pub fn load_scale_seed(
    workspace: &Path,
    override_path: Option<&Path>,
) -> anyhow::Result<(Vec<GradeBand>, SeedSource)> {
    if let Some(p) = override_path {
        let text = std::fs::read_to_string(p)
            .with_context(|| format!("failed to read grade scale seed {}", p.to_string_lossy()))?;
        return Ok((parse_scale_seed(&text)?, SeedSource::Env(p.to_path_buf())));
    }
    let ws_file = workspace.join(WORKSPACE_SCALES_FILE);
    if ws_file.is_file() {
        let text = std::fs::read_to_string(&ws_file).with_context(|| {
            format!("failed to read grade scale seed {}", ws_file.to_string_lossy())
        })?;
        return Ok((parse_scale_seed(&text)?, SeedSource::Workspace(ws_file)));
    }
    Ok((builtin_scale_seed()?, SeedSource::Builtin))
}
