use crate::error::AppError;
use crate::model::EducationLevel;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;

/// One row of a level's grading scale.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeBand {
    /// `None` until the band has been stored.
    pub id: Option<i64>,
    pub grade: String,
    pub min_mark: i64,
    pub max_mark: i64,
    pub level: EducationLevel,
    pub description: Option<String>,
    pub grade_point: f64,
    pub is_passing: bool,
    pub display_order: i64,
}

impl GradeBand {
    /// Inclusive on both bounds.
    pub fn contains(&self, score: f64) -> bool {
        (self.min_mark as f64) <= score && score <= (self.max_mark as f64)
    }

    pub fn overlaps(&self, min_mark: i64, max_mark: i64) -> bool {
        self.min_mark <= max_mark && min_mark <= self.max_mark
    }

    pub fn full_description(&self) -> String {
        match self.description.as_deref() {
            Some(d) if !d.is_empty() => {
                format!("{} ({}-{}%) - {}", self.grade, self.min_mark, self.max_mark, d)
            }
            _ => format!("{} ({}-{}%)", self.grade, self.min_mark, self.max_mark),
        }
    }
}

/// Bands for any number of levels, kept in resolution order
/// (level, display order, id).
#[derive(Debug, Clone, Default)]
pub struct GradeScaleTable {
    bands: Vec<GradeBand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreRange {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionReport {
    pub level: EducationLevel,
    pub band_count: usize,
    /// Integer scores no band covers.
    pub gaps: Vec<ScoreRange>,
    /// Integer scores more than one band covers.
    pub overlaps: Vec<ScoreRange>,
}

impl PartitionReport {
    pub fn is_partition(&self) -> bool {
        self.band_count > 0 && self.gaps.is_empty() && self.overlaps.is_empty()
    }
}

impl GradeScaleTable {
    pub fn new(mut bands: Vec<GradeBand>) -> Self {
        bands.sort_by(|a, b| {
            a.level
                .as_str()
                .cmp(b.level.as_str())
                .then(a.display_order.cmp(&b.display_order))
                .then(a.id.cmp(&b.id))
        });
        Self { bands }
    }

    pub fn bands(&self) -> &[GradeBand] {
        &self.bands
    }

    pub fn bands_for(&self, level: EducationLevel) -> impl Iterator<Item = &GradeBand> {
        self.bands.iter().filter(move |b| b.level == level)
    }

    /// First band of `level` whose range contains `score`.
    pub fn resolve(&self, level: EducationLevel, score: f64) -> Option<&GradeBand> {
        self.bands_for(level).find(|b| b.contains(score))
    }

    /// First band of `level` (other than `exclude_id`) sharing any mark with
    /// `[min_mark, max_mark]`.
    pub fn find_overlap(
        &self,
        level: EducationLevel,
        min_mark: i64,
        max_mark: i64,
        exclude_id: Option<i64>,
    ) -> Option<&GradeBand> {
        self.bands_for(level)
            .filter(|b| exclude_id.is_none() || b.id != exclude_id)
            .find(|b| b.overlaps(min_mark, max_mark))
    }

    /// Checks the integer grid 0..=100 for scores with zero or several
    /// matching bands.
    pub fn check_partition(&self, level: EducationLevel) -> PartitionReport {
        let bands: Vec<&GradeBand> = self.bands_for(level).collect();
        let mut gaps = Vec::new();
        let mut overlaps = Vec::new();
        for score in 0..=100_i64 {
            let hits = bands.iter().filter(|b| b.contains(score as f64)).count();
            if hits == 0 {
                push_score(&mut gaps, score);
            } else if hits > 1 {
                push_score(&mut overlaps, score);
            }
        }
        PartitionReport {
            level,
            band_count: bands.len(),
            gaps,
            overlaps,
        }
    }
}

fn push_score(ranges: &mut Vec<ScoreRange>, score: i64) {
    if let Some(last) = ranges.last_mut() {
        if last.to + 1 == score {
            last.to = score;
            return;
        }
    }
    ranges.push(ScoreRange {
        from: score,
        to: score,
    });
}

/// The denormalized grade fields carried by a performance record.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub grade_scale_id: Option<i64>,
    pub letter_grade: Option<String>,
    pub grade_point: Option<f64>,
}

impl Resolution {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn from_band(band: &GradeBand) -> Self {
        Self {
            grade_scale_id: band.id,
            letter_grade: Some(band.grade.clone()),
            grade_point: Some(round_2dp(band.grade_point)),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.letter_grade.is_some()
    }
}

/// Missing score and missing band both resolve to "unresolved".
pub fn resolve_score(
    table: &GradeScaleTable,
    level: EducationLevel,
    score: Option<f64>,
) -> Resolution {
    match score.and_then(|s| table.resolve(level, s)) {
        Some(band) => Resolution::from_band(band),
        None => Resolution::unresolved(),
    }
}

pub fn round_2dp(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn load_scale_table(
    conn: &Connection,
    level: Option<EducationLevel>,
) -> rusqlite::Result<GradeScaleTable> {
    let mut stmt = conn.prepare(
        "SELECT id, grade, min_mark, max_mark, level, description, grade_point, is_passing, display_order
         FROM grade_scales
         WHERE (?1 IS NULL OR level = ?1)
         ORDER BY level, display_order, id",
    )?;
    let bands = stmt
        .query_map([level], |r| {
            Ok(GradeBand {
                id: Some(r.get(0)?),
                grade: r.get(1)?,
                min_mark: r.get(2)?,
                max_mark: r.get(3)?,
                level: r.get(4)?,
                description: r.get(5)?,
                grade_point: r.get(6)?,
                is_passing: r.get::<_, i64>(7)? != 0,
                display_order: r.get(8)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(GradeScaleTable::new(bands))
}

fn store_resolution(
    conn: &Connection,
    performance_id: i64,
    resolution: &Resolution,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE student_subject_performances
         SET grade_scale_id = ?, letter_grade = ?, grade_point = ?
         WHERE id = ?",
        (
            resolution.grade_scale_id,
            resolution.letter_grade.as_deref(),
            resolution.grade_point,
            performance_id,
        ),
    )?;
    Ok(())
}

/// Re-resolves one stored record against its student's current level and
/// writes the result back. Run it inside the transaction that changed the
/// score so the cache never goes stale.
pub fn write_back(conn: &Connection, performance_id: i64) -> Result<Resolution, AppError> {
    let row: Option<(Option<f64>, EducationLevel)> = conn
        .query_row(
            "SELECT p.score, s.current_level
             FROM student_subject_performances p
             JOIN students s ON s.id = p.student_id
             WHERE p.id = ?",
            [performance_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((score, level)) = row else {
        return Err(AppError::NotFound("performance record"));
    };

    let table = load_scale_table(conn, Some(level))?;
    let resolution = resolve_score(&table, level, score);
    if score.is_some() && !resolution.is_resolved() {
        tracing::warn!(
            performance_id,
            score,
            level = level.as_str(),
            "no grade band matches score; leaving grade unresolved"
        );
    }
    store_resolution(conn, performance_id, &resolution)?;
    Ok(resolution)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecomputeSummary {
    pub examined: usize,
    pub changed: usize,
    pub unresolved: usize,
}

/// Re-resolves every stored record, optionally restricted to students of one
/// level or to one student.
pub fn recompute(
    conn: &Connection,
    level: Option<EducationLevel>,
    student_id: Option<i64>,
) -> Result<RecomputeSummary, AppError> {
    let table = load_scale_table(conn, None)?;
    let mut stmt = conn.prepare(
        "SELECT p.id, p.score, s.current_level, p.grade_scale_id, p.letter_grade, p.grade_point
         FROM student_subject_performances p
         JOIN students s ON s.id = p.student_id
         WHERE (?1 IS NULL OR s.current_level = ?1)
           AND (?2 IS NULL OR s.id = ?2)
         ORDER BY p.id",
    )?;
    let rows = stmt
        .query_map((level, student_id), |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, Option<f64>>(1)?,
                r.get::<_, EducationLevel>(2)?,
                Resolution {
                    grade_scale_id: r.get(3)?,
                    letter_grade: r.get(4)?,
                    grade_point: r.get(5)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut summary = RecomputeSummary::default();
    for (id, score, student_level, current) in rows {
        summary.examined += 1;
        let next = resolve_score(&table, student_level, score);
        if !next.is_resolved() {
            summary.unresolved += 1;
        }
        if next != current {
            store_resolution(conn, id, &next)?;
            summary.changed += 1;
        }
    }
    tracing::debug!(
        examined = summary.examined,
        changed = summary.changed,
        "recomputed grade resolutions"
    );
    Ok(summary)
}
