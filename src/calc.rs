use crate::error::AppError;
use crate::model::{AssessmentType, AttendanceStatus, EducationLevel, ResultStatus, Stream, Term};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashMap;

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / (values.len() as f64)
}

/// `numerator / denominator * 100` rounded to one decimal, ties to even
/// (decimal banker's rounding). 0 when nothing was recorded.
pub fn percent_1dp(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        return 0.0;
    }
    let tenths = (numerator as f64) * 1000.0 / (denominator as f64);
    tenths.round_ties_even() / 10.0
}

pub fn round_1dp(x: f64) -> f64 {
    (x * 10.0).round_ties_even() / 10.0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceRow {
    pub id: i64,
    pub student_id: i64,
    pub student_name: String,
    pub subject_id: i64,
    pub subject_name: String,
    pub subject_code: Option<String>,
    pub academic_year: String,
    pub term: Term,
    pub assessment_type: AssessmentType,
    pub score: Option<f64>,
    pub grade_scale_id: Option<i64>,
    pub letter_grade: Option<String>,
    pub grade_point: Option<f64>,
    /// Pass flag of the referenced band; false when unresolved.
    pub is_passing: bool,
    pub result_status: ResultStatus,
    pub comments: Option<String>,
    pub assessment_date: Option<String>,
    pub submitted_at: String,
    pub last_modified: String,
    pub is_final_grade: bool,
    pub weight_percentage: i64,
    pub row_version: i64,
    pub summary: String,
}

fn performance_summary(letter: Option<&str>, score: Option<f64>) -> String {
    match score {
        None => "Not Assessed".to_string(),
        Some(s) => format!("{} ({:.1}%)", letter.unwrap_or("Unresolved"), s),
    }
}

const PERFORMANCE_SELECT: &str = "SELECT
    p.id, p.student_id, st.first_name, st.last_name, p.subject_id, sub.name, sub.code,
    p.academic_year, p.term, p.assessment_type, p.score, p.grade_scale_id,
    p.letter_grade, p.grade_point, COALESCE(gs.is_passing, 0), p.result_status,
    p.comments, p.assessment_date, p.submitted_at, p.last_modified,
    p.is_final_grade, p.weight_percentage, p.row_version
  FROM student_subject_performances p
  JOIN students st ON st.id = p.student_id
  JOIN subjects sub ON sub.id = p.subject_id
  LEFT JOIN grade_scales gs ON gs.id = p.grade_scale_id";

fn performance_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<PerformanceRow> {
    let first: String = r.get(2)?;
    let last: String = r.get(3)?;
    let score: Option<f64> = r.get(10)?;
    let letter_grade: Option<String> = r.get(12)?;
    Ok(PerformanceRow {
        id: r.get(0)?,
        student_id: r.get(1)?,
        student_name: format!("{} {}", first, last),
        subject_id: r.get(4)?,
        subject_name: r.get(5)?,
        subject_code: r.get(6)?,
        academic_year: r.get(7)?,
        term: r.get(8)?,
        assessment_type: r.get(9)?,
        score,
        grade_scale_id: r.get(11)?,
        summary: performance_summary(letter_grade.as_deref(), score),
        letter_grade,
        grade_point: r.get(13)?,
        is_passing: r.get::<_, i64>(14)? != 0,
        result_status: r.get(15)?,
        comments: r.get(16)?,
        assessment_date: r.get(17)?,
        submitted_at: r.get(18)?,
        last_modified: r.get(19)?,
        is_final_grade: r.get::<_, i64>(20)? != 0,
        weight_percentage: r.get(21)?,
        row_version: r.get(22)?,
    })
}

#[derive(Debug, Clone, Default)]
pub struct PerformanceFilter {
    pub student_id: Option<i64>,
    pub subject_id: Option<i64>,
    pub academic_year: Option<String>,
    pub term: Option<Term>,
    pub level: Option<EducationLevel>,
    /// `NotApplicable` matches every stream.
    pub stream: Option<Stream>,
    pub active_students_only: bool,
}

pub fn load_performances(
    conn: &Connection,
    filter: &PerformanceFilter,
) -> Result<Vec<PerformanceRow>, AppError> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut bind: Vec<Value> = Vec::new();
    if let Some(id) = filter.student_id {
        clauses.push("p.student_id = ?");
        bind.push(Value::Integer(id));
    }
    if let Some(id) = filter.subject_id {
        clauses.push("p.subject_id = ?");
        bind.push(Value::Integer(id));
    }
    if let Some(year) = &filter.academic_year {
        clauses.push("p.academic_year = ?");
        bind.push(Value::Text(year.clone()));
    }
    if let Some(term) = filter.term {
        clauses.push("p.term = ?");
        bind.push(Value::Text(term.as_str().to_string()));
    }
    if let Some(level) = filter.level {
        clauses.push("st.current_level = ?");
        bind.push(Value::Text(level.as_str().to_string()));
    }
    if let Some(stream) = filter.stream.filter(|s| *s != Stream::NotApplicable) {
        clauses.push("st.stream = ?");
        bind.push(Value::Text(stream.as_str().to_string()));
    }
    if filter.active_students_only {
        clauses.push("st.active = 1");
    }

    let mut sql = PERFORMANCE_SELECT.to_string();
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY st.first_name, st.last_name, sub.name, p.id");

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bind), performance_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_performance(conn: &Connection, id: i64) -> Result<PerformanceRow, AppError> {
    let sql = format!("{} WHERE p.id = ?", PERFORMANCE_SELECT);
    conn.query_row(&sql, [id], performance_from_row)
        .optional()?
        .ok_or(AppError::NotFound("performance record"))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentStats {
    pub total_subjects: usize,
    pub passed_subjects: usize,
    pub scored_count: usize,
    pub average_score: f64,
    pub average_grade_point: f64,
}

/// Records without a score (or grade point) are left out of the matching
/// average rather than counted as zero.
pub fn student_stats(rows: &[PerformanceRow]) -> StudentStats {
    let scores: Vec<f64> = rows.iter().filter_map(|r| r.score).collect();
    let points: Vec<f64> = rows.iter().filter_map(|r| r.grade_point).collect();
    StudentStats {
        total_subjects: rows.len(),
        passed_subjects: rows.iter().filter(|r| r.is_passing).count(),
        scored_count: scores.len(),
        average_score: mean(&scores),
        average_grade_point: mean(&points),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStats {
    pub total_students: usize,
    pub passed_students: usize,
    pub scored_count: usize,
    pub average_score: f64,
    pub highest_score: Option<f64>,
    pub lowest_score: Option<f64>,
}

pub fn subject_stats(rows: &[PerformanceRow]) -> SubjectStats {
    let scores: Vec<f64> = rows.iter().filter_map(|r| r.score).collect();
    SubjectStats {
        total_students: rows.len(),
        passed_students: rows.iter().filter(|r| r.is_passing).count(),
        scored_count: scores.len(),
        average_score: mean(&scores),
        highest_score: scores.iter().copied().reduce(f64::max),
        lowest_score: scores.iter().copied().reduce(f64::min),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentHeader {
    pub id: i64,
    pub student_no: String,
    pub first_name: String,
    pub last_name: String,
    pub full_name: String,
    pub current_level: EducationLevel,
    pub current_class: Option<String>,
    pub stream: Stream,
    pub active: bool,
}

const STUDENT_HEADER_SELECT: &str = "SELECT id, student_no, first_name, last_name, current_level, current_class, stream, active
     FROM students";

fn student_header_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<StudentHeader> {
    let first_name: String = r.get(2)?;
    let last_name: String = r.get(3)?;
    Ok(StudentHeader {
        id: r.get(0)?,
        student_no: r.get(1)?,
        full_name: format!("{} {}", first_name, last_name),
        first_name,
        last_name,
        current_level: r.get(4)?,
        current_class: r.get(5)?,
        stream: r.get(6)?,
        active: r.get::<_, i64>(7)? != 0,
    })
}

pub fn get_student_header(conn: &Connection, id: i64) -> Result<StudentHeader, AppError> {
    let sql = format!("{} WHERE id = ?", STUDENT_HEADER_SELECT);
    conn.query_row(&sql, [id], student_header_from_row)
        .optional()?
        .ok_or(AppError::NotFound("student"))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportPeriod {
    pub academic_year: String,
    pub term: Term,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student: StudentHeader,
    pub period: ReportPeriod,
    pub stats: StudentStats,
    pub records: Vec<PerformanceRow>,
}

pub fn student_report(
    conn: &Connection,
    student_id: i64,
    period: ReportPeriod,
) -> Result<StudentReport, AppError> {
    let student = get_student_header(conn, student_id)?;
    let records = load_performances(
        conn,
        &PerformanceFilter {
            student_id: Some(student_id),
            academic_year: Some(period.academic_year.clone()),
            term: Some(period.term),
            ..PerformanceFilter::default()
        },
    )?;
    Ok(StudentReport {
        student,
        period,
        stats: student_stats(&records),
        records,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReportRow {
    pub student: StudentHeader,
    pub stats: StudentStats,
    pub records: Vec<PerformanceRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassReport {
    pub level: EducationLevel,
    pub stream: Stream,
    pub period: ReportPeriod,
    pub student_count: usize,
    pub class_average_score: f64,
    pub students: Vec<ClassReportRow>,
}

/// Active students of `level` (and `stream`, unless `NotApplicable`),
/// ordered by first then last name, each with their period statistics.
pub fn class_report(
    conn: &Connection,
    level: EducationLevel,
    stream: Stream,
    period: ReportPeriod,
) -> Result<ClassReport, AppError> {
    let stream_filter = (stream != Stream::NotApplicable).then_some(stream);
    let sql = format!(
        "{} WHERE active = 1 AND current_level = ?1 AND (?2 IS NULL OR stream = ?2)
         ORDER BY first_name, last_name, id",
        STUDENT_HEADER_SELECT
    );
    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map((level, stream_filter), student_header_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let records = load_performances(
        conn,
        &PerformanceFilter {
            academic_year: Some(period.academic_year.clone()),
            term: Some(period.term),
            level: Some(level),
            stream: Some(stream),
            active_students_only: true,
            ..PerformanceFilter::default()
        },
    )?;
    let all_scores: Vec<f64> = records.iter().filter_map(|r| r.score).collect();
    let class_average_score = mean(&all_scores);

    let mut by_student: HashMap<i64, Vec<PerformanceRow>> = HashMap::new();
    for r in records {
        by_student.entry(r.student_id).or_default().push(r);
    }

    let rows: Vec<ClassReportRow> = students
        .into_iter()
        .map(|student| {
            let records = by_student.remove(&student.id).unwrap_or_default();
            ClassReportRow {
                stats: student_stats(&records),
                student,
                records,
            }
        })
        .collect();

    Ok(ClassReport {
        level,
        stream,
        period,
        student_count: rows.len(),
        class_average_score,
        students: rows,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectHeader {
    pub id: i64,
    pub name: String,
    pub code: Option<String>,
    pub level: EducationLevel,
    pub stream: Stream,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectReport {
    pub subject: SubjectHeader,
    pub period: ReportPeriod,
    pub stats: SubjectStats,
    pub records: Vec<PerformanceRow>,
}

pub fn subject_report(
    conn: &Connection,
    subject_id: i64,
    period: ReportPeriod,
) -> Result<SubjectReport, AppError> {
    let subject = conn
        .query_row(
            "SELECT id, name, code, level, stream, active FROM subjects WHERE id = ?",
            [subject_id],
            |r| {
                Ok(SubjectHeader {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    code: r.get(2)?,
                    level: r.get(3)?,
                    stream: r.get(4)?,
                    active: r.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()?
        .ok_or(AppError::NotFound("subject"))?;
    let records = load_performances(
        conn,
        &PerformanceFilter {
            subject_id: Some(subject_id),
            academic_year: Some(period.academic_year.clone()),
            term: Some(period.term),
            ..PerformanceFilter::default()
        },
    )?;
    Ok(SubjectReport {
        subject,
        period,
        stats: subject_stats(&records),
        records,
    })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceCounts {
    pub total_recorded: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
    /// Present or late.
    pub attended: usize,
}

impl AttendanceCounts {
    pub fn record(&mut self, status: AttendanceStatus) {
        self.total_recorded += 1;
        if status.counts_as_present() {
            self.attended += 1;
        }
        match status {
            AttendanceStatus::Present => self.present += 1,
            AttendanceStatus::Absent => self.absent += 1,
            AttendanceStatus::Late => self.late += 1,
            AttendanceStatus::Excused => self.excused += 1,
        }
    }

    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = AttendanceStatus>,
    {
        let mut counts = Self::default();
        for s in statuses {
            counts.record(s);
        }
        counts
    }

    /// Attended / total, as a one-decimal percentage.
    pub fn attendance_rate(&self) -> f64 {
        percent_1dp(self.attended, self.total_recorded)
    }

    pub fn to_json(self) -> serde_json::Value {
        serde_json::json!({
            "totalRecorded": self.total_recorded,
            "present": self.present,
            "absent": self.absent,
            "late": self.late,
            "excused": self.excused,
            "attended": self.attended,
            "attendanceRate": self.attendance_rate(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(score: Option<f64>, grade_point: Option<f64>, passing: bool) -> PerformanceRow {
        PerformanceRow {
            id: 1,
            student_id: 1,
            student_name: "Amina Nakato".into(),
            subject_id: 1,
            subject_name: "Mathematics".into(),
            subject_code: Some("MATH".into()),
            academic_year: "2025".into(),
            term: Term::Term1,
            assessment_type: AssessmentType::FinalExam,
            score,
            grade_scale_id: None,
            letter_grade: None,
            grade_point,
            is_passing: passing,
            result_status: ResultStatus::Submitted,
            comments: None,
            assessment_date: None,
            submitted_at: String::new(),
            last_modified: String::new(),
            is_final_grade: false,
            weight_percentage: 100,
            row_version: 1,
            summary: String::new(),
        }
    }

    #[test]
    fn averages_exclude_missing_scores() {
        let rows = vec![
            row(Some(80.0), Some(4.0), true),
            row(None, None, false),
            row(Some(60.0), Some(2.0), true),
        ];
        let stats = student_stats(&rows);
        assert_eq!(stats.total_subjects, 3);
        assert_eq!(stats.passed_subjects, 2);
        assert_eq!(stats.scored_count, 2);
        assert_eq!(stats.average_score, 70.0);
        assert_eq!(stats.average_grade_point, 3.0);
    }

    #[test]
    fn empty_input_yields_zeros() {
        assert_eq!(student_stats(&[]), StudentStats::default());
        let s = subject_stats(&[]);
        assert_eq!(s.total_students, 0);
        assert_eq!(s.average_score, 0.0);
        assert_eq!(s.highest_score, None);
        assert_eq!(s.lowest_score, None);
    }

    #[test]
    fn subject_min_max_ignore_unscored() {
        let rows = vec![
            row(Some(91.5), None, true),
            row(None, None, false),
            row(Some(42.0), None, false),
        ];
        let s = subject_stats(&rows);
        assert_eq!(s.highest_score, Some(91.5));
        assert_eq!(s.lowest_score, Some(42.0));
        assert_eq!(s.passed_students, 1);
        assert_eq!(s.average_score, 66.75);
    }

    #[test]
    fn attendance_rate_counts_late_as_present() {
        let mut statuses = vec![AttendanceStatus::Present; 6];
        statuses.extend([AttendanceStatus::Late; 2]);
        statuses.extend([AttendanceStatus::Absent; 2]);
        let counts = AttendanceCounts::from_statuses(statuses);
        assert_eq!(counts.total_recorded, 10);
        assert_eq!(counts.attended, 8);
        assert_eq!(counts.attendance_rate(), 80.0);
    }

    #[test]
    fn attendance_rate_rounds_half_to_even() {
        assert_eq!(percent_1dp(0, 0), 0.0);
        assert_eq!(percent_1dp(2, 3), 66.7);
        // 1/16 = 6.25% -> 6.2 under banker's rounding.
        assert_eq!(percent_1dp(1, 16), 6.2);
        // 3/16 = 18.75% -> 18.8.
        assert_eq!(percent_1dp(3, 16), 18.8);
    }

    #[test]
    fn summary_labels_unscored_records() {
        assert_eq!(performance_summary(None, None), "Not Assessed");
        assert_eq!(performance_summary(Some("B"), Some(85.0)), "B (85.0%)");
        assert_eq!(performance_summary(None, Some(89.5)), "Unresolved (89.5%)");
    }
}
