use crate::config::{self, SeedSource};
use crate::error::AppError;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use std::path::Path;

pub const DB_FILE: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path, scales_override: Option<&Path>) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    seed_grade_scales(&conn, workspace, scales_override)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            student_no TEXT NOT NULL UNIQUE,
            date_of_birth TEXT,
            phone TEXT,
            address TEXT,
            enrollment_date TEXT NOT NULL,
            current_level TEXT NOT NULL DEFAULT 'OLevel',
            current_class TEXT,
            stream TEXT NOT NULL DEFAULT 'NotApplicable',
            index_number TEXT,
            academic_year TEXT,
            guardian_name TEXT,
            guardian_phone TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_level_stream ON students(current_level, stream)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            first_name TEXT NOT NULL,
            last_name TEXT NOT NULL,
            email TEXT NOT NULL UNIQUE,
            employee_no TEXT NOT NULL UNIQUE,
            phone TEXT,
            department TEXT,
            specialization TEXT,
            hire_date TEXT NOT NULL,
            address TEXT,
            years_of_experience INTEGER,
            highest_qualification TEXT NOT NULL DEFAULT 'BachelorsDegree',
            license_number TEXT,
            active INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            code TEXT,
            level TEXT NOT NULL,
            subject_type TEXT NOT NULL,
            stream TEXT NOT NULL DEFAULT 'NotApplicable',
            description TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            credits INTEGER NOT NULL DEFAULT 1,
            UNIQUE(name, level)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_subjects(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            teacher_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            qualification_level TEXT NOT NULL,
            years_of_experience INTEGER NOT NULL DEFAULT 0,
            is_primary INTEGER NOT NULL DEFAULT 0,
            certification_date TEXT,
            qualification_details TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            assigned_date TEXT NOT NULL,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_teacher_subjects_subject ON teacher_subjects(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_scales(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            grade TEXT NOT NULL,
            min_mark INTEGER NOT NULL CHECK(min_mark BETWEEN 0 AND 100),
            max_mark INTEGER NOT NULL CHECK(max_mark BETWEEN 0 AND 100),
            level TEXT NOT NULL,
            description TEXT,
            grade_point REAL NOT NULL DEFAULT 0,
            is_passing INTEGER NOT NULL DEFAULT 1,
            display_order INTEGER NOT NULL DEFAULT 0,
            CHECK(min_mark <= max_mark),
            UNIQUE(grade, level)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_subject_performances(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            subject_id INTEGER NOT NULL,
            academic_year TEXT NOT NULL,
            term TEXT NOT NULL,
            assessment_type TEXT NOT NULL,
            score REAL CHECK(score IS NULL OR score BETWEEN 0 AND 100),
            grade_scale_id INTEGER,
            letter_grade TEXT,
            grade_point REAL,
            result_status TEXT NOT NULL DEFAULT 'Pending',
            comments TEXT,
            assessment_date TEXT,
            submitted_at TEXT NOT NULL,
            last_modified TEXT NOT NULL,
            is_final_grade INTEGER NOT NULL DEFAULT 0,
            weight_percentage INTEGER NOT NULL DEFAULT 100,
            row_version INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE CASCADE,
            FOREIGN KEY(grade_scale_id) REFERENCES grade_scales(id) ON DELETE SET NULL
        )",
        [],
    )?;
    ensure_performances_row_version(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_performances_student_period
         ON student_subject_performances(student_id, academic_year, term)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_performances_subject_period
         ON student_subject_performances(subject_id, academic_year, term)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_performances_grade_scale
         ON student_subject_performances(grade_scale_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            credits INTEGER NOT NULL DEFAULT 3,
            teacher_id INTEGER NOT NULL,
            subject_id INTEGER,
            academic_year TEXT NOT NULL,
            term TEXT NOT NULL DEFAULT 'Term1',
            start_date TEXT NOT NULL,
            end_date TEXT,
            max_enrollment INTEGER NOT NULL DEFAULT 30,
            room TEXT,
            days_of_week TEXT,
            start_time TEXT,
            end_time TEXT,
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id) ON DELETE SET NULL
        )",
        [],
    )?;
    ensure_course_schedule(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_enrollments(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            enrollment_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Active',
            UNIQUE(student_id, course_id),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id INTEGER NOT NULL,
            course_id INTEGER NOT NULL,
            attendance_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Present',
            notes TEXT,
            check_in_time TEXT,
            UNIQUE(student_id, course_id, attendance_date),
            FOREIGN KEY(student_id) REFERENCES students(id) ON DELETE CASCADE,
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(attendance_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_course_date ON attendance(course_id, attendance_date)",
        [],
    )?;

    Ok(())
}

// Early workspaces stored performances without optimistic-concurrency tracking.
fn ensure_performances_row_version(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "student_subject_performances", "row_version")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE student_subject_performances ADD COLUMN row_version INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    Ok(())
}

// Courses gained a weekly schedule after the first release.
fn ensure_course_schedule(conn: &Connection) -> anyhow::Result<()> {
    for column in ["days_of_week", "start_time", "end_time"] {
        if !table_has_column(conn, "courses", column)? {
            conn.execute(&format!("ALTER TABLE courses ADD COLUMN {} TEXT", column), [])?;
        }
    }
    Ok(())
}

/// Applies the configured scale seed to an empty `grade_scales` table. An
/// already populated table is left alone; bands are edited through the
/// `scales.*` methods after initialisation.
fn seed_grade_scales(
    conn: &Connection,
    workspace: &Path,
    scales_override: Option<&Path>,
) -> anyhow::Result<()> {
    let existing: i64 = conn.query_row("SELECT COUNT(*) FROM grade_scales", [], |r| r.get(0))?;
    if existing > 0 {
        tracing::debug!(bands = existing, "grade scales already present; skipping seed");
        return Ok(());
    }

    let (bands, source) = config::load_scale_seed(workspace, scales_override)?;
    let tx = conn.unchecked_transaction()?;
    for b in &bands {
        tx.execute(
            "INSERT INTO grade_scales(grade, min_mark, max_mark, level, description, grade_point, is_passing, display_order)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &b.grade,
                b.min_mark,
                b.max_mark,
                b.level,
                b.description.as_deref(),
                b.grade_point,
                b.is_passing as i64,
                b.display_order,
            ),
        )?;
    }
    settings_set_json(
        &tx,
        "grading.scaleSeed",
        &json!({
            "source": source.describe(),
            "bandCount": bands.len(),
            "seededAt": chrono::Utc::now().to_rfc3339(),
        }),
    )?;
    tx.commit()?;

    if source != SeedSource::Builtin {
        tracing::info!(source = %source.describe(), bands = bands.len(), "seeded custom grade scales");
    } else {
        tracing::info!(bands = bands.len(), "seeded built-in grade scales");
    }
    Ok(())
}

pub fn settings_get_json(conn: &Connection, key: &str) -> Result<Option<serde_json::Value>, AppError> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// In-memory database with schema and built-in scales, for unit tests.
#[cfg(test)]
pub fn open_memory() -> Connection {
    let conn = Connection::open_in_memory().expect("open memory db");
    conn.execute("PRAGMA foreign_keys = ON", []).expect("fk");
    create_schema(&conn).expect("schema");
    let dir = std::env::temp_dir().join("gradebookd-no-such-workspace");
    seed_grade_scales(&conn, &dir, None).expect("seed");
    conn
}
