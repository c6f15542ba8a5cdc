use rusqlite::{Connection, OptionalExtension};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("marksheet.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            teacher_id TEXT NOT NULL,
            name TEXT NOT NULL,
            section TEXT,
            fiscal_year TEXT NOT NULL,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_classes_teacher ON classes(teacher_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            roll_no INTEGER,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            dob TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            sort_order INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class ON students(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            name TEXT NOT NULL,
            code TEXT,
            full_mark REAL NOT NULL DEFAULT 100,
            pass_mark REAL NOT NULL DEFAULT 40,
            has_conversion INTEGER NOT NULL DEFAULT 0,
            convert_to_mark REAL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subjects_class ON subjects(class_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subject_parts(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            name TEXT NOT NULL,
            part_type TEXT,
            full_mark REAL NOT NULL DEFAULT 0,
            pass_mark REAL NOT NULL DEFAULT 0,
            has_conversion INTEGER NOT NULL DEFAULT 0,
            convert_to_mark REAL,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_subject_parts_subject ON subject_parts(subject_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exams(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            name TEXT NOT NULL,
            term TEXT,
            fiscal_year TEXT NOT NULL,
            exam_date TEXT,
            sort_order INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    ensure_exams_exam_date(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_class ON exams(class_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exams_class_year ON exams(class_id, fiscal_year)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS exam_scale_overrides(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            subject_id TEXT,
            subject_part_id TEXT,
            full_mark REAL NOT NULL,
            pass_mark REAL NOT NULL DEFAULT 0,
            has_conversion INTEGER NOT NULL DEFAULT 0,
            convert_to_mark REAL,
            FOREIGN KEY(exam_id) REFERENCES exams(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_exam_scale_overrides_exam ON exam_scale_overrides(exam_id)",
        [],
    )?;
    // At most one override per (exam, subject) and per (exam, part).
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_exam_scale_overrides_subject
         ON exam_scale_overrides(exam_id, subject_id) WHERE subject_id IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_exam_scale_overrides_part
         ON exam_scale_overrides(exam_id, subject_part_id) WHERE subject_part_id IS NOT NULL",
        [],
    )?;

    // subject_part_id stores '' (not NULL) for whole-subject marks so the
    // UNIQUE key below holds for unparted subjects too.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS marks(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            subject_part_id TEXT NOT NULL DEFAULT '',
            obtained REAL NOT NULL,
            converted REAL,
            updated_at TEXT,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            UNIQUE(exam_id, student_id, subject_id, subject_part_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_exam ON marks(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_marks_student ON marks(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS results(
            id TEXT PRIMARY KEY,
            exam_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            section TEXT,
            fiscal_year TEXT NOT NULL,
            term TEXT,
            total REAL NOT NULL,
            max_total REAL NOT NULL DEFAULT 0,
            percentage REAL NOT NULL,
            grade TEXT NOT NULL,
            division TEXT NOT NULL,
            rank INTEGER NOT NULL,
            is_published INTEGER NOT NULL DEFAULT 0,
            share_token TEXT,
            computed_at TEXT,
            FOREIGN KEY(exam_id) REFERENCES exams(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(exam_id, student_id)
        )",
        [],
    )?;
    ensure_results_max_total(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_exam ON results(exam_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_student ON results(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_results_session ON results(student_id, class_id, fiscal_year)",
        [],
    )?;
    // SQLite unique indexes treat NULLs as distinct, so unassigned tokens coexist.
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_results_share_token ON results(share_token)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_exams_exam_date(conn: &Connection) -> anyhow::Result<()> {
    // Workspaces created before exam scheduling landed lack this column.
    if table_has_column(conn, "exams", "exam_date")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE exams ADD COLUMN exam_date TEXT", [])?;
    Ok(())
}

fn ensure_results_max_total(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "results", "max_total")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE results ADD COLUMN max_total REAL NOT NULL DEFAULT 0",
        [],
    )?;
    Ok(())
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value_json FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    Ok(Some(serde_json::from_str(&raw)?))
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)?;
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, &raw),
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
