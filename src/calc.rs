use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Half-up 2-decimal rounding applied wherever marks are rescaled:
/// `Int(100*x + 0.5) / 100`
pub fn round_off_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub exam_id: &'a str,
}

/// Where an effective scale came from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScaleSource {
    PartOverride,
    SubjectOverride,
    Default,
}

impl ScaleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ScaleSource::PartOverride => "partOverride",
            ScaleSource::SubjectOverride => "subjectOverride",
            ScaleSource::Default => "default",
        }
    }
}

/// The effective scoring scale of one unit (a whole subject or one part)
/// within one exam. An all-zero scale means "not configured": callers must
/// not treat it as a pass target, and conversion never applies to it.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedScale {
    pub full_mark: f64,
    pub pass_mark: f64,
    pub has_conversion: bool,
    pub convert_to_mark: Option<f64>,
    pub source: ScaleSource,
}

impl ResolvedScale {
    /// The mark a unit counts out of after conversion: `convert_to_mark`
    /// when conversion applies, else `full_mark`.
    pub fn target_mark(&self) -> f64 {
        match self.convert_to_mark {
            Some(target) if self.has_conversion && target > 0.0 && self.full_mark > 0.0 => target,
            _ => self.full_mark,
        }
    }
}

/// Default or override scale values as stored; resolution tags them with a source.
#[derive(Debug, Clone, Copy)]
pub struct ScaleValues {
    pub full_mark: f64,
    pub pass_mark: f64,
    pub has_conversion: bool,
    pub convert_to_mark: Option<f64>,
}

impl ScaleValues {
    fn resolved(self, source: ScaleSource) -> ResolvedScale {
        ResolvedScale {
            full_mark: self.full_mark,
            pass_mark: self.pass_mark,
            has_conversion: self.has_conversion,
            convert_to_mark: self.convert_to_mark,
            source,
        }
    }
}

/// Rescale a raw mark onto the unit's target scale. Identity unless the
/// resolved scale actually converts; rounded half-up to two decimals when
/// it does.
pub fn convert_mark(obtained: f64, scale: &ResolvedScale) -> f64 {
    match scale.convert_to_mark {
        Some(target) if scale.has_conversion && target > 0.0 && scale.full_mark > 0.0 => {
            round_off_2_decimals(obtained / scale.full_mark * target)
        }
        _ => obtained,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GradeBand {
    pub grade: &'static str,
    pub division: &'static str,
}

const GRADE_BANDS: [(f64, &str, &str); 5] = [
    (80.0, "A+", "Distinction"),
    (70.0, "A", "First"),
    (60.0, "B+", "Second"),
    (50.0, "B", "Third"),
    (40.0, "C", "Pass"),
];

/// The one percentage-to-grade table. Every surface (dashboard listing, CSV
/// export, public marksheet) goes through here; thresholds are inclusive
/// lower bounds.
pub fn grade_for_percentage(percentage: f64) -> GradeBand {
    for (floor, grade, division) in GRADE_BANDS {
        if percentage >= floor {
            return GradeBand { grade, division };
        }
    }
    GradeBand {
        grade: "F",
        division: "Fail",
    }
}

#[derive(Debug, Clone)]
pub struct ExamHeader {
    pub id: String,
    pub class_id: String,
    pub teacher_id: String,
    pub name: String,
    pub term: Option<String>,
    pub fiscal_year: String,
    pub section: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotStudent {
    pub id: String,
    pub roll_no: Option<i64>,
    pub last_name: String,
    pub first_name: String,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotPart {
    pub id: String,
    pub name: String,
    pub part_type: Option<String>,
    pub defaults: ScaleValues,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotSubject {
    pub id: String,
    pub name: String,
    pub code: Option<String>,
    pub defaults: ScaleValues,
    pub parts: Vec<SnapshotPart>,
    pub sort_order: i64,
}

#[derive(Debug, Clone)]
pub struct SnapshotMark {
    pub student_id: String,
    pub subject_id: String,
    pub subject_part_id: Option<String>,
    pub obtained: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ExamOverrides {
    pub by_subject: HashMap<String, ScaleValues>,
    pub by_part: HashMap<String, ScaleValues>,
}

/// Everything recompute needs, read in one pass so the arithmetic below
/// stays pure and unit-testable without a database.
#[derive(Debug, Clone)]
pub struct ExamSnapshot {
    pub exam: ExamHeader,
    pub students: Vec<SnapshotStudent>,
    pub subjects: Vec<SnapshotSubject>,
    pub overrides: ExamOverrides,
    pub marks: Vec<SnapshotMark>,
}

/// One prioritized lookup for the effective scale of a scoring unit:
/// part-level exam override, then subject-level exam override, then the
/// unit's own default.
pub fn resolve_scale(
    subject: &SnapshotSubject,
    part: Option<&SnapshotPart>,
    overrides: &ExamOverrides,
) -> ResolvedScale {
    if let Some(part) = part {
        if let Some(o) = overrides.by_part.get(&part.id) {
            return o.resolved(ScaleSource::PartOverride);
        }
        if let Some(o) = overrides.by_subject.get(&subject.id) {
            return o.resolved(ScaleSource::SubjectOverride);
        }
        return part.defaults.resolved(ScaleSource::Default);
    }
    if let Some(o) = overrides.by_subject.get(&subject.id) {
        return o.resolved(ScaleSource::SubjectOverride);
    }
    subject.defaults.resolved(ScaleSource::Default)
}

/// A scoring unit of an exam: one part of a parted subject, or the whole
/// subject when it has no parts, with its effective scale attached.
#[derive(Debug, Clone)]
pub struct ScoringUnit {
    pub subject_id: String,
    pub subject_name: String,
    pub part_id: Option<String>,
    pub part_name: Option<String>,
    pub part_type: Option<String>,
    pub scale: ResolvedScale,
}

pub fn scoring_units(snapshot: &ExamSnapshot) -> Vec<ScoringUnit> {
    let mut units = Vec::new();
    for subject in &snapshot.subjects {
        if subject.parts.is_empty() {
            units.push(ScoringUnit {
                subject_id: subject.id.clone(),
                subject_name: subject.name.clone(),
                part_id: None,
                part_name: None,
                part_type: None,
                scale: resolve_scale(subject, None, &snapshot.overrides),
            });
            continue;
        }
        for part in &subject.parts {
            units.push(ScoringUnit {
                subject_id: subject.id.clone(),
                subject_name: subject.name.clone(),
                part_id: Some(part.id.clone()),
                part_name: Some(part.name.clone()),
                part_type: part.part_type.clone(),
                scale: resolve_scale(subject, Some(part), &snapshot.overrides),
            });
        }
    }
    units
}

#[derive(Debug, Clone)]
pub struct SubjectTotal {
    pub subject_id: String,
    pub total: f64,
    /// False when the student had no mark in any unit of the subject.
    pub entered: bool,
}

#[derive(Debug, Clone)]
pub struct ComputedResult {
    pub student_id: String,
    pub subject_totals: Vec<SubjectTotal>,
    pub total: f64,
    pub max_total: f64,
    pub percentage: f64,
    pub grade: &'static str,
    pub division: &'static str,
    pub rank: i64,
}

/// Exam aggregation: one row per enrolled student. Converted values are
/// recomputed here from `obtained` and the current effective scales; stored
/// display conversions are never read back. `max_total` spans every subject
/// the class offers, whether or not the student has marks in it, and a zero
/// `max_total` yields 0% rather than an error.
pub fn compute_exam_results(snapshot: &ExamSnapshot) -> Vec<ComputedResult> {
    let units = scoring_units(snapshot);
    let max_total =
        round_off_2_decimals(units.iter().map(|u| u.scale.target_mark()).sum::<f64>());

    let mut obtained: HashMap<(&str, &str, &str), f64> = HashMap::new();
    for m in &snapshot.marks {
        obtained.insert(
            (
                m.student_id.as_str(),
                m.subject_id.as_str(),
                m.subject_part_id.as_deref().unwrap_or(""),
            ),
            m.obtained,
        );
    }

    let mut rows: Vec<ComputedResult> = Vec::with_capacity(snapshot.students.len());
    for student in &snapshot.students {
        let mut subject_totals: Vec<SubjectTotal> = Vec::with_capacity(snapshot.subjects.len());
        let mut total = 0.0_f64;
        for subject in &snapshot.subjects {
            let mut subject_sum = 0.0_f64;
            let mut entered = false;
            for unit in units.iter().filter(|u| u.subject_id == subject.id) {
                let key = (
                    student.id.as_str(),
                    unit.subject_id.as_str(),
                    unit.part_id.as_deref().unwrap_or(""),
                );
                if let Some(&raw) = obtained.get(&key) {
                    subject_sum += convert_mark(raw, &unit.scale);
                    entered = true;
                }
            }
            let subject_sum = round_off_2_decimals(subject_sum);
            total += subject_sum;
            subject_totals.push(SubjectTotal {
                subject_id: subject.id.clone(),
                total: subject_sum,
                entered,
            });
        }
        let total = round_off_2_decimals(total);
        let percentage = if max_total > 0.0 {
            round_off_2_decimals(total / max_total * 100.0)
        } else {
            0.0
        };
        let band = grade_for_percentage(percentage);
        rows.push(ComputedResult {
            student_id: student.id.clone(),
            subject_totals,
            total,
            max_total,
            percentage,
            grade: band.grade,
            division: band.division,
            rank: 0,
        });
    }

    assign_competition_ranks(&mut rows);
    rows
}

/// Standard competition ranking over `total`, highest first: tied totals
/// share the position of the first row in the tied run and the next
/// distinct total resumes at its sorted position. Student id is the
/// deterministic secondary sort key; it never splits a shared rank.
pub fn assign_competition_ranks(rows: &mut [ComputedResult]) {
    rows.sort_by(|a, b| {
        b.total
            .partial_cmp(&a.total)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.student_id.cmp(&b.student_id))
    });
    let mut prev_total = f64::NAN;
    let mut rank: i64 = 0;
    for (i, row) in rows.iter_mut().enumerate() {
        if row.total != prev_total {
            rank = (i + 1) as i64;
            prev_total = row.total;
        }
        row.rank = rank;
    }
}

pub fn load_exam_snapshot(ctx: &CalcContext<'_>) -> Result<ExamSnapshot, CalcError> {
    let conn = ctx.conn;
    let exam_id = ctx.exam_id;

    let exam: Option<ExamHeader> = conn
        .query_row(
            "SELECT e.id, e.class_id, e.teacher_id, e.name, e.term, e.fiscal_year, c.section
             FROM exams e
             JOIN classes c ON c.id = e.class_id
             WHERE e.id = ?",
            [exam_id],
            |r| {
                Ok(ExamHeader {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    teacher_id: r.get(2)?,
                    name: r.get(3)?,
                    term: r.get(4)?,
                    fiscal_year: r.get(5)?,
                    section: r.get(6)?,
                })
            },
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some(exam) = exam else {
        return Err(CalcError::new("not_found", "exam not found"));
    };

    let mut students_stmt = conn
        .prepare(
            "SELECT id, roll_no, last_name, first_name, sort_order
             FROM students
             WHERE class_id = ? AND active = 1
             ORDER BY sort_order, roll_no",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let students: Vec<SnapshotStudent> = students_stmt
        .query_map([&exam.class_id], |r| {
            Ok(SnapshotStudent {
                id: r.get(0)?,
                roll_no: r.get(1)?,
                last_name: r.get(2)?,
                first_name: r.get(3)?,
                sort_order: r.get(4)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut subjects_stmt = conn
        .prepare(
            "SELECT id, name, code, full_mark, pass_mark, has_conversion, convert_to_mark, sort_order
             FROM subjects
             WHERE class_id = ?
             ORDER BY sort_order, name",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let mut subjects: Vec<SnapshotSubject> = subjects_stmt
        .query_map([&exam.class_id], |r| {
            Ok(SnapshotSubject {
                id: r.get(0)?,
                name: r.get(1)?,
                code: r.get(2)?,
                defaults: ScaleValues {
                    full_mark: r.get(3)?,
                    pass_mark: r.get(4)?,
                    has_conversion: r.get::<_, i64>(5)? != 0,
                    convert_to_mark: r.get(6)?,
                },
                parts: Vec::new(),
                sort_order: r.get(7)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut parts_stmt = conn
        .prepare(
            "SELECT p.id, p.subject_id, p.name, p.part_type, p.full_mark, p.pass_mark,
                    p.has_conversion, p.convert_to_mark, p.sort_order
             FROM subject_parts p
             JOIN subjects s ON s.id = p.subject_id
             WHERE s.class_id = ?
             ORDER BY p.sort_order, p.name",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let parts: Vec<(String, SnapshotPart)> = parts_stmt
        .query_map([&exam.class_id], |r| {
            let subject_id: String = r.get(1)?;
            Ok((
                subject_id,
                SnapshotPart {
                    id: r.get(0)?,
                    name: r.get(2)?,
                    part_type: r.get(3)?,
                    defaults: ScaleValues {
                        full_mark: r.get(4)?,
                        pass_mark: r.get(5)?,
                        has_conversion: r.get::<_, i64>(6)? != 0,
                        convert_to_mark: r.get(7)?,
                    },
                    sort_order: r.get(8)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    for (subject_id, part) in parts {
        if let Some(subject) = subjects.iter_mut().find(|s| s.id == subject_id) {
            subject.parts.push(part);
        }
    }

    let mut overrides = ExamOverrides::default();
    let mut overrides_stmt = conn
        .prepare(
            "SELECT subject_id, subject_part_id, full_mark, pass_mark, has_conversion, convert_to_mark
             FROM exam_scale_overrides
             WHERE exam_id = ?",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let override_rows: Vec<(Option<String>, Option<String>, ScaleValues)> = overrides_stmt
        .query_map([exam_id], |r| {
            Ok((
                r.get::<_, Option<String>>(0)?,
                r.get::<_, Option<String>>(1)?,
                ScaleValues {
                    full_mark: r.get(2)?,
                    pass_mark: r.get(3)?,
                    has_conversion: r.get::<_, i64>(4)? != 0,
                    convert_to_mark: r.get(5)?,
                },
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    for (subject_id, part_id, values) in override_rows {
        if let Some(part_id) = part_id {
            overrides.by_part.insert(part_id, values);
        } else if let Some(subject_id) = subject_id {
            overrides.by_subject.insert(subject_id, values);
        }
    }

    let mut marks_stmt = conn
        .prepare(
            "SELECT student_id, subject_id, subject_part_id, obtained
             FROM marks
             WHERE exam_id = ?
             ORDER BY student_id, subject_id, subject_part_id",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let marks: Vec<SnapshotMark> = marks_stmt
        .query_map([exam_id], |r| {
            let part_id: String = r.get(2)?;
            Ok(SnapshotMark {
                student_id: r.get(0)?,
                subject_id: r.get(1)?,
                subject_part_id: if part_id.is_empty() { None } else { Some(part_id) },
                obtained: r.get(3)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    Ok(ExamSnapshot {
        exam,
        students,
        subjects,
        overrides,
        marks,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Theory,
    Practical,
}

/// Theory/Practical bucketing for session breakdowns. The type code wins
/// over the name; anything that matches neither counts as Theory, the same
/// bucket unparted subjects fall into.
pub fn classify_part_kind(part_type: Option<&str>, part_name: &str) -> PartKind {
    let ty = part_type.unwrap_or("").trim().to_ascii_uppercase();
    if ty == "TH" {
        return PartKind::Theory;
    }
    if ty == "PR" {
        return PartKind::Practical;
    }
    let name = part_name.to_ascii_uppercase();
    if name.contains("THEORY") {
        return PartKind::Theory;
    }
    if name.contains("PRACT") {
        return PartKind::Practical;
    }
    PartKind::Theory
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExamItem {
    pub exam_id: String,
    pub exam_name: String,
    pub term: Option<String>,
    pub total: f64,
    pub max_total: f64,
    pub percentage: f64,
    pub grade: String,
    pub division: String,
    pub rank: i64,
    pub is_published: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSubjectRow {
    pub subject_id: String,
    pub subject_name: String,
    pub th_total: f64,
    pub pr_total: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSubjectTotals {
    pub th_total: f64,
    pub pr_total: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub items: Vec<SessionExamItem>,
    pub grand_total: f64,
    pub avg_percent: f64,
    pub subjects: Vec<SessionSubjectRow>,
    pub subject_totals: SessionSubjectTotals,
}

/// Session-level aggregation for one student: persisted results summed and
/// averaged across every exam sharing the (class, fiscal year) scope, plus a
/// Theory/Practical subject breakdown recomputed from raw marks with each
/// exam's currently-effective scales.
pub fn compute_session_summary(
    conn: &Connection,
    student_id: &str,
    class_id: &str,
    fiscal_year: &str,
) -> Result<SessionSummary, CalcError> {
    let mut exams_stmt = conn
        .prepare(
            "SELECT id, name, term
             FROM exams
             WHERE class_id = ? AND fiscal_year = ?
             ORDER BY sort_order, name",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let exams: Vec<(String, String, Option<String>)> = exams_stmt
        .query_map((class_id, fiscal_year), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut results_stmt = conn
        .prepare(
            "SELECT exam_id, total, max_total, percentage, grade, division, rank, is_published
             FROM results
             WHERE student_id = ? AND class_id = ? AND fiscal_year = ?",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let result_rows: Vec<(String, f64, f64, f64, String, String, i64, bool)> = results_stmt
        .query_map((student_id, class_id, fiscal_year), |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get::<_, i64>(7)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let mut results_by_exam: HashMap<String, (f64, f64, f64, String, String, i64, bool)> =
        HashMap::new();
    for (exam_id, total, max_total, percentage, grade, division, rank, published) in result_rows {
        results_by_exam.insert(
            exam_id,
            (total, max_total, percentage, grade, division, rank, published),
        );
    }

    let mut items: Vec<SessionExamItem> = Vec::new();
    for (exam_id, exam_name, term) in &exams {
        let Some((total, max_total, percentage, grade, division, rank, published)) =
            results_by_exam.get(exam_id)
        else {
            continue;
        };
        items.push(SessionExamItem {
            exam_id: exam_id.clone(),
            exam_name: exam_name.clone(),
            term: term.clone(),
            total: *total,
            max_total: *max_total,
            percentage: *percentage,
            grade: grade.clone(),
            division: division.clone(),
            rank: *rank,
            is_published: *published,
        });
    }

    let grand_total = round_off_2_decimals(items.iter().map(|i| i.total).sum::<f64>());
    let avg_percent = if items.is_empty() {
        0.0
    } else {
        round_off_2_decimals(
            items.iter().map(|i| i.percentage).sum::<f64>() / items.len() as f64,
        )
    };

    // Subject breakdown spans raw marks of every exam in scope, bucketed by
    // part kind. Subject order follows the class subject ordering.
    let mut subject_order: Vec<(String, String)> = Vec::new();
    let mut th_by_subject: HashMap<String, f64> = HashMap::new();
    let mut pr_by_subject: HashMap<String, f64> = HashMap::new();
    for (exam_id, _, _) in &exams {
        let snapshot = load_exam_snapshot(&CalcContext {
            conn,
            exam_id: exam_id.as_str(),
        })?;
        if subject_order.is_empty() {
            for subject in &snapshot.subjects {
                subject_order.push((subject.id.clone(), subject.name.clone()));
            }
        }
        let units = scoring_units(&snapshot);
        let mut unit_index: HashMap<(&str, &str), &ScoringUnit> = HashMap::new();
        for unit in &units {
            unit_index.insert(
                (unit.subject_id.as_str(), unit.part_id.as_deref().unwrap_or("")),
                unit,
            );
        }
        for mark in snapshot.marks.iter().filter(|m| m.student_id == student_id) {
            let key = (
                mark.subject_id.as_str(),
                mark.subject_part_id.as_deref().unwrap_or(""),
            );
            let Some(unit) = unit_index.get(&key) else {
                continue;
            };
            let converted = convert_mark(mark.obtained, &unit.scale);
            let kind = match &unit.part_id {
                None => PartKind::Theory,
                Some(_) => classify_part_kind(
                    unit.part_type.as_deref(),
                    unit.part_name.as_deref().unwrap_or(""),
                ),
            };
            let bucket = match kind {
                PartKind::Theory => th_by_subject.entry(mark.subject_id.clone()).or_insert(0.0),
                PartKind::Practical => {
                    pr_by_subject.entry(mark.subject_id.clone()).or_insert(0.0)
                }
            };
            *bucket += converted;
        }
    }

    let mut subjects: Vec<SessionSubjectRow> = Vec::new();
    for (subject_id, subject_name) in subject_order {
        let th = round_off_2_decimals(th_by_subject.get(&subject_id).copied().unwrap_or(0.0));
        let pr = round_off_2_decimals(pr_by_subject.get(&subject_id).copied().unwrap_or(0.0));
        subjects.push(SessionSubjectRow {
            subject_id,
            subject_name,
            th_total: th,
            pr_total: pr,
            total: round_off_2_decimals(th + pr),
        });
    }
    let th_total = round_off_2_decimals(subjects.iter().map(|s| s.th_total).sum::<f64>());
    let pr_total = round_off_2_decimals(subjects.iter().map(|s| s.pr_total).sum::<f64>());
    let subject_totals = SessionSubjectTotals {
        th_total,
        pr_total,
        total: round_off_2_decimals(th_total + pr_total),
    };

    Ok(SessionSummary {
        items,
        grand_total,
        avg_percent,
        subjects,
        subject_totals,
    })
}
