use chrono::{Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Display rounding used on report cards: half-up to 2 decimals.
/// The engine itself keeps full precision; only the IPC layer rounds.
pub fn round_display_2(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl EngineError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    #[serde(rename = "trimestre1")]
    Trimestre1,
    #[serde(rename = "trimestre2")]
    Trimestre2,
    #[serde(rename = "trimestre3")]
    Trimestre3,
}

impl Term {
    pub fn parse(raw: &str) -> Option<Term> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "trimestre1" | "t1" => Some(Term::Trimestre1),
            "trimestre2" | "t2" => Some(Term::Trimestre2),
            "trimestre3" | "t3" => Some(Term::Trimestre3),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Term::Trimestre1 => "trimestre1",
            Term::Trimestre2 => "trimestre2",
            Term::Trimestre3 => "trimestre3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradeKind {
    #[serde(rename = "devoir")]
    Devoir,
    #[serde(rename = "composition")]
    Composition,
    #[serde(rename = "examen")]
    Examen,
}

impl GradeKind {
    pub fn parse(raw: &str) -> Option<GradeKind> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "devoir" => Some(GradeKind::Devoir),
            "composition" => Some(GradeKind::Composition),
            "examen" => Some(GradeKind::Examen),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            GradeKind::Devoir => "devoir",
            GradeKind::Composition => "composition",
            GradeKind::Examen => "examen",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttendanceStatus {
    #[serde(rename = "present")]
    Present,
    #[serde(rename = "absent")]
    Absent,
    #[serde(rename = "late")]
    Late,
    #[serde(rename = "excused")]
    Excused,
}

impl AttendanceStatus {
    pub fn parse(raw: &str) -> Option<AttendanceStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "present" => Some(AttendanceStatus::Present),
            "absent" => Some(AttendanceStatus::Absent),
            "late" => Some(AttendanceStatus::Late),
            "excused" => Some(AttendanceStatus::Excused),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Absent => "absent",
            AttendanceStatus::Late => "late",
            AttendanceStatus::Excused => "excused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceWindow {
    Week,
    Month,
}

impl AttendanceWindow {
    pub fn parse(raw: &str) -> Option<AttendanceWindow> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "week" => Some(AttendanceWindow::Week),
            "month" => Some(AttendanceWindow::Month),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttendanceWindow::Week => "week",
            AttendanceWindow::Month => "month",
        }
    }

    /// Trailing window start for a given `now`. The week window is a fixed
    /// 7-day offset; the month window is a calendar month subtraction,
    /// clamped to the last day of the shorter month (Mar 31 -> Feb 28/29).
    pub fn start_date(self, now: NaiveDate) -> NaiveDate {
        match self {
            AttendanceWindow::Week => now - Duration::days(7),
            AttendanceWindow::Month => now
                .checked_sub_months(Months::new(1))
                .unwrap_or(NaiveDate::MIN),
        }
    }
}

/// Appreciation bands, inclusive lower bounds evaluated top-down.
/// Shared by per-subject averages and the general average so the two
/// call sites can never disagree on thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Appreciation {
    #[serde(rename = "Très bien")]
    TresBien,
    #[serde(rename = "Bien")]
    Bien,
    #[serde(rename = "Assez bien")]
    AssezBien,
    #[serde(rename = "Passable")]
    Passable,
    #[serde(rename = "Insuffisant")]
    Insuffisant,
}

impl Appreciation {
    pub fn from_average(average: f64) -> Appreciation {
        if average >= 16.0 {
            Appreciation::TresBien
        } else if average >= 14.0 {
            Appreciation::Bien
        } else if average >= 12.0 {
            Appreciation::AssezBien
        } else if average >= 10.0 {
            Appreciation::Passable
        } else {
            Appreciation::Insuffisant
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Appreciation::TresBien => "Très bien",
            Appreciation::Bien => "Bien",
            Appreciation::AssezBien => "Assez bien",
            Appreciation::Passable => "Passable",
            Appreciation::Insuffisant => "Insuffisant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeSnapshot {
    pub student_id: String,
    pub subject_id: String,
    pub value: f64,
    pub max_value: f64,
    pub kind: GradeKind,
    pub date: Option<String>,
    pub term: Term,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSnapshot {
    pub id: String,
    pub name: String,
    pub code: String,
    pub coefficient: i64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttendanceSnapshot {
    pub date: NaiveDate,
    pub status: AttendanceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAverage {
    pub subject: SubjectSnapshot,
    pub average: f64,
    pub source_grades: Vec<GradeSnapshot>,
    pub coefficient: i64,
    pub appreciation: Appreciation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentReport {
    pub student_id: String,
    pub term: Term,
    pub subject_averages: Vec<SubjectAverage>,
    pub general_average: f64,
    pub rank: usize,
    pub total_students: usize,
    pub appreciation: Appreciation,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightedAverage {
    pub average: f64,
    pub coefficient: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ranking {
    pub rank: usize,
    pub total_students: usize,
}

#[derive(Debug, Clone)]
pub struct ClassmateAverage {
    pub student_id: String,
    pub general_average: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AttendanceStats {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub late: usize,
    pub excused: usize,
}

impl AttendanceStats {
    /// Presence rate for display, rounded to whole percent. 0 when the
    /// window holds no records.
    pub fn presence_rate_percent(&self) -> i64 {
        if self.total == 0 {
            return 0;
        }
        (100.0 * self.present as f64 / self.total as f64).round() as i64
    }
}

/// Rescale a raw score to the common 0..20 range. Grades are never averaged
/// on their raw scale.
pub fn normalize_score(value: f64, max_value: f64) -> Result<f64, EngineError> {
    if max_value <= 0.0 {
        return Err(EngineError::new(
            "invalid_max_value",
            format!("maxValue must be positive, got {}", max_value),
        ));
    }
    Ok(value / max_value * 20.0)
}

/// Arithmetic mean of normalized scores for one (student, subject, term)
/// slice. Empty input is not an error: a subject with no grades averages 0.
/// Grade kind carries no weight here; a devoir and an examen count equally.
pub fn subject_average(grades: &[GradeSnapshot]) -> Result<f64, EngineError> {
    if grades.is_empty() {
        return Ok(0.0);
    }
    let mut sum = 0.0_f64;
    for g in grades {
        sum += normalize_score(g.value, g.max_value)?;
    }
    Ok(sum / grades.len() as f64)
}

/// Coefficient-weighted mean over every registered subject for the term.
/// Subjects with no recorded grades still participate with average 0; a
/// newly registered subject therefore lowers the general average until its
/// first grade lands. Skipping ungraded subjects would reorder ranks, so
/// this stays as-is.
pub fn general_average(parts: &[WeightedAverage]) -> Result<f64, EngineError> {
    let mut weighted_sum = 0.0_f64;
    let mut coefficient_sum = 0_i64;
    for p in parts {
        if p.coefficient < 0 {
            return Err(EngineError::new(
                "invalid_coefficient",
                format!("coefficient must not be negative, got {}", p.coefficient),
            ));
        }
        weighted_sum += p.average * p.coefficient as f64;
        coefficient_sum += p.coefficient;
    }
    if coefficient_sum == 0 {
        return Ok(0.0);
    }
    Ok(weighted_sum / coefficient_sum as f64)
}

/// Standard competition ranking: sort descending, rank = 1 + index of the
/// first value <= target. Ties share the best rank and the next distinct
/// value skips ahead by the tie-group size (90, 85, 85, 80 -> 1, 2, 2, 4).
/// `total_students` is the roster size fed in, whether or not every member
/// has recorded grades.
pub fn rank_among(target: f64, classmate_averages: &[f64]) -> Ranking {
    let mut sorted = classmate_averages.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(Ordering::Equal));
    let rank = 1 + sorted
        .iter()
        .position(|v| *v <= target)
        .unwrap_or(sorted.len());
    Ranking {
        rank,
        total_students: sorted.len(),
    }
}

/// Assemble the full report for one (student, term) snapshot.
///
/// `grades` must already be filtered to the student and term. `classmates`
/// holds one entry per roster member of the student's class, each general
/// average computed with the same formula; the target student must appear
/// in it, otherwise ranking would silently degrade to rank 1 of 0.
pub fn build_student_report(
    student_id: &str,
    subjects: &[SubjectSnapshot],
    grades: &[GradeSnapshot],
    classmates: &[ClassmateAverage],
    term: Term,
) -> Result<StudentReport, EngineError> {
    if !classmates.iter().any(|c| c.student_id == student_id) {
        return Err(EngineError::new(
            "not_in_roster",
            format!("student {} is not on the ranking roster", student_id),
        ));
    }

    let mut warnings: Vec<String> = Vec::new();
    for g in grades {
        if !subjects.iter().any(|s| s.id == g.subject_id) {
            warnings.push(format!(
                "grade references unregistered subject {}",
                g.subject_id
            ));
        }
    }

    let mut subject_averages: Vec<SubjectAverage> = Vec::with_capacity(subjects.len());
    for subject in subjects {
        let source_grades: Vec<GradeSnapshot> = grades
            .iter()
            .filter(|g| g.subject_id == subject.id)
            .cloned()
            .collect();
        let average = subject_average(&source_grades)?;
        subject_averages.push(SubjectAverage {
            subject: subject.clone(),
            average,
            coefficient: subject.coefficient,
            appreciation: Appreciation::from_average(average),
            source_grades,
        });
    }

    let parts: Vec<WeightedAverage> = subject_averages
        .iter()
        .map(|sa| WeightedAverage {
            average: sa.average,
            coefficient: sa.coefficient,
        })
        .collect();
    let general = general_average(&parts)?;

    let averages: Vec<f64> = classmates.iter().map(|c| c.general_average).collect();
    let ranking = rank_among(general, &averages);

    Ok(StudentReport {
        student_id: student_id.to_string(),
        term,
        subject_averages,
        general_average: general,
        rank: ranking.rank,
        total_students: ranking.total_students,
        appreciation: Appreciation::from_average(general),
        warnings,
    })
}

/// Count per-status attendance over a trailing window, inclusive on both
/// ends. Records outside the window are ignored; `total` is the sum of the
/// four status counts.
pub fn attendance_stats(
    records: &[AttendanceSnapshot],
    window: AttendanceWindow,
    now: NaiveDate,
) -> AttendanceStats {
    let start = window.start_date(now);
    let mut stats = AttendanceStats {
        total: 0,
        present: 0,
        absent: 0,
        late: 0,
        excused: 0,
    };
    for r in records {
        if r.date < start || r.date > now {
            continue;
        }
        stats.total += 1;
        match r.status {
            AttendanceStatus::Present => stats.present += 1,
            AttendanceStatus::Absent => stats.absent += 1,
            AttendanceStatus::Late => stats.late += 1,
            AttendanceStatus::Excused => stats.excused += 1,
        }
    }
    stats
}
