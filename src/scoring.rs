use serde::Serialize;
use std::cmp::Ordering;

use crate::store::ExamRecord;

/// Two ranking keys tie when averages differ by less than this and
/// total marks are exactly equal. Shared ranks follow competition
/// ranking: a 3-way tie for 1st is followed by rank 4.
pub const SHARED_RANK_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Serialize)]
pub struct CoreError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grade {
    pub label: &'static str,
    pub points: i64,
    pub color: &'static str,
}

// Descending threshold ladders, first match wins. The CQ ladder is
// also the default for any exam type other than MCQ.
const CQ_LADDER: [(f64, &str, i64); 5] = [
    (85.0, "Superb", 20),
    (70.0, "Good", 15),
    (50.0, "Average", 0),
    (33.0, "Poor", -10),
    (20.0, "Fail", -15),
];
const MCQ_LADDER: [(f64, &str, i64); 5] = [
    (93.0, "Superb", 20),
    (77.0, "Good", 15),
    (55.0, "Average", 0),
    (40.0, "Poor", -10),
    (30.0, "Fail", -15),
];

pub fn percentage(mark_obtained: i64, total_marks: i64) -> f64 {
    if total_marks > 0 {
        100.0 * (mark_obtained as f64) / (total_marks as f64)
    } else {
        0.0
    }
}

fn is_mcq(exam_type_name: &str) -> bool {
    exam_type_name.trim().eq_ignore_ascii_case("MCQ")
}

/// Grade labels, point deltas and display colors are hardcoded here.
/// The grade_scales table carries the same labels for chart coloring
/// but is never the authority for scoring; changing it does not
/// change point totals.
pub fn grade_and_points(percentage: f64, exam_type_name: &str) -> Grade {
    let ladder = if is_mcq(exam_type_name) {
        &MCQ_LADDER
    } else {
        &CQ_LADDER
    };
    for &(threshold, label, points) in ladder {
        if percentage >= threshold {
            return Grade {
                label,
                points,
                color: grade_color(label),
            };
        }
    }
    Grade {
        label: "Horrible",
        points: -20,
        color: grade_color("Horrible"),
    }
}

pub fn grade_color(label: &str) -> &'static str {
    match label {
        "Superb" => "#A7F3D0",
        "Good" => "#D1FAE5",
        "Average" => "#FEF08A",
        "Poor" => "#FDE68A",
        "Fail" => "#FECACA",
        "Horrible" => "#FCA5A5",
        _ => "#000000",
    }
}

pub fn exam_grade(exam: &ExamRecord) -> Grade {
    grade_and_points(
        percentage(exam.mark_obtained, exam.total_marks),
        &exam.exam_type_name,
    )
}

/// Reporting-only high-performance threshold, distinct from the
/// grading ladder: CQ >= 80%, MCQ >= 85%. Other exam types never
/// count as excellent.
pub fn is_excellent(percentage: f64, exam_type_name: &str) -> bool {
    let name = exam_type_name.trim().to_ascii_uppercase();
    match name.as_str() {
        "MCQ" => percentage >= 85.0,
        "CQ" => percentage >= 80.0,
        _ => false,
    }
}

pub fn excellence_rate(exams: &[ExamRecord], unique_count: usize) -> f64 {
    if unique_count == 0 {
        return 0.0;
    }
    let excellent = exams
        .iter()
        .filter(|e| {
            is_excellent(
                percentage(e.mark_obtained, e.total_marks),
                &e.exam_type_name,
            )
        })
        .count();
    100.0 * (excellent as f64) / (unique_count as f64)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetStats {
    pub average_percentage: f64,
    pub unique_count: usize,
    pub record_count: usize,
    pub total_obtained: f64,
    pub total_possible: f64,
}

/// Mark-weighted aggregate over an arbitrary exam set. The average is
/// 100 * sum(obtained) / sum(total), not the arithmetic mean of the
/// per-exam percentages. Grouped bulk entries share one exam_no, so
/// counting distinct exam_no values collapses them to one logical
/// exam each.
pub fn aggregate(exams: &[ExamRecord]) -> SetStats {
    let mut total_obtained = 0.0_f64;
    let mut total_possible = 0.0_f64;
    let mut exam_nos: Vec<i64> = Vec::with_capacity(exams.len());
    for e in exams {
        total_obtained += e.mark_obtained as f64;
        total_possible += e.total_marks as f64;
        exam_nos.push(e.exam_no);
    }
    exam_nos.sort_unstable();
    exam_nos.dedup();

    let average_percentage = if total_possible > 0.0 {
        100.0 * total_obtained / total_possible
    } else {
        0.0
    };

    SetStats {
        average_percentage,
        unique_count: exam_nos.len(),
        record_count: exams.len(),
        total_obtained,
        total_possible,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RankKey {
    pub average_percentage: f64,
    pub total_marks: f64,
}

impl RankKey {
    pub fn ties_with(&self, other: &RankKey) -> bool {
        (self.average_percentage - other.average_percentage).abs() < SHARED_RANK_TOLERANCE
            && self.total_marks == other.total_marks
    }

    fn cmp_descending(&self, other: &RankKey) -> Ordering {
        other
            .average_percentage
            .partial_cmp(&self.average_percentage)
            .unwrap_or(Ordering::Equal)
            .then(
                other
                    .total_marks
                    .partial_cmp(&self.total_marks)
                    .unwrap_or(Ordering::Equal),
            )
    }
}

#[derive(Debug, Clone)]
pub struct Ranked<T> {
    pub rank: usize,
    pub key: RankKey,
    pub item: T,
}

/// Tie-aware descending ranker shared by the global, per-subject and
/// per-month scopes. Entries tied on both keys receive the same rank;
/// the next distinct entry gets its 1-indexed position, so ranks skip
/// numbers after a tie block.
pub fn rank_descending<T>(mut entries: Vec<(RankKey, T)>) -> Vec<Ranked<T>> {
    entries.sort_by(|a, b| a.0.cmp_descending(&b.0));

    let mut out: Vec<Ranked<T>> = Vec::with_capacity(entries.len());
    let mut current_rank = 1usize;
    let mut previous: Option<RankKey> = None;
    for (idx, (key, item)) in entries.into_iter().enumerate() {
        match previous {
            Some(prev) if key.ties_with(&prev) => {}
            _ => current_rank = idx + 1,
        }
        previous = Some(key);
        out.push(Ranked {
            rank: current_rank,
            key,
            item,
        });
    }
    out
}

/// Whether `key` matches the best key in `ranked` within tolerance.
/// Ties at the top all count as winners.
pub fn tied_for_top<T>(ranked: &[Ranked<T>], key: &RankKey) -> bool {
    ranked
        .first()
        .map(|top| key.ties_with(&top.key))
        .unwrap_or(false)
}
