use colored::*;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::models::{IntervalFeatures, QualityStatus, SessionFeatures};

#[derive(Tabled)]
struct IntervalRow {
    #[tabled(rename = "Interval")]
    interval: String,
    #[tabled(rename = "Peak")]
    peak: String,
    #[tabled(rename = "Peak HR")]
    peak_hr: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "R² 0-30")]
    r2_early: String,
    #[tabled(rename = "R² 30-60")]
    r2_mid: String,
    #[tabled(rename = "Tau")]
    tau: String,
    #[tabled(rename = "Reserve")]
    reserve: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Flags / Reason")]
    notes: String,
}

fn colored_status(status: QualityStatus) -> String {
    match status {
        QualityStatus::Pass => status.to_string().green().to_string(),
        QualityStatus::Flagged => status.to_string().yellow().to_string(),
        QualityStatus::Rejected => status.to_string().red().to_string(),
    }
}

fn number(value: Option<f64>, precision: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.*}", precision, v))
}

impl From<&IntervalFeatures> for IntervalRow {
    fn from(interval: &IntervalFeatures) -> Self {
        let r2 = |label: &str| number(interval.r2_by_window.get(label).copied().flatten(), 3);

        let mut notes: Vec<String> = interval.flags.iter().map(|f| f.to_string()).collect();
        if let Some(reason) = &interval.rejection_reason {
            notes.push(reason.clone());
        }

        IntervalRow {
            interval: interval.interval_id.clone(),
            peak: interval.peak_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            peak_hr: format!("{:.0}", interval.peak_hr_bpm),
            duration: format!("{:.0}s", interval.duration_sec),
            r2_early: r2("0-30"),
            r2_mid: r2("30-60"),
            tau: number(interval.tau_sec, 1),
            reserve: number(interval.hr_reserve_bpm, 1),
            status: colored_status(interval.status),
            notes: notes.join(" "),
        }
    }
}

/// Terminal summary: one table of intervals plus per-session override warnings
pub fn render_table(sessions: &[SessionFeatures]) -> String {
    let rows: Vec<IntervalRow> = sessions
        .iter()
        .flat_map(|s| s.intervals.iter())
        .map(IntervalRow::from)
        .collect();

    let mut output = String::new();
    if rows.is_empty() {
        output.push_str(&format!("{}\n", "No recovery intervals detected".yellow()));
    } else {
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        output.push_str(&table.to_string());
        output.push('\n');
    }

    for session in sessions {
        if session.intervals.is_empty() {
            output.push_str(&format!("{} {}\n", session.session_id.bold(), "no intervals".dimmed()));
        }
        for warning in &session.warnings {
            output.push_str(&format!("{} {}\n", "warning:".yellow().bold(), warning));
        }
    }

    output
}
