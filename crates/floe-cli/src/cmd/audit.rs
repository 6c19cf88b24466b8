use floe_core::commands::audit::{self, AuditFinding};
use floe_core::commands::util::ArchiveContext;

use crate::dispatch::CmdResult;
use crate::format::format_bytes;

/// Exit status when the inventory references missing or corrupt bags.
const ALERT_EXIT: i32 = 2;

pub(crate) fn run_audit(ctx: &ArchiveContext) -> CmdResult {
    let report = audit::run(ctx)?;

    for finding in &report.findings {
        let detail = match finding {
            AuditFinding::Missing { bag, key } => format!("{bag} missing remotely: {key}"),
            AuditFinding::Orphan { key, size, age_days } => {
                format!("untracked object {key} ({}, {age_days} days old)", format_bytes(*size))
            }
            AuditFinding::WrongClass {
                bag,
                expected,
                actual,
                ..
            } => format!("{bag} stored as {actual}, expected {expected}"),
            AuditFinding::EtagMismatch {
                bag,
                expected,
                actual,
                ..
            } => format!("{bag} etag {actual} does not match recorded {expected}"),
        };
        println!("{:<8} {detail}", finding.severity());
    }

    println!(
        "{} ok, {} alert(s), {} orphan(s), {} finding(s) total",
        report.ok,
        report.alerts().count(),
        report.orphans().count(),
        report.findings.len()
    );
    if report.has_alerts() {
        eprintln!("Alerts need an explicit `floe reset` of the affected bags.");
        return Ok(ALERT_EXIT);
    }
    Ok(0)
}
