use anyhow::Result;
use folio_db::{
    Migration, MigrationRecord, MigrationReport, MigrationState, MigrationStatus, RollbackReport,
};
use serde::Serialize;
use serde_json::json;

pub fn migration_report(report: &MigrationReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    match report.batch {
        None => println!("Already up to date."),
        Some(batch) => {
            println!(
                "Batch {batch}: applied {} migration{} in {} ms",
                report.applied.len(),
                plural(report.applied.len()),
                report.elapsed_ms
            );
            for id in &report.applied {
                println!("  + {id}");
            }
        }
    }
    Ok(())
}

pub fn rollback_report(report: &RollbackReport, json: bool) -> Result<()> {
    if json {
        return print_json(report);
    }
    if report.reverted.is_empty() {
        println!("Nothing to roll back.");
        return Ok(());
    }
    println!(
        "Rolled back {} migration{} in {} ms",
        report.reverted.len(),
        plural(report.reverted.len()),
        report.elapsed_ms
    );
    for id in &report.reverted {
        println!("  - {id}");
    }
    Ok(())
}

pub fn pending(migrations: &[&Migration], json: bool) -> Result<()> {
    if json {
        let list: Vec<_> = migrations
            .iter()
            .map(|m| json!({ "identifier": m.id, "lossy": m.lossy }))
            .collect();
        return print_json(&list);
    }
    if migrations.is_empty() {
        println!("No pending migrations.");
    }
    for m in migrations {
        match &m.lossy {
            Some(_) => println!("{} (lossy)", m.id),
            None => println!("{}", m.id),
        }
    }
    Ok(())
}

pub fn applied(records: &[MigrationRecord], json: bool) -> Result<()> {
    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No migrations applied.");
        return Ok(());
    }
    let rows: Vec<[String; 3]> = records
        .iter()
        .map(|r| {
            [
                r.identifier.to_string(),
                r.batch.to_string(),
                r.applied_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print!("{}", table(["Migration", "Batch", "Applied at"], &rows));
    Ok(())
}

pub fn status(statuses: &[MigrationStatus], json: bool) -> Result<()> {
    if json {
        return print_json(&statuses);
    }
    let rows: Vec<[String; 3]> = statuses.iter().map(status_row).collect();
    print!("{}", table(["Migration", "State", "Batch"], &rows));

    let pending = statuses
        .iter()
        .filter(|s| s.state == MigrationState::Pending)
        .count();
    println!("{} migration{} pending", pending, plural(pending));
    Ok(())
}

fn status_row(status: &MigrationStatus) -> [String; 3] {
    let (state, batch) = match &status.state {
        MigrationState::Applied { batch, .. } => ("applied", batch.to_string()),
        MigrationState::Pending => ("pending", String::new()),
        MigrationState::Missing { batch, .. } => ("MISSING", batch.to_string()),
    };
    let state = match status.lossy {
        Some(_) => format!("{state}, lossy"),
        None => state.to_string(),
    };
    [status.identifier.to_string(), state, batch]
}

/// Box-drawn table, columns sized to their widest cell.
fn table<const N: usize>(headers: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths = headers.map(|h| h.chars().count());
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let rule = |left: &str, mid: &str, right: &str| {
        let parts: Vec<String> = widths.iter().map(|w| "─".repeat(w + 2)).collect();
        format!("{left}{}{right}\n", parts.join(mid))
    };
    let line = |cells: Vec<&str>| {
        let parts: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &w)| format!(" {cell:<w$} "))
            .collect();
        format!("│{}│\n", parts.join("│"))
    };

    let mut out = rule("╭", "┬", "╮");
    out.push_str(&line(headers.to_vec()));
    out.push_str(&rule("├", "┼", "┤"));
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out.push_str(&rule("╰", "┴", "╯"));
    out
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "" } else { "s" }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_pads_columns_to_widest_cell() {
        let rows = vec![
            ["20230115093000_create_identity_users".to_string(), "applied".to_string(), "1".to_string()],
            ["20240120120000_create_habits".to_string(), "pending".to_string(), String::new()],
        ];
        let out = table(["Migration", "State", "Batch"], &rows);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 6);
        assert!(lines[0].starts_with('╭'));
        assert!(lines[1].contains(" Migration "));
        assert!(lines[3].contains("20230115093000_create_identity_users │ applied │ 1     │"));
        let widths: Vec<usize> = lines.iter().map(|l| l.chars().count()).collect();
        assert!(widths.iter().all(|w| *w == widths[0]));
    }

    #[test]
    fn status_rows_flag_lossy_and_missing() {
        let lossy = MigrationStatus {
            identifier: "20240402090000_drop_crm_inquiry_notes".parse().unwrap(),
            state: MigrationState::Pending,
            lossy: Some("notes are lost".into()),
        };
        assert_eq!(status_row(&lossy)[1], "pending, lossy");

        let missing = MigrationStatus {
            identifier: "20230101000000_gone".parse().unwrap(),
            state: MigrationState::Missing {
                batch: 3,
                applied_at: chrono::Utc::now(),
            },
            lossy: None,
        };
        assert_eq!(status_row(&missing)[1..], ["MISSING".to_string(), "3".to_string()]);
    }
}
