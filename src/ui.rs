use prettytable::{Cell, Row, Table};

use crate::{
    archive::MachineRef,
    commands::{
        backup::Stored,
        restore::{Outcome, Resolution},
    },
};

pub fn print_machines(machines: &[MachineRef]) {
    if machines.is_empty() {
        tracing::info!("<no guests>");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("VMID"),
        Cell::new("Type"),
        Cell::new("Node"),
    ]));
    for m in machines {
        table.add_row(Row::new(vec![
            Cell::new(&m.vmid.to_string()),
            Cell::new(m.kind.as_str()),
            Cell::new(m.node.as_deref().unwrap_or("-")),
        ]));
    }
    table.printstd();
}

pub fn print_backup(stored: &[Stored]) {
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Guest"),
        Cell::new("Archive"),
        Cell::new("Bytes"),
    ]));
    for s in stored {
        let (archive, bytes) = match &s.outcome {
            Ok((name, n)) => (name.clone(), n.to_string()),
            Err(e) => (format!("FAILED: {e}"), "-".to_string()),
        };
        table.add_row(Row::new(vec![
            Cell::new(&s.machine.to_string()),
            Cell::new(&archive),
            Cell::new(&bytes),
        ]));
    }
    table.printstd();
}

pub fn print_restore(resolutions: &[Resolution]) {
    if resolutions.is_empty() {
        tracing::info!("<no records>");
        return;
    }
    let mut table = Table::new();
    table.set_titles(Row::new(vec![
        Cell::new("Record"),
        Cell::new("Result"),
        Cell::new("Staged as"),
    ]));
    for r in resolutions {
        let staged = match &r.outcome {
            Outcome::Restored { staged, .. } => staged.display().to_string(),
            _ => "-".to_string(),
        };
        table.add_row(Row::new(vec![
            Cell::new(&r.pathname),
            Cell::new(&r.outcome.to_string()),
            Cell::new(&staged),
        ]));
    }
    table.printstd();
}
