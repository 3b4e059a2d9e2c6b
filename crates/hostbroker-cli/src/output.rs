//! Rendering results for the terminal

use clap::ValueEnum;
use hostbroker_inventory::fields::{ProviderActions, resolve_field, resolve_fields};
use hostbroker_inventory::{InventoryEntry, InventoryField};
use serde_json::Value;

/// How `execute` prints its result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Strings as-is, anything else as compact JSON
    #[default]
    Raw,
    /// YAML document
    Yaml,
    /// Pretty JSON
    Json,
}

/// Render a value in `format`
///
/// # Errors
/// Returns a serialization error
pub fn render(value: &Value, format: OutputFormat) -> eyre::Result<String> {
    Ok(match format {
        OutputFormat::Raw => match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        },
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
    })
}

/// Inventory as an aligned table, one row per entry with its index first
#[must_use]
pub fn inventory_table(
    entries: &[InventoryEntry],
    fields: &[InventoryField],
    actions: &ProviderActions,
) -> String {
    let mut rows = vec![
        std::iter::once("Id".to_string())
            .chain(fields.iter().map(|f| f.label.clone()))
            .collect::<Vec<_>>(),
    ];
    for (index, entry) in entries.iter().enumerate() {
        rows.push(
            std::iter::once(index.to_string())
                .chain(resolve_fields(fields, entry, actions).into_iter().map(|(_, v)| v))
                .collect(),
        );
    }

    let widths: Vec<usize> = (0..=fields.len())
        .map(|col| rows.iter().map(|row| row[col].chars().count()).max().unwrap_or(0))
        .collect();

    rows.iter()
        .map(|row| {
            row.iter()
                .zip(&widths)
                .map(|(cell, width)| format!("{cell:<width$}"))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Short listing: `index: <list vars>` per entry
#[must_use]
pub fn inventory_list(entries: &[InventoryEntry], list_vars: &str, actions: &ProviderActions) -> String {
    entries
        .iter()
        .enumerate()
        .map(|(index, entry)| format!("{index}: {}", resolve_field(list_vars, entry, actions)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use hostbroker_inventory::fields::default_fields;
    use serde_json::json;

    use super::*;

    fn entry(value: Value) -> InventoryEntry {
        InventoryEntry::from(value.as_object().cloned().unwrap())
    }

    fn entries() -> Vec<InventoryEntry> {
        vec![
            entry(json!({
                "hostname": "vm1.example.com",
                "_broker_provider": "AnsibleTower",
                "_broker_args": {"workflow": "deploy-rhel"},
                "os_distribution": "RedHat",
                "os_distribution_version": "9.4"
            })),
            entry(json!({"name": "box", "_broker_provider": "Container"})),
        ]
    }

    fn actions() -> ProviderActions {
        ProviderActions::from([
            ("AnsibleTower".to_string(), vec!["workflow".to_string()]),
            ("Container".to_string(), vec!["container_host".to_string()]),
        ])
    }

    #[test]
    fn test_render_formats() {
        assert_eq!(render(&json!("hello\n"), OutputFormat::Raw).unwrap(), "hello\n");
        assert_eq!(render(&json!({"a": 1}), OutputFormat::Raw).unwrap(), r#"{"a":1}"#);
        assert_eq!(render(&json!({"a": 1}), OutputFormat::Yaml).unwrap(), "a: 1\n");
    }

    #[test]
    fn test_table_has_header_and_rows() {
        let table = inventory_table(&entries(), &default_fields(), &actions());
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Id"));
        assert!(lines[0].contains("Provider"));
        assert!(lines[1].starts_with("0 "));
        assert!(lines[1].contains("vm1.example.com"));
        assert!(lines[1].contains("deploy-rhel"));
        assert!(lines[1].contains("RedHat 9.4"));
        assert!(lines[2].contains("box"));
    }

    #[test]
    fn test_short_listing() {
        let listing = inventory_list(&entries(), "hostname | name", &actions());
        assert_eq!(listing, "0: vm1.example.com\n1: box");
    }
}
