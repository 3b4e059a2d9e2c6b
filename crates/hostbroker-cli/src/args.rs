//! Free-form `--key value` request arguments

use std::path::Path;

use hostbroker_core::BrokerError;
use serde_json::{Map, Value};

/// Split `VM... --key value ...` into selectors and argument tokens
#[must_use]
pub fn split_selectors(tokens: Vec<String>) -> (Vec<String>, Vec<String>) {
    let split = tokens
        .iter()
        .position(|t| t.starts_with("--"))
        .unwrap_or(tokens.len());
    let mut selectors = tokens;
    let rest = selectors.split_off(split);
    (selectors, rest)
}

/// Parse trailing `--key value` tokens into request arguments
///
/// Dashes in keys become underscores. `--key=value` is accepted, and a key
/// with no value is a `true` flag.
///
/// # Errors
/// Returns `BrokerError::User` for a value with no key
pub fn parse_extra_args(tokens: &[String]) -> Result<Map<String, Value>, BrokerError> {
    let mut args = Map::new();
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        let Some(key) = token.strip_prefix("--") else {
            return Err(BrokerError::User(format!("unexpected argument: {token}")));
        };
        let (key, value) = match key.split_once('=') {
            Some((key, value)) => (key, parse_value(value)),
            None => match iter.next_if(|next| !next.starts_with("--")) {
                Some(value) => (key, parse_value(value)),
                None => (key, Value::Bool(true)),
            },
        };
        if key.is_empty() {
            return Err(BrokerError::User(format!("unexpected argument: {token}")));
        }
        args.insert(key.replace('-', "_"), value);
    }
    Ok(args)
}

/// Interpret a command-line value
///
/// Booleans, plain integers and JSON objects or arrays are decoded; anything
/// else stays a string, so `9.4` remains a version rather than a float.
#[must_use]
pub fn parse_value(raw: &str) -> Value {
    match raw {
        "true" | "True" => return Value::Bool(true),
        "false" | "False" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(n) = raw.parse::<i64>()
        && n.to_string() == raw
    {
        return Value::from(n);
    }
    if (raw.starts_with('{') || raw.starts_with('['))
        && let Ok(value) = serde_json::from_str(raw)
    {
        return value;
    }
    Value::String(raw.to_string())
}

/// Read request arguments from a JSON or YAML file
///
/// # Errors
/// Returns `BrokerError::User` if the file is unreadable or not a mapping
pub fn load_args_file(path: &Path) -> Result<Map<String, Value>, BrokerError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| BrokerError::User(format!("cannot read {}: {e}", path.display())))?;
    let value: Value = serde_yaml::from_str(&content)
        .map_err(|e| BrokerError::User(format!("cannot parse {}: {e}", path.display())))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => Err(BrokerError::User(format!(
            "{} must contain a mapping of arguments",
            path.display()
        ))),
    }
}

/// Arguments from `--args-file` overlaid with command-line arguments
///
/// # Errors
/// Returns the file or parse error
pub fn collect_args(file: Option<&Path>, tokens: &[String]) -> Result<Map<String, Value>, BrokerError> {
    let mut args = match file {
        Some(path) => load_args_file(path)?,
        None => Map::new(),
    };
    args.extend(parse_extra_args(tokens)?);
    Ok(args)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn tokens(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_parse_pairs_and_flags() {
        let args = parse_extra_args(&tokens(&[
            "--workflow",
            "deploy-rhel",
            "--rhel-version",
            "9.4",
            "--provider_labels={\"team\": \"qe\"}",
            "--dry-run",
            "--count",
            "3",
        ]))
        .unwrap();
        assert_eq!(args["workflow"], json!("deploy-rhel"));
        assert_eq!(args["rhel_version"], json!("9.4"));
        assert_eq!(args["provider_labels"], json!({"team": "qe"}));
        assert_eq!(args["dry_run"], json!(true));
        assert_eq!(args["count"], json!(3));
    }

    #[test]
    fn test_trailing_flag() {
        let args = parse_extra_args(&tokens(&["--name", "box", "--pull"])).unwrap();
        assert_eq!(args["pull"], json!(true));
    }

    #[test]
    fn test_value_without_key_rejected() {
        let err = parse_extra_args(&tokens(&["deploy-rhel"])).unwrap_err();
        assert!(matches!(err, BrokerError::User(_)));
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("false"), json!(false));
        assert_eq!(parse_value("0042"), json!("0042"));
        assert_eq!(parse_value("-7"), json!(-7));
        assert_eq!(parse_value("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_value("{not json"), json!("{not json"));
    }

    #[test]
    fn test_split_selectors() {
        let (selectors, rest) =
            split_selectors(tokens(&["vm1", "0", "--new-expire-time", "+3600"]));
        assert_eq!(selectors, vec!["vm1", "0"]);
        assert_eq!(rest, vec!["--new-expire-time", "+3600"]);

        let (selectors, rest) = split_selectors(tokens(&["vm1"]));
        assert_eq!(selectors, vec!["vm1"]);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_command_line_overrides_args_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workflow: deploy-rhel\nrhel_version: '8.10'").unwrap();

        let args = collect_args(Some(file.path()), &tokens(&["--rhel-version", "9.4"])).unwrap();
        assert_eq!(args["workflow"], json!("deploy-rhel"));
        assert_eq!(args["rhel_version"], json!("9.4"));
    }

    #[test]
    fn test_args_file_must_be_mapping() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "- one\n- two").unwrap();
        assert!(load_args_file(file.path()).is_err());
    }
}
