use serde_json::{json, Value};

use crate::cli::OutputFormat;

/// Output a success message in the appropriate format
pub fn output_success(output_format: OutputFormat, message: &str, data: Value) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => {
            let mut response = json!({
                "success": true,
                "message": message
            });
            if let (Some(target), Value::Object(extra)) = (response.as_object_mut(), data) {
                target.extend(extra);
            }
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        OutputFormat::Text => {
            println!("✓ {}", message);
        }
    }
    Ok(())
}

/// Output a record as pretty JSON, or as aligned `key: value` lines
pub fn output_record(output_format: OutputFormat, record: &Value) -> anyhow::Result<()> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(record)?),
        OutputFormat::Text => {
            for line in text_lines(record, "") {
                println!("{}", line);
            }
        }
    }
    Ok(())
}

fn text_lines(value: &Value, prefix: &str) -> Vec<String> {
    match value {
        Value::Object(map) => map
            .iter()
            .flat_map(|(key, inner)| {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                text_lines(inner, &path)
            })
            .collect(),
        Value::String(s) => vec![format!("{:<32} {}", prefix, s)],
        other => vec![format!("{:<32} {}", prefix, other)],
    }
}
