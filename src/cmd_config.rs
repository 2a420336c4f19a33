use std::path::Path;

use anyhow::{Result, bail};
use serde_json::Value;

use crate::ConfigAction;
use crate::config::AppConfig;

pub fn run(action: &ConfigAction, config_path: &Path) -> Result<()> {
    match action {
        ConfigAction::Init => cmd_init(config_path),
        ConfigAction::Show => cmd_show(config_path),
        ConfigAction::Set { key, value } => cmd_set(config_path, key, value),
        ConfigAction::Path => {
            println!("{}", config_path.display());
            Ok(())
        }
    }
}

fn cmd_init(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        bail!(
            "Config already exists at {}\nUse 'framescope config set' to modify",
            config_path.display()
        );
    }
    let default = serde_json::to_value(AppConfig::default())?;
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(config_path, serde_json::to_string_pretty(&default)?)?;
    println!("Created {}", config_path.display());
    println!("Edit the file or use 'framescope config set stream.url ws://host:port/ws/live'.");
    Ok(())
}

fn cmd_show(config_path: &Path) -> Result<()> {
    let config = if config_path.exists() {
        AppConfig::load(config_path)?
    } else {
        eprintln!("No config at {}, showing defaults", config_path.display());
        AppConfig::default()
    };
    // Effective values: file merged with defaults and environment
    let effective = config.with_env_overrides()?;
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

fn cmd_set(config_path: &Path, key: &str, value: &str) -> Result<()> {
    let mut json: Value = if config_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(config_path)?)?
    } else {
        if let Some(p) = config_path.parent() {
            std::fs::create_dir_all(p)?;
        }
        serde_json::json!({ "version": 1 })
    };
    set_nested(&mut json, key, value)?;

    let updated: AppConfig = serde_json::from_value(json.clone())
        .map_err(|e| anyhow::anyhow!("Invalid value for {key}: {e}"))?;
    updated.validate()?;

    std::fs::write(config_path, serde_json::to_string_pretty(&json)?)?;
    println!("Set {key} = {value}");
    Ok(())
}

/// Set `key` (dot notation) to `val`, creating intermediate objects.
/// `true`/`false` and unsigned integers are stored typed.
fn set_nested(json: &mut Value, key: &str, val: &str) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        bail!("Empty key");
    };
    if parts.iter().any(|p| p.is_empty()) {
        bail!("Invalid key '{key}'");
    }
    let mut cur = json;
    for p in parents {
        cur = object_mut(cur)
            .entry(p.to_string())
            .or_insert_with(|| serde_json::json!({}));
    }
    let typed = if val == "true" {
        Value::Bool(true)
    } else if val == "false" {
        Value::Bool(false)
    } else if let Ok(n) = val.parse::<u64>() {
        Value::Number(n.into())
    } else {
        Value::String(val.to_string())
    };
    object_mut(cur).insert(last.to_string(), typed);
    Ok(())
}

/// The value as an object, replacing any non-object in place.
fn object_mut(value: &mut Value) -> &mut serde_json::Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(serde_json::Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("replaced with an object above"),
    }
}
