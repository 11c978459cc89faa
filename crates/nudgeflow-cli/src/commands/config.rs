use clap::{Subcommand, ValueEnum};
use nudgeflow_core::{Config, RuleEngine};

use super::{print_json, CliResult};

#[derive(Clone, Copy, ValueEnum)]
pub enum Section {
    Buckets,
    Playbook,
    Selection,
    Lifecycle,
    Signals,
    Rules,
    Classification,
}

impl Section {
    fn key(self) -> &'static str {
        match self {
            Section::Buckets => "buckets",
            Section::Playbook => "playbook",
            Section::Selection => "selection",
            Section::Lifecycle => "lifecycle",
            Section::Signals => "signals",
            Section::Rules => "rules",
            Section::Classification => "classification",
        }
    }
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the config, or one section of it, as JSON
    Show {
        #[arg(value_enum)]
        section: Option<Section>,
    },
    /// Print one value (e.g. "selection.selector_timeout_ms")
    Get { key: String },
    /// Change one value; the result must still validate
    Set { key: String, value: String },
    /// Built-in rules and whether each is enabled
    Rules,
    /// Stop evaluating a built-in rule
    Disable { rule_id: String },
    /// Evaluate a previously disabled rule again
    Enable { rule_id: String },
    /// Location of the config file
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

pub fn run(action: ConfigAction) -> CliResult {
    match action {
        ConfigAction::Show { section } => {
            let config = serde_json::to_value(Config::load()?)?;
            match section {
                Some(section) => print_json(&config[section.key()]),
                None => print_json(&config),
            }
        }
        ConfigAction::Get { key } => {
            let value = Config::load()?.get(&key).ok_or_else(|| format!("unknown key: {key}"))?;
            println!("{value}");
            Ok(())
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            println!("{key} = {}", config.get(&key).unwrap_or(value));
            Ok(())
        }
        ConfigAction::Rules => {
            let config = Config::load()?;
            let engine = RuleEngine::with_builtin_rules();
            let rules: Vec<serde_json::Value> = engine
                .rules()
                .map(|rule| {
                    serde_json::json!({
                        "id": rule.id(),
                        "name": rule.name(),
                        "priority": rule.priority(),
                        "enabled": !config.rules.disabled.iter().any(|d| d == rule.id()),
                    })
                })
                .collect();
            print_json(&rules)
        }
        ConfigAction::Disable { rule_id } => toggle_rule(&rule_id, false),
        ConfigAction::Enable { rule_id } => toggle_rule(&rule_id, true),
        ConfigAction::Path => {
            println!("{}", Config::path()?.display());
            Ok(())
        }
        ConfigAction::Reset => {
            Config::default().save()?;
            println!("config reset to defaults");
            Ok(())
        }
    }
}

fn toggle_rule(rule_id: &str, enabled: bool) -> CliResult {
    if !RuleEngine::with_builtin_rules().rules().any(|r| r.id() == rule_id) {
        return Err(format!("unknown rule: {rule_id}").into());
    }

    let mut config = Config::load()?;
    config.rules.disabled.retain(|id| id != rule_id);
    if !enabled {
        config.rules.disabled.push(rule_id.to_string());
    }
    config.save()?;
    println!("{rule_id} {}", if enabled { "enabled" } else { "disabled" });
    Ok(())
}
