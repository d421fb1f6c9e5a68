//! Parsing of the taint-toleration setting.
//!
//! The setting is a `;`-separated list of `key[=value]:effect` entries, where
//! `effect` is one of `NoSchedule`, `PreferNoSchedule` or `NoExecute`. An entry
//! with a value tolerates that exact taint; an entry without one tolerates any
//! taint with the key.

use crate::error::TolerationError;
use crate::types::{TaintEffect, Toleration, TolerationOperator};

/// Parse the setting value. Empty input yields no tolerations.
pub fn parse_tolerations(setting: &str) -> Result<Vec<Toleration>, TolerationError> {
    setting
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(parse_entry)
        .collect()
}

fn parse_entry(entry: &str) -> Result<Toleration, TolerationError> {
    let (selector, effect) = entry
        .rsplit_once(':')
        .ok_or_else(|| TolerationError::MissingEffect(entry.to_string()))?;

    let effect = match effect.trim() {
        "NoSchedule" => TaintEffect::NoSchedule,
        "PreferNoSchedule" => TaintEffect::PreferNoSchedule,
        "NoExecute" => TaintEffect::NoExecute,
        other => {
            return Err(TolerationError::UnknownEffect {
                entry: entry.to_string(),
                effect: other.to_string(),
            })
        }
    };

    let (key, operator, value) = match selector.split_once('=') {
        Some((key, value)) => (key.trim(), TolerationOperator::Equal, value.trim()),
        None => (selector.trim(), TolerationOperator::Exists, ""),
    };

    if key.is_empty() {
        return Err(TolerationError::EmptyKey(entry.to_string()));
    }

    Ok(Toleration {
        key: key.to_string(),
        operator,
        value: value.to_string(),
        effect,
    })
}
