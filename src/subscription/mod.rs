//! Subscription Table
//!
//! Static, configuration-derived mapping from a topic pattern (exactly as
//! configured) to its [`SubscriptionDefinition`]. The table is built once at
//! startup and only read afterwards: the distribution engine probes it with
//! candidate keys, and the bus adapter subscribes once per entry.
//!
//! # Configuration keys
//!
//! Subscriptions are discovered from the flat property map:
//!
//! ```text
//! mqtt.topic.<id>          = <pattern>
//! mqtt.topic.<id>.qos      = 0 | 1 | 2          (default 0)
//! mqtt.topic.<id>.format   = 0 | 1 | plain | base64   (default plain)
//! mqtt.topic.<id>.name     = <display name>     (default <id>)
//! ```
//!
//! `mqtt.topic.<id>.pattern` is accepted in place of `mqtt.topic.<id>` so a
//! subscription can be written as a TOML table.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use ahash::AHashMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{ConfigError, PropertyMap};
use crate::envelope::QoS;

pub use crate::codec::PayloadFormat;


/// Pattern shape as seen by the distribution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternShape {
    /// Literal topic, matched exactly
    Exact,
    /// `prefix/#`, matches the prefix and everything beneath it
    MultiLevel,
    /// Bare `#`, matches every topic
    Root,
    /// Contains `+` or a non-trailing `#`; never matched
    Unsupported,
}

impl PatternShape {
    pub fn classify(pattern: &str) -> Self {
        if pattern == "#" {
            return PatternShape::Root;
        }
        if let Some(prefix) = pattern.strip_suffix("/#") {
            if !has_wildcard(prefix) {
                return PatternShape::MultiLevel;
            }
            return PatternShape::Unsupported;
        }
        if has_wildcard(pattern) {
            PatternShape::Unsupported
        } else {
            PatternShape::Exact
        }
    }
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['#', '+'])
}

/// One configured subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionDefinition {
    /// Operator-facing identifier
    pub name: String,
    /// Topic pattern, exactly as configured
    pub pattern: String,
    /// Payload encoding for webhook bodies
    pub format: PayloadFormat,
    /// QoS requested when subscribing on the bus
    pub qos: QoS,
}

impl SubscriptionDefinition {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        format: PayloadFormat,
        qos: QoS,
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            format,
            qos,
        }
    }

    pub fn shape(&self) -> PatternShape {
        PatternShape::classify(&self.pattern)
    }
}

/// Key-unique mapping from pattern to definition
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTable {
    entries: AHashMap<String, SubscriptionDefinition>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under its pattern.
    ///
    /// Returns the definition it replaced, if the pattern was already present.
    pub fn insert(&mut self, definition: SubscriptionDefinition) -> Option<SubscriptionDefinition> {
        self.entries.insert(definition.pattern.clone(), definition)
    }

    /// Look up a pattern by its literal key
    pub fn get(&self, pattern: &str) -> Option<&SubscriptionDefinition> {
        self.entries.get(pattern)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriptionDefinition> {
        self.entries.values()
    }

    /// Discover subscriptions under `<namespace>.topic.<id>`.
    ///
    /// Ids are registered in natural order (numeric ids by value, then the
    /// rest lexically); when two ids share a pattern the later one wins.
    pub fn from_properties(props: &PropertyMap, namespace: &str) -> Result<Self, ConfigError> {
        let re = Regex::new(&format!(
            r"^{}\.topic\.([^.]+)(?:\.pattern)?$",
            regex::escape(namespace)
        ))
        .map_err(|e| ConfigError::Validation(format!("Invalid namespace: {}", e)))?;

        let ids: BTreeSet<&str> = props
            .iter()
            .filter_map(|(key, _)| re.captures(key))
            .filter_map(|caps| caps.get(1).map(|m| m.as_str()))
            .collect();
        let mut ids: Vec<&str> = ids.into_iter().collect();
        ids.sort_by(|a, b| compare_ids(a, b));

        let mut table = Self::new();
        for id in ids {
            let base = format!("{}.topic.{}", namespace, id);
            let definition = parse_definition(props, &base, id)?;

            if definition.shape() == PatternShape::Unsupported {
                warn!(
                    "Subscription '{}' uses pattern '{}' which is never matched \
                     (only exact topics, 'prefix/#' and '#' are distributed)",
                    definition.name, definition.pattern
                );
            }

            debug!(
                "Registered subscription '{}' on '{}' (qos={}, format={})",
                definition.name, definition.pattern, definition.qos, definition.format
            );

            if let Some(replaced) = table.insert(definition) {
                warn!(
                    "Subscription '{}' replaced by a later definition for pattern '{}'",
                    replaced.name, replaced.pattern
                );
            }
        }

        Ok(table)
    }
}

fn parse_definition(
    props: &PropertyMap,
    base: &str,
    id: &str,
) -> Result<SubscriptionDefinition, ConfigError> {
    let pattern = props
        .get(base)
        .or_else(|| props.get(&format!("{}.pattern", base)))
        .unwrap_or_default();
    if pattern.is_empty() {
        return Err(ConfigError::Validation(format!(
            "{} must not be an empty topic pattern",
            base
        )));
    }

    let qos = match props.get(&format!("{}.qos", base)) {
        None => QoS::AtMostOnce,
        Some(value) => value
            .trim()
            .parse::<u8>()
            .ok()
            .and_then(QoS::from_u8)
            .ok_or_else(|| {
                ConfigError::Validation(format!(
                    "{}.qos must be 0, 1, or 2, got '{}'",
                    base, value
                ))
            })?,
    };

    let format = match props.get(&format!("{}.format", base)) {
        None => PayloadFormat::Plain,
        Some(value) => PayloadFormat::parse(value).ok_or_else(|| {
            ConfigError::Validation(format!(
                "{}.format must be 0 (plain) or 1 (base64), got '{}'",
                base, value
            ))
        })?,
    };

    let name = props
        .get(&format!("{}.name", base))
        .unwrap_or(id)
        .to_string();

    Ok(SubscriptionDefinition::new(name, pattern, format, qos))
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
