//! systemd-boot configuration
//!
//! Issues carry the bootloader configuration as structured data. When it differs
//! between the installed and the target issue, the loader files are regenerated
//! and shipped alongside the changed images.
mod vars;

pub use vars::BootVars;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const LOADER_CONF: &str = "loader/loader.conf";
pub const ENTRIES_DIR: &str = "loader/entries";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

/// A configuration value: one scalar, or a list rendered as one line per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Scalar(Scalar),
    List(Vec<Scalar>),
}

/// One boot entry: ordered fields plus the kernel command line options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BootEntry {
    #[serde(default)]
    pub options: IndexMap<String, Scalar>,
    #[serde(flatten)]
    pub fields: IndexMap<String, ConfigValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BootloaderConfig {
    #[serde(default)]
    pub config: IndexMap<String, ConfigValue>,
    #[serde(default)]
    pub entries: IndexMap<String, BootEntry>,
}

/// Deep structural comparison. Key order of maps is ignored, list order is not.
pub fn config_changed(current: &BootloaderConfig, target: &BootloaderConfig) -> bool {
    current != target
}

/// Renders `key<TAB>value` lines, one per list element for list values.
fn render_lines(fields: &IndexMap<String, ConfigValue>) -> Vec<String> {
    fields
        .iter()
        .flat_map(|(key, value)| match value {
            ConfigValue::Scalar(scalar) => vec![format!("{key}\t{scalar}")],
            ConfigValue::List(items) => items.iter().map(|v| format!("{key}\t{v}")).collect(),
        })
        .collect()
}

fn render_options(options: &IndexMap<String, Scalar>, vars: &BootVars) -> String {
    let tokens: Vec<String> = options
        .iter()
        .map(|(key, value)| match value {
            Scalar::Bool(true) => key.clone(),
            other => format!("{key}={}", vars.substitute(&other.to_string())),
        })
        .collect();
    format!("options\t{}", tokens.join(" "))
}

fn to_file(lines: &[String]) -> String {
    let mut content = lines.join("\n");
    content.push('\n');
    content
}

/// Generates the loader files for `config`: `loader/loader.conf` first, then one
/// `loader/entries/<name>` file per entry, in declared order.
pub fn generate(config: &BootloaderConfig, vars: &BootVars) -> IndexMap<String, String> {
    let mut files = IndexMap::new();
    files.insert(LOADER_CONF.to_owned(), to_file(&render_lines(&config.config)));
    for (name, entry) in &config.entries {
        let mut lines = render_lines(&entry.fields);
        lines.push(render_options(&entry.options, vars));
        files.insert(format!("{ENTRIES_DIR}/{name}"), to_file(&lines));
    }
    files
}
