//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::sandbox::ExecutionLimits;

const BUILTIN_LANGUAGES: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));

/// How a language turns source into something runnable
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LanguageKind {
    /// A compiler produces an artifact in the workspace
    Compiled { compile_command: Vec<String> },
    /// The source runs as-is; the optional check only validates syntax
    Interpreted { check_command: Option<Vec<String>> },
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Canonical language name (e.g., "cpp")
    pub name: String,
    /// Name of the source file (e.g., "main.cpp")
    pub source_file: String,
    pub kind: LanguageKind,
    /// Run command template
    pub run_command: Vec<String>,
    /// Time limit multiplier and bonus: (multiplier, bonus_seconds)
    /// actual_time = base_time * multiplier + bonus
    pub time_limit: Option<(u32, u32)>,
    /// Memory limit multiplier and bonus: (multiplier, bonus_mb)
    /// actual_memory = base_memory * multiplier + bonus
    pub memory_limit: Option<(u32, u32)>,
    /// Whether runs get an RLIMIT_AS backstop. Runtimes that reserve large
    /// virtual ranges up front (JVM, V8) opt out.
    pub limit_address_space: bool,
}

impl LanguageConfig {
    /// Calculate actual time limit based on the problem's limit
    pub fn calculate_time_limit(&self, base: Duration) -> Duration {
        match self.time_limit {
            Some((multiplier, bonus_seconds)) => {
                base.saturating_mul(multiplier)
                    .saturating_add(Duration::from_secs(bonus_seconds as u64))
            }
            None => base,
        }
    }

    /// Calculate actual memory limit (bytes) based on the problem's limit
    pub fn calculate_memory_limit(&self, base_bytes: u64) -> u64 {
        match self.memory_limit {
            Some((multiplier, bonus_mb)) => {
                base_bytes
                    .saturating_mul(multiplier as u64)
                    .saturating_add((bonus_mb as u64) * 1024 * 1024)
            }
            None => base_bytes,
        }
    }

    pub fn adjust_limits(&self, base: &ExecutionLimits) -> ExecutionLimits {
        let limits = ExecutionLimits::new(
            self.calculate_time_limit(base.time),
            self.calculate_memory_limit(base.memory_bytes),
        );
        if self.limit_address_space {
            limits.with_address_space_backstop()
        } else {
            limits
        }
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLanguageConfig {
    source_file: String,
    compile_command: Option<String>,
    check_command: Option<String>,
    run_command: String,
    #[serde(default)]
    time_limit: Vec<String>,
    #[serde(default)]
    memory_limit: Vec<String>,
    #[serde(default)]
    aliases: Vec<String>,
    limit_address_space: Option<bool>,
}

/// Every configured language, addressable by name or alias
#[derive(Debug, Clone, Default)]
pub struct LanguageTable {
    /// Lowercased tag (name or alias) -> config
    by_tag: HashMap<String, Arc<LanguageConfig>>,
    /// Canonical names, sorted
    names: Vec<String>,
}

impl LanguageTable {
    /// The table compiled into the binary from `files/languages.toml`
    pub fn builtin() -> anyhow::Result<Self> {
        Self::from_toml_str(BUILTIN_LANGUAGES).context("Invalid built-in language table")
    }

    /// Load a table from a TOML file on disk
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read language config {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid language config {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

        let mut table = LanguageTable::default();

        for (name, raw) in raw_configs {
            let parse_limit =
                |raw_limit: &[String], kind: &str| -> anyhow::Result<Option<(u32, u32)>> {
                    if raw_limit.is_empty() {
                        return Ok(None);
                    }
                    if raw_limit.len() != 2 {
                        anyhow::bail!("Invalid {} limit for {}: {:?}", kind, name, raw_limit);
                    }
                    let multiplier = raw_limit[0].parse::<u32>().with_context(|| {
                        format!("Invalid {} multiplier for {}: {}", kind, name, raw_limit[0])
                    })?;
                    let offset = raw_limit[1].parse::<u32>().with_context(|| {
                        format!("Invalid {} offset for {}: {}", kind, name, raw_limit[1])
                    })?;
                    Ok(Some((multiplier, offset)))
                };

            let kind = match (raw.compile_command, raw.check_command) {
                (Some(_), Some(_)) => anyhow::bail!(
                    "Language {} sets both compile_command and check_command",
                    name
                ),
                (Some(cmd), None) => LanguageKind::Compiled {
                    compile_command: into_command(&cmd),
                },
                (None, check) => LanguageKind::Interpreted {
                    check_command: check.map(|cmd| into_command(&cmd)),
                },
            };

            let run_command = into_command(&raw.run_command);
            if run_command.is_empty() {
                anyhow::bail!("Empty run_command for {}", name);
            }

            let name = name.to_lowercase();
            let config = Arc::new(LanguageConfig {
                name: name.clone(),
                source_file: raw.source_file,
                kind,
                run_command,
                time_limit: parse_limit(&raw.time_limit, "time")?,
                memory_limit: parse_limit(&raw.memory_limit, "memory")?,
                limit_address_space: raw.limit_address_space.unwrap_or(true),
            });

            // Add main language name
            table.insert_tag(&name, &config)?;

            // Add aliases
            for alias in raw.aliases {
                table.insert_tag(&alias, &config)?;
            }

            table.names.push(name);
        }

        table.names.sort();
        Ok(table)
    }

    fn insert_tag(&mut self, tag: &str, config: &Arc<LanguageConfig>) -> anyhow::Result<()> {
        let tag = tag.to_lowercase();
        if let Some(existing) = self.by_tag.insert(tag.clone(), Arc::clone(config)) {
            anyhow::bail!(
                "Language tag {} is claimed by both {} and {}",
                tag,
                existing.name,
                config.name
            );
        }
        Ok(())
    }

    /// Get language configuration by language name or alias
    pub fn get(&self, language: &str) -> Option<Arc<LanguageConfig>> {
        self.by_tag.get(&language.to_lowercase()).cloned()
    }

    /// Canonical names of all configured languages
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Every (tag, config) pair, aliases included
    pub fn tags(&self) -> impl Iterator<Item = (&str, &Arc<LanguageConfig>)> {
        self.by_tag.iter().map(|(tag, config)| (tag.as_str(), config))
    }
}

fn into_command(command: &str) -> Vec<String> {
    command.split_whitespace().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_test_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[c]
source_file = "main.c"
compile_command = "gcc -o main main.c"
run_command = "./main"

[python]
source_file = "main.py"
check_command = "python3 -m py_compile main.py"
run_command = "python3 main.py"
time_limit = ["3", "2"]
memory_limit = ["2", "32"]
aliases = ["py", "Python3"]
"#
        )
        .unwrap();
        file
    }

    #[test]
    fn test_load_languages() {
        let config_file = create_test_config();
        let table = LanguageTable::from_path(config_file.path()).unwrap();

        assert_eq!(table.names(), ["c", "python"]);
        let python = table.get("PY").unwrap();
        assert_eq!(python.name, "python");
        assert!(Arc::ptr_eq(&python, &table.get("python3").unwrap()));
        assert_eq!(
            python.kind,
            LanguageKind::Interpreted {
                check_command: Some(vec![
                    "python3".into(),
                    "-m".into(),
                    "py_compile".into(),
                    "main.py".into()
                ])
            }
        );

        let c = table.get("c").unwrap();
        assert!(matches!(c.kind, LanguageKind::Compiled { .. }));
        assert_eq!(c.run_command, vec!["./main"]);
        assert!(table.get("cobol").is_none());
    }

    #[test]
    fn test_limit_adjustment() {
        let config_file = create_test_config();
        let table = LanguageTable::from_path(config_file.path()).unwrap();

        let base = ExecutionLimits::from_millis_and_mb(1000, 64);
        let python = table.get("python").unwrap().adjust_limits(&base);
        assert_eq!(python.time, Duration::from_secs(5));
        assert_eq!(python.memory_bytes, 160 * 1024 * 1024);
        assert_eq!(python.address_space_bytes, Some((4 * 160 + 256) * 1024 * 1024));

        let c = table.get("c").unwrap().adjust_limits(&base);
        assert_eq!(c, base.with_address_space_backstop());
    }

    #[test]
    fn test_limit_adjustment_saturates() {
        let config_file = create_test_config();
        let table = LanguageTable::from_path(config_file.path()).unwrap();
        let python = table.get("python").unwrap();

        assert_eq!(python.calculate_memory_limit(u64::MAX), u64::MAX);
        assert_eq!(python.calculate_memory_limit(u64::MAX / 2), u64::MAX);
        assert_eq!(python.calculate_time_limit(Duration::MAX), Duration::MAX);

        let huge = ExecutionLimits::new(Duration::MAX, u64::MAX);
        let adjusted = python.adjust_limits(&huge);
        assert_eq!(adjusted.memory_bytes, u64::MAX);
        assert_eq!(adjusted.address_space_bytes, Some(u64::MAX));
    }

    #[test]
    fn test_address_space_opt_out() {
        let table = LanguageTable::from_toml_str(
            r#"
[jvm]
source_file = "Main.java"
compile_command = "javac Main.java"
run_command = "java Main"
limit_address_space = false
"#,
        )
        .unwrap();
        let base = ExecutionLimits::from_millis_and_mb(1000, 64);
        assert_eq!(table.get("jvm").unwrap().adjust_limits(&base).address_space_bytes, None);

        let builtin = LanguageTable::builtin().unwrap();
        assert!(!builtin.get("java").unwrap().limit_address_space);
        assert!(!builtin.get("javascript").unwrap().limit_address_space);
        assert!(builtin.get("python").unwrap().limit_address_space);
    }

    #[test]
    fn test_rejects_compile_and_check() {
        let result = LanguageTable::from_toml_str(
            r#"
[odd]
source_file = "x"
compile_command = "cc x"
check_command = "lint x"
run_command = "./x"
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_duplicate_alias() {
        let result = LanguageTable::from_toml_str(
            r#"
[a]
source_file = "a"
run_command = "a"
aliases = ["x"]

[b]
source_file = "b"
run_command = "b"
aliases = ["x"]
"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_builtin_table() {
        let table = LanguageTable::builtin().unwrap();
        for name in ["c", "cpp", "java", "python", "javascript", "bash", "rust"] {
            assert!(table.get(name).is_some(), "missing {}", name);
        }
        assert!(matches!(
            table.get("java").unwrap().kind,
            LanguageKind::Compiled { .. }
        ));
        assert!(matches!(
            table.get("bash").unwrap().kind,
            LanguageKind::Interpreted {
                check_command: Some(_)
            }
        ));
    }
}
