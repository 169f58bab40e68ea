//! Structural checks over a parsed [`AppConfig`].

use std::collections::{HashMap, HashSet};

use cartograph_core::scanner::registry::resolve_shared_config;
use cartograph_core::scheduler::ScheduleSpec;
use cartograph_model::{CONFIG_FROM, SourceConfig};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::models::{AppConfig, ENGINE_POSTGRESQL, PostgresEngine};

/// Credentials every cloud source needs, either directly or through
/// `config_from`.
const CLOUD_CREDENTIAL_KEYS: [&str; 2] = ["access_key", "secret_key"];

/// Runs every rule and stops at the first violation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, config: &AppConfig) -> Result<()> {
        validate_organization(config)?;
        validate_discovery(config)?;
        validate_storage(config)?;
        validate_sources(config)?;
        validate_relations(config)?;
        debug!(sources = config.sources.len(), "configuration is valid");
        Ok(())
    }
}

fn require(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::invalid(field, "value is required"));
    }
    Ok(())
}

fn validate_organization(config: &AppConfig) -> Result<()> {
    require(&config.organization.name, "organization.name")
}

fn validate_discovery(config: &AppConfig) -> Result<()> {
    require(&config.discovery.name, "discovery.name")?;
    if config.discovery.channel_capacity == Some(0) {
        return Err(ConfigError::invalid(
            "discovery.channel_capacity",
            "must be greater than 0",
        ));
    }
    config.run_timeout()?;
    Ok(())
}

fn validate_storage(config: &AppConfig) -> Result<()> {
    let storage = &config.storage;
    if storage.batch_size <= 0 {
        return Err(ConfigError::invalid(
            "storage.batch_size",
            "must be greater than 0",
        ));
    }
    if storage.engines.is_empty() {
        return Err(ConfigError::invalid(
            "storage.engines",
            "at least one storage engine must be defined",
        ));
    }
    if !storage.engines.contains_key(&storage.default_engine) {
        return Err(ConfigError::invalid(
            "storage.default_engine",
            "must be one of the defined engines",
        ));
    }

    for (name, value) in &storage.engines {
        match name.as_str() {
            ENGINE_POSTGRESQL => {
                PostgresEngine::from_value(value)?;
            }
            other => {
                return Err(ConfigError::invalid(
                    format!("storage.engines.{other}"),
                    format!("unknown storage engine '{other}'"),
                ));
            }
        }
    }
    Ok(())
}

fn validate_sources(config: &AppConfig) -> Result<()> {
    if config.sources.is_empty() {
        return Err(ConfigError::invalid(
            "source",
            "at least one source must be defined",
        ));
    }

    let typed = config.source_configs()?;
    let names: HashSet<&str> = typed.iter().map(|s| s.name.as_str()).collect();

    for source in &typed {
        validate_config_from(source, &typed)?;
        let resolved = resolve_shared_config(source, &typed).map_err(|err| {
            ConfigError::invalid(
                format!("source.{}.configuration.{CONFIG_FROM}", source.name),
                err.to_string(),
            )
        })?;

        for key in source.source_type.required_keys() {
            if resolved.get(key).is_none() {
                return Err(ConfigError::invalid(
                    format!("source.{}.configuration.{key}", source.name),
                    "value is required",
                ));
            }
        }
        if source.source_type.is_aws() {
            for key in CLOUD_CREDENTIAL_KEYS {
                if resolved.get(key).is_none() {
                    return Err(ConfigError::invalid(
                        format!("source.{}.configuration.{key}", source.name),
                        format!("value is required unless {CONFIG_FROM} names a source that has it"),
                    ));
                }
            }
        }

        if let Some(schedule) = &source.schedule {
            ScheduleSpec::parse(schedule).map_err(|err| {
                ConfigError::invalid(format!("source.{}.schedule", source.name), err.to_string())
            })?;
        }

        for dependency in &source.depends_on {
            if dependency == &source.name || !names.contains(dependency.as_str()) {
                return Err(ConfigError::invalid(
                    format!("source.{}.depends_on", source.name),
                    format!("invalid source key '{dependency}'"),
                ));
            }
        }
    }

    detect_dependency_cycle(&typed)
}

fn validate_config_from(source: &SourceConfig, sources: &[SourceConfig]) -> Result<()> {
    let Some(parent_name) = source.config_from() else {
        return Ok(());
    };
    let field = format!("source.{}.configuration.{CONFIG_FROM}", source.name);
    if !source.source_type.is_aws() {
        return Err(ConfigError::invalid(
            field,
            "only cloud sources can reuse another source's configuration",
        ));
    }
    if parent_name == source.name {
        return Err(ConfigError::invalid(field, "a source cannot reference itself"));
    }
    match sources.iter().find(|s| s.name == parent_name) {
        Some(parent) if parent.source_type.is_aws() => Ok(()),
        Some(_) => Err(ConfigError::invalid(
            field,
            format!("source '{parent_name}' is not a cloud source"),
        )),
        None => Err(ConfigError::invalid(
            field,
            format!("source '{parent_name}' does not exist"),
        )),
    }
}

fn detect_dependency_cycle(sources: &[SourceConfig]) -> Result<()> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        graph: &HashMap<&'a str, &'a SourceConfig>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<()> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                path.push(name);
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                return Err(ConfigError::invalid(
                    format!("source.{name}.depends_on"),
                    format!("dependency cycle: {}", path[start..].join(" -> ")),
                ));
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(&source) = graph.get(name) {
            for dependency in &source.depends_on {
                visit(dependency, graph, marks, path)?;
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let graph: HashMap<&str, &SourceConfig> =
        sources.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut marks = HashMap::new();
    for source in sources {
        visit(&source.name, &graph, &mut marks, &mut Vec::new())?;
    }
    Ok(())
}

fn validate_relations(config: &AppConfig) -> Result<()> {
    let criteria = &config.relations.criteria;
    if criteria.is_empty() {
        return Err(ConfigError::invalid(
            "relations.criteria",
            "at least one relation criteria must be defined",
        ));
    }
    for (index, item) in criteria.iter().enumerate() {
        for (field, value) in item.fields() {
            require(value, &format!("relations.criteria[{index}].{field}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::ConfigLoader;

    const VALID: &str = r#"
organization:
  name: Acme
  logo: https://acme.example/logo.png
discovery:
  name: nightly
  description: nightly inventory
storage:
  batch_size: 2
  default_engine: postgresql
  engines:
    postgresql:
      host: localhost
      port: 5432
      user: app
      password: secret
      db: cartograph
source:
  fs_one:
    type: file_system
    configuration:
      root_directory: /srv/data
    fields: [rootDirectory, machineHost]
    schedule: "@every 1h"
  aws_base:
    type: aws_s3
    configuration:
      region: eu-west-1
      access_key: AKID
      secret_key: secret
  aws_ec2:
    type: aws_ec2
    configuration:
      account_id: "123456789012"
      config_from: aws_base
    depends_on: [aws_base]
relations:
  criteria:
    - name: file-to-bucket
      kind: file_system
      metadata_key: machineHost
      metadata_value: host-1
      related_kind: AWS_S3
      related_metadata_key: region
      related_metadata_value: eu-west-1
"#;

    fn parse(yaml: &str) -> AppConfig {
        ConfigLoader::from_yaml(yaml).unwrap()
    }

    fn field_of(config: &AppConfig) -> String {
        ConfigValidator::new()
            .validate(config)
            .unwrap_err()
            .field()
            .unwrap_or_default()
            .to_string()
    }

    #[test]
    fn valid_document_passes() {
        ConfigValidator::new().validate(&parse(VALID)).unwrap();
    }

    #[test]
    fn organization_and_discovery_names_are_required() {
        let mut config = parse(VALID);
        config.organization.name.clear();
        assert_eq!(field_of(&config), "organization.name");

        let mut config = parse(VALID);
        config.discovery.name = "  ".into();
        assert_eq!(field_of(&config), "discovery.name");
    }

    #[test]
    fn storage_rules() {
        let mut config = parse(VALID);
        config.storage.batch_size = 0;
        assert_eq!(field_of(&config), "storage.batch_size");

        let mut config = parse(VALID);
        config.storage.default_engine = "neo4j".into();
        assert_eq!(field_of(&config), "storage.default_engine");

        let mut config = parse(VALID);
        config
            .storage
            .engines
            .insert("neo4j".into(), serde_yaml::Value::Null);
        assert_eq!(field_of(&config), "storage.engines.neo4j");

        let config = parse(&VALID.replace("      db: cartograph\n", ""));
        assert_eq!(field_of(&config), "storage.engines.postgresql.db");
    }

    #[test]
    fn missing_required_source_key_names_the_field() {
        let config = parse(&VALID.replace("      root_directory: /srv/data\n", ""));
        assert_eq!(field_of(&config), "source.fs_one.configuration.root_directory");
    }

    #[test]
    fn cloud_credentials_come_from_config_from() {
        let config = parse(&VALID.replace("      config_from: aws_base\n", ""));
        assert_eq!(field_of(&config), "source.aws_ec2.configuration.region");

        let config = parse(&VALID.replace("config_from: aws_base", "config_from: fs_one"));
        assert_eq!(field_of(&config), "source.aws_ec2.configuration.config_from");
    }

    #[test]
    fn schedule_must_parse() {
        let config = parse(&VALID.replace("@every 1h", "every hour"));
        assert_eq!(field_of(&config), "source.fs_one.schedule");
    }

    #[test]
    fn depends_on_must_exist_and_be_acyclic() {
        let config = parse(&VALID.replace("depends_on: [aws_base]", "depends_on: [ghost]"));
        assert_eq!(field_of(&config), "source.aws_ec2.depends_on");

        let cyclic = VALID.replace(
            "      secret_key: secret\n",
            "      secret_key: secret\n    depends_on: [aws_ec2]\n",
        );
        let err = ConfigValidator::new().validate(&parse(&cyclic)).unwrap_err();
        assert!(err.to_string().contains("dependency cycle"));
    }

    #[test]
    fn relations_are_required_field_by_field() {
        let config = parse(&VALID.replace("      related_kind: AWS_S3\n", ""));
        assert_eq!(field_of(&config), "relations.criteria[0].related_kind");

        let mut config = parse(VALID);
        config.relations.criteria.clear();
        assert_eq!(field_of(&config), "relations.criteria");
    }

    #[test]
    fn no_sources_is_rejected() {
        let mut config = parse(VALID);
        config.sources.clear();
        assert_eq!(field_of(&config), "source");
    }
}
