//! 配置文件读写与带注释生成。
//!
//! 读取时以默认值为底、用户 YAML 深度合并覆盖；若用户文件缺少字段，
//! 会用合并后的结果重新写回（带注释），方便用户发现新选项。

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid yaml at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldMeta {
    pub name: &'static str,
    pub description: &'static str,
}

pub trait ConfigSpec: Serialize + DeserializeOwned + Default {
    const FILE_NAME: &'static str;
    fn fields() -> &'static [FieldMeta];
}

/// 加载结果：配置本身以及它来自哪个文件。
#[derive(Debug)]
pub struct Loaded<T> {
    pub config: T,
    pub path: PathBuf,
    /// 本次是否新建了配置文件
    pub created: bool,
}

/// Load `FILE_NAME` from `base_dir` (or the current directory), creating a
/// commented default file when it does not exist yet.
pub fn load_or_create<T: ConfigSpec>(base_dir: Option<&Path>) -> Result<Loaded<T>, ConfigError> {
    let path = match base_dir {
        Some(base) => base.join(T::FILE_NAME),
        None => PathBuf::from(T::FILE_NAME),
    };
    load_or_create_at(&path)
}

pub fn load_or_create_at<T: ConfigSpec>(path: &Path) -> Result<Loaded<T>, ConfigError> {
    ensure_parent(path)?;

    if !path.exists() {
        let config = T::default();
        write_with_comments(&config, path)?;
        return Ok(Loaded {
            config,
            path: path.to_path_buf(),
            created: true,
        });
    }

    let user_yaml = read_yaml(path)?;
    let missing = has_missing_fields::<T>(&user_yaml);

    let mut merged = serde_yaml::to_value(T::default())
        .map_err(|err| ConfigError::Validation(err.to_string()))?;
    // 空文件解析为 Null，视为全部使用默认值
    if !matches!(user_yaml, Value::Null) {
        merge_values(&mut merged, user_yaml);
    }

    let config: T =
        serde_yaml::from_value(merged).map_err(|err| ConfigError::Validation(err.to_string()))?;

    if missing {
        write_with_comments(&config, path)?;
    }

    Ok(Loaded {
        config,
        path: path.to_path_buf(),
        created: false,
    })
}

pub fn write_with_comments<T: ConfigSpec>(config: &T, path: &Path) -> Result<(), ConfigError> {
    ensure_parent(path)?;
    let yaml = generate_yaml_with_comments(config)?;
    fs::write(path, yaml).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub fn generate_yaml_with_comments<T: ConfigSpec>(config: &T) -> Result<String, ConfigError> {
    let value =
        serde_yaml::to_value(config).map_err(|err| ConfigError::Validation(err.to_string()))?;
    let Value::Mapping(mapping) = value else {
        return Err(ConfigError::Validation(
            "config must serialize to a mapping".to_string(),
        ));
    };

    let mut lines = Vec::with_capacity(T::fields().len() * 2);
    for field in T::fields() {
        if !field.description.is_empty() {
            lines.push(format!("# {}", field.description.replace('\n', "\n# ")));
        }
        let key = Value::String(field.name.to_string());
        let val = mapping.get(&key).cloned().unwrap_or(Value::Null);
        let yaml_line = serde_yaml::to_string(&serde_yaml::Mapping::from_iter([(key, val)]))
            .map_err(|err| ConfigError::Validation(err.to_string()))?;
        lines.push(yaml_line.trim().to_string());
    }
    lines.push(String::new());

    Ok(lines.join("\n"))
}

fn read_yaml(path: &Path) -> Result<Value, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn has_missing_fields<T: ConfigSpec>(user_yaml: &Value) -> bool {
    let Value::Mapping(map) = user_yaml else {
        return true;
    };
    T::fields()
        .iter()
        .any(|field| !map.contains_key(Value::String(field.name.to_string())))
}

fn merge_values(default: &mut Value, user: Value) {
    match (default, user) {
        (Value::Mapping(dest), Value::Mapping(src)) => {
            for (key, user_val) in src {
                if let Some(dest_val) = dest.get_mut(&key) {
                    merge_values(dest_val, user_val);
                } else {
                    dest.insert(key, user_val);
                }
            }
        }
        (dest, other) => {
            *dest = other;
        }
    }
}

fn ensure_parent(path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base_system::context::Config;

    #[test]
    fn creates_commented_default_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_or_create::<Config>(Some(dir.path())).expect("load");
        assert!(loaded.created);
        assert_eq!(loaded.config.max_concurrent, 1);

        let raw = fs::read_to_string(dir.path().join("config.yml")).expect("read");
        assert!(raw.contains("# 同时进行的最大下载数"));
        assert!(raw.contains("pacing_delay_ms: 100"));
    }

    #[test]
    fn user_values_override_defaults_and_missing_fields_are_written_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(&path, "max_concurrent: 4\nwide_split_enabled: true\n").expect("write");

        let loaded = load_or_create_at::<Config>(&path).expect("load");
        assert!(!loaded.created);
        assert_eq!(loaded.config.max_concurrent, 4);
        assert!(loaded.config.wide_split_enabled);
        assert_eq!(loaded.config.reencode_quality, 85);

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("max_concurrent: 4"));
        assert!(raw.contains("reencode_quality: 85"));
    }

    #[test]
    fn empty_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(&path, "").expect("write");
        let loaded = load_or_create_at::<Config>(&path).expect("load");
        assert_eq!(loaded.config.pacing_delay_ms, 100);
    }

    #[test]
    fn invalid_yaml_reports_parse_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(&path, "max_concurrent: [1,\n").expect("write");
        let err = load_or_create_at::<Config>(&path).expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn wrong_type_reports_validation_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yml");
        fs::write(&path, "max_concurrent: many\n").expect("write");
        let err = load_or_create_at::<Config>(&path).expect_err("must fail");
        assert!(matches!(err, ConfigError::Validation(_)));
    }
}
