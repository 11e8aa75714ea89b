use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

fn default_size() -> usize {
    1
}

/// One dimension of the search space. `size > 1` makes the variable an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Variable {
    Int {
        name: String,
        #[serde(default = "default_size")]
        size: usize,
        min: i64,
        max: i64,
    },
    Float {
        name: String,
        #[serde(default = "default_size")]
        size: usize,
        min: f64,
        max: f64,
    },
    Enum {
        name: String,
        #[serde(default = "default_size")]
        size: usize,
        options: Vec<String>,
    },
}

impl Variable {
    pub fn name(&self) -> &str {
        match self {
            Variable::Int { name, .. } | Variable::Float { name, .. } | Variable::Enum { name, .. } => {
                name
            }
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Variable::Int { size, .. } | Variable::Float { size, .. } | Variable::Enum { size, .. } => {
                *size
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(anyhow!("variable name cannot be empty"));
        }
        if self.size() == 0 {
            return Err(anyhow!("variable '{}': size must be > 0", self.name()));
        }
        match self {
            Variable::Int { min, max, .. } if min > max => Err(anyhow!(
                "variable '{}': min {} > max {}",
                self.name(),
                min,
                max
            )),
            Variable::Float { min, max, .. } if !(max - min).is_finite() || min > max => {
                Err(anyhow!(
                    "variable '{}': invalid range [{}, {}]",
                    self.name(),
                    min,
                    max
                ))
            }
            Variable::Enum { options, .. } if options.is_empty() => Err(anyhow!(
                "variable '{}': enum needs at least one option",
                self.name()
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    #[serde(rename = "main-file", alias = "main_file")]
    pub main_file: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Experiment {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow!("experiment name cannot be empty"));
        }
        if self.main_file.trim().is_empty() {
            return Err(anyhow!("experiment main-file cannot be empty"));
        }
        if self.variables.is_empty() {
            return Err(anyhow!("experiment declares no variables"));
        }
        let mut seen = BTreeSet::new();
        for var in &self.variables {
            var.validate()?;
            if !seen.insert(var.name()) {
                return Err(anyhow!("duplicate variable name: {}", var.name()));
            }
        }
        Ok(())
    }
}

pub fn load_experiment(path: &Path) -> Result<Experiment> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read experiment config {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );
    let expt: Experiment = if is_yaml {
        serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid experiment config {}", path.display()))?
    } else {
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid experiment config {}", path.display()))?
    };
    expt.validate()
        .with_context(|| format!("invalid experiment config {}", path.display()))?;
    Ok(expt)
}

pub fn experiment_dir_for(config_path: &Path) -> Result<PathBuf> {
    let dir = match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    dir.canonicalize()
        .with_context(|| format!("cannot find experiment directory '{}'", dir.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::ensure_dir;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "optlab_expt_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp dir");
        root
    }

    #[test]
    fn loads_yaml_definition_with_defaults() {
        let root = temp_root("yaml");
        let path = root.join("config.yaml");
        fs::write(
            &path,
            "name: branin\nmain-file: branin.sh\nvariables:\n  - {name: x, type: float, min: -5, max: 10}\n  - {name: k, type: int, size: 2, min: 1, max: 4}\n  - {name: act, type: enum, options: [relu, tanh]}\n",
        )
        .expect("write");
        let expt = load_experiment(&path).expect("load");
        assert_eq!(expt.name, "branin");
        assert_eq!(expt.main_file, "branin.sh");
        assert_eq!(expt.variables.len(), 3);
        assert_eq!(expt.variables[0].size(), 1);
        assert_eq!(expt.variables[1].size(), 2);
        assert_eq!(experiment_dir_for(&path).expect("dir"), root.canonicalize().expect("canon"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn loads_json_definition() {
        let root = temp_root("json");
        let path = root.join("config.json");
        fs::write(
            &path,
            r#"{"name": "quad", "main-file": "quad.py", "variables": [{"name": "x", "type": "float", "size": 3, "min": 0, "max": 1}]}"#,
        )
        .expect("write");
        let expt = load_experiment(&path).expect("load");
        assert_eq!(
            expt.variables[0],
            Variable::Float {
                name: "x".into(),
                size: 3,
                min: 0.0,
                max: 1.0
            }
        );
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn rejects_invalid_definitions() {
        let bad_range = Experiment {
            name: "e".into(),
            main_file: "m".into(),
            variables: vec![Variable::Int {
                name: "x".into(),
                size: 1,
                min: 5,
                max: 1,
            }],
        };
        assert!(bad_range.validate().is_err());

        let duplicate = Experiment {
            name: "e".into(),
            main_file: "m".into(),
            variables: vec![
                Variable::Enum {
                    name: "x".into(),
                    size: 1,
                    options: vec!["a".into()],
                },
                Variable::Enum {
                    name: "x".into(),
                    size: 1,
                    options: vec!["b".into()],
                },
            ],
        };
        let err = duplicate.validate().expect_err("duplicate must fail");
        assert!(err.to_string().contains("duplicate"), "{}", err);

        let empty_enum = Experiment {
            name: "e".into(),
            main_file: "m".into(),
            variables: vec![Variable::Enum {
                name: "x".into(),
                size: 1,
                options: vec![],
            }],
        };
        assert!(empty_enum.validate().is_err());
    }

    #[test]
    fn rejects_float_ranges_too_wide_to_sample() {
        let float_var = |min: f64, max: f64| Experiment {
            name: "e".into(),
            main_file: "m".into(),
            variables: vec![Variable::Float {
                name: "x".into(),
                size: 1,
                min,
                max,
            }],
        };
        assert!(float_var(-1.7e308, 1.7e308).validate().is_err());
        assert!(float_var(f64::NEG_INFINITY, 0.0).validate().is_err());
        assert!(float_var(0.0, f64::NAN).validate().is_err());
        assert!(float_var(-1.0e300, 1.0e300).validate().is_ok());
    }

    #[test]
    fn missing_experiment_directory_is_an_error() {
        let path = Path::new("/definitely/not/here/optlab/config.json");
        assert!(experiment_dir_for(path).is_err());
    }
}
