//! Experiment `metadata.yaml` record.
//!
//! Key order is kept. Fields marked with [`MetadataRecord::mark_literal`] are written as
//! YAML block literals so their embedded newlines appear verbatim; everything
//! else goes through `serde_yaml`. Comments in the original are not kept.

use crate::config::{ParameterAxis, Scalar};
use crate::error::{EnsembleError, Result};
use crate::patch::write_atomic;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default)]
pub struct MetadataRecord {
    entries: Mapping,
    literal: BTreeSet<String>,
}

impl MetadataRecord {
    pub fn read(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| EnsembleError::io(format!("reading {}", path.display()), e))?;
        Self::parse(&raw).map_err(|source| EnsembleError::Metadata {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        let entries = match serde_yaml::from_str::<Value>(raw)? {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            other => {
                let mut m = Mapping::new();
                m.insert(Value::String("description".to_string()), other);
                m
            }
        };
        Ok(Self {
            entries,
            literal: BTreeSet::new(),
        })
    }

    pub fn text(&self, key: &str) -> Option<&str> {
        self.entries.get(key).and_then(|v| v.as_str())
    }

    pub fn set_text(&mut self, key: &str, text: String) {
        self.entries
            .insert(Value::String(key.to_string()), Value::String(text));
    }

    /// Write `key` as a `key: |` block with the text indented underneath.
    pub fn mark_literal(&mut self, key: &str) {
        self.literal.insert(key.to_string());
    }

    pub fn keywords(&self) -> Vec<String> {
        match self.entries.get("keywords") {
            Some(Value::Sequence(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Null => None,
                    other => serde_yaml::to_string(other)
                        .ok()
                        .map(|s| s.trim().to_string()),
                })
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Append to `keywords`, creating the list if absent.
    pub fn append_keywords<I, S>(&mut self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let new: Vec<Value> = words.into_iter().map(|w| Value::String(w.into())).collect();
        match self.entries.get_mut("keywords") {
            Some(Value::Sequence(items)) => items.extend(new),
            Some(slot) => {
                let mut items = match std::mem::replace(slot, Value::Null) {
                    Value::Null => Vec::new(),
                    other => vec![other],
                };
                items.extend(new);
                *slot = Value::Sequence(items);
            }
            None => {
                self.entries
                    .insert(Value::String("keywords".to_string()), Value::Sequence(new));
            }
        }
    }

    pub fn to_yaml(&self) -> std::result::Result<String, serde_yaml::Error> {
        let mut out = String::new();
        for (key, value) in &self.entries {
            match (key.as_str(), value) {
                (Some(k), Value::String(text)) if self.literal.contains(k) => {
                    out.push_str(&literal_block(k, text));
                }
                _ => {
                    let mut single = Mapping::new();
                    single.insert(key.clone(), value.clone());
                    out.push_str(&serde_yaml::to_string(&single)?);
                }
            }
        }
        Ok(out)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let yaml = self.to_yaml().map_err(|source| EnsembleError::Metadata {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, yaml.as_bytes())?;
        Ok(())
    }
}

fn literal_block(key: &str, text: &str) -> String {
    let chomp = if text.ends_with("\n\n") {
        "+"
    } else if text.ends_with('\n') {
        ""
    } else {
        "-"
    };
    // Leading whitespace-only lines would otherwise set the block indentation.
    let leading_blank = text
        .lines()
        .take_while(|l| l.trim().is_empty())
        .any(|l| !l.is_empty());
    let first_indented = text
        .lines()
        .find(|l| !l.trim().is_empty())
        .map_or(false, |first| first.starts_with(' '));
    let indent = if leading_blank || first_indented { "2" } else { "" };
    let body = text.strip_suffix('\n').unwrap_or(text);
    let mut out = format!("{}: |{}{}\n", key, indent, chomp);
    for line in body.split('\n') {
        if line.is_empty() {
            out.push('\n');
        } else {
            out.push_str("  ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Template description followed by the perturbation notice.
///
/// `restart` is the resolved restart directory, or `None` when starting from rest.
pub fn perturbation_description(
    description: &str,
    template: &Path,
    restart: Option<&Path>,
    axis: &ParameterAxis,
    value: &Scalar,
) -> String {
    let mut desc = description.to_string();
    desc.push_str(
        "\nNOTE: this is a perturbation experiment, but the description above is for the control run.",
    );
    desc.push_str(&format!(
        "\nThis perturbation experiment is based on the control run {}",
        template.display()
    ));
    match restart {
        None => desc.push_str("\nbut with condition of rest"),
        Some(path) => desc.push_str(&format!("\nbut with initial condition {}", path.display())),
    }
    if axis.is_turning_angle() {
        desc.push_str(&format!(
            "\nand {} -> {} -> cosw and sinw changed to give a turning angle of {} degrees.",
            axis.file, axis.group, value
        ));
    } else {
        desc.push_str(&format!("\nand {} changed to {}", axis.field_path(), value));
    }
    desc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const META: &str = "\
name: control_run
description: |-
  1 degree ACCESS-OM2 control run
  forced with JRA55-do
notes: Spun up from rest
keywords:
- cosima
- control
";

    fn ricr() -> ParameterAxis {
        ParameterAxis {
            file: "ocean/input.nml".to_string(),
            group: "ocean_vert_kpp_mom4_nml".to_string(),
            name: "ricr".to_string(),
            values: vec![],
        }
    }

    #[test]
    fn literal_fields_keep_newlines_verbatim() {
        let mut rec = MetadataRecord::parse(META).expect("parse");
        let desc = format!("{}\nsecond line", rec.text("description").expect("desc"));
        rec.set_text("description", desc.clone());
        rec.mark_literal("description");
        rec.mark_literal("notes");
        let yaml = rec.to_yaml().expect("yaml");
        assert!(yaml.starts_with("name: control_run\ndescription: |-\n  1 degree"), "{}", yaml);
        assert!(yaml.contains("  second line\nnotes: |-\n  Spun up from rest\n"), "{}", yaml);
        assert!(!yaml.contains("\\n"));

        let back = MetadataRecord::parse(&yaml).expect("reparse");
        assert_eq!(back.text("description"), Some(desc.as_str()));
        assert_eq!(back.text("notes"), Some("Spun up from rest"));
    }

    #[test]
    fn literal_block_chomping_round_trips() {
        for text in ["one", "one\n", "one\n\n", "  indented\nnext", "a\n\nb", "\n\nafter blank"] {
            let mut rec = MetadataRecord::default();
            rec.set_text("notes", text.to_string());
            rec.mark_literal("notes");
            let yaml = rec.to_yaml().expect("yaml");
            let back = MetadataRecord::parse(&yaml).expect("reparse");
            assert_eq!(back.text("notes"), Some(text), "yaml was {:?}", yaml);
        }
    }

    #[test]
    fn leading_whitespace_only_lines_survive_literal_blocks() {
        for text in ["   \nfoo", "\n  \n bar\n"] {
            let mut rec = MetadataRecord::default();
            rec.set_text("notes", text.to_string());
            rec.mark_literal("notes");
            let yaml = rec.to_yaml().expect("yaml");
            assert!(yaml.starts_with("notes: |2"), "yaml was {:?}", yaml);
            let back = MetadataRecord::parse(&yaml).expect("reparse");
            assert_eq!(back.text("notes"), Some(text), "yaml was {:?}", yaml);
        }
    }

    #[test]
    fn keywords_are_appended_in_order() {
        let mut rec = MetadataRecord::parse(META).expect("parse");
        rec.append_keywords(["perturbation", "ricr"]);
        assert_eq!(rec.keywords(), vec!["cosima", "control", "perturbation", "ricr"]);

        let mut empty = MetadataRecord::default();
        empty.append_keywords(vec!["perturbation".to_string()]);
        assert_eq!(empty.keywords(), vec!["perturbation"]);
    }

    #[test]
    fn description_names_template_restart_and_field() {
        let restart = PathBuf::from("/archive/control/restart003");
        let desc = perturbation_description(
            "D",
            Path::new("/runs/control"),
            Some(&restart),
            &ricr(),
            &Scalar::Float(0.3),
        );
        assert_eq!(
            desc,
            "D\nNOTE: this is a perturbation experiment, but the description above is for the control run.\
             \nThis perturbation experiment is based on the control run /runs/control\
             \nbut with initial condition /archive/control/restart003\
             \nand ocean/input.nml -> ocean_vert_kpp_mom4_nml -> ricr changed to 0.3"
        );
    }

    #[test]
    fn description_for_turning_angle_from_rest() {
        let axis = ParameterAxis {
            file: "ice/cice_in.nml".to_string(),
            group: "dynamics_nml".to_string(),
            name: "turning_angle".to_string(),
            values: vec![],
        };
        let desc = perturbation_description("D", Path::new("/t"), None, &axis, &Scalar::Int(30));
        assert!(desc.contains("\nbut with condition of rest\n"));
        assert!(desc.ends_with(
            "and ice/cice_in.nml -> dynamics_nml -> cosw and sinw changed to give a turning angle of 30 degrees."
        ));
    }
}
