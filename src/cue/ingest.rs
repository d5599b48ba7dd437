// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! YAML cue-list ingest, mirroring `config::parse_songs`'s
//! read-then-deserialize-then-validate shape, except validation errors here
//! name the offending cue by id instead of the offending file.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::{Cue, CueAction, CueList};
use crate::osc::OscArg;

#[derive(Debug, thiserror::Error)]
pub enum CueIngestError {
    #[error("error reading cue list file: {0}")]
    Io(#[from] std::io::Error),
    #[error("error parsing cue list YAML: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("cue '{cue_id}': {message}")]
    InvalidCue { cue_id: String, message: String },
}

#[derive(Deserialize)]
struct Document {
    cuelist: CueListYaml,
}

#[derive(Deserialize)]
struct CueListYaml {
    name: String,
    cues: Vec<CueYaml>,
}

#[derive(Deserialize)]
struct CueYaml {
    id: Option<String>,
    name: Option<String>,
    #[serde(default)]
    actions: Vec<ActionYaml>,
    #[serde(rename = "preWaitMs", default)]
    pre_wait_ms: Option<u64>,
    #[serde(rename = "postWaitMs", default)]
    post_wait_ms: Option<u64>,
    #[serde(rename = "autoFollow", default)]
    auto_follow: bool,
}

#[derive(Deserialize)]
struct ActionYaml {
    address: String,
    #[serde(default)]
    args: Vec<ArgYaml>,
    #[serde(rename = "delayMs", default)]
    delay_ms: Option<u64>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgYaml {
    Number(f64),
    Boolean(bool),
    Text(String),
}

pub fn load_cue_list(path: &Path) -> Result<CueList, CueIngestError> {
    let raw = fs::read_to_string(path)?;
    parse_cue_list(&raw)
}

fn parse_cue_list(raw: &str) -> Result<CueList, CueIngestError> {
    let doc: Document = serde_yaml::from_str(raw)?;
    let mut cues = Vec::with_capacity(doc.cuelist.cues.len());

    for (index, cue_yaml) in doc.cuelist.cues.into_iter().enumerate() {
        let id = cue_yaml.id.unwrap_or_else(|| format!("cue-{index}"));
        let name = cue_yaml.name.unwrap_or_else(|| format!("Cue {}", index + 1));

        if cue_yaml.actions.is_empty() {
            return Err(CueIngestError::InvalidCue {
                cue_id: id,
                message: "cue has no actions".into(),
            });
        }

        let mut actions = Vec::with_capacity(cue_yaml.actions.len());
        for action in cue_yaml.actions {
            if !action.address.starts_with('/') {
                return Err(CueIngestError::InvalidCue {
                    cue_id: id.clone(),
                    message: format!("action address '{}' must start with '/'", action.address),
                });
            }
            let args = action
                .args
                .into_iter()
                .map(|a| match a {
                    ArgYaml::Number(n) => OscArg::from_number(n),
                    ArgYaml::Boolean(b) => OscArg::Bool(b),
                    ArgYaml::Text(s) => OscArg::String(s),
                })
                .collect();
            actions.push(CueAction {
                address: action.address,
                args,
                delay_ms: action.delay_ms,
            });
        }

        cues.push(Cue {
            id,
            name,
            pre_wait_ms: cue_yaml.pre_wait_ms,
            post_wait_ms: cue_yaml.post_wait_ms,
            auto_follow: cue_yaml.auto_follow,
            actions,
        });
    }

    Ok(CueList {
        name: doc.cuelist.name,
        cues,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_a_minimal_cue_list() {
        let yaml = r#"
cuelist:
  name: Act One
  cues:
    - id: "1"
      name: House to half
      postWaitMs: 2000
      actions:
        - address: /chamsys/pb/1/fade
          args: [50, 3.0]
"#;
        let list = parse_cue_list(yaml).expect("parse");
        assert_eq!(list.name, "Act One");
        assert_eq!(list.cues.len(), 1);
        assert_eq!(list.cues[0].id, "1");
        assert_eq!(list.cues[0].post_wait_ms, Some(2000));
        assert_eq!(list.cues[0].actions[0].args, vec![OscArg::Int(50), OscArg::Float(3.0)]);
    }

    #[test]
    fn rejects_a_cue_with_no_actions_and_names_it() {
        let yaml = r#"
cuelist:
  name: Act One
  cues:
    - id: empty-cue
      actions: []
"#;
        let err = parse_cue_list(yaml).unwrap_err();
        match err {
            CueIngestError::InvalidCue { cue_id, .. } => assert_eq!(cue_id, "empty-cue"),
            other => panic!("expected InvalidCue, got {other:?}"),
        }
    }

    #[test]
    fn rejects_an_action_address_missing_a_leading_slash() {
        let yaml = r#"
cuelist:
  name: Act One
  cues:
    - id: bad-address
      actions:
        - address: chamsys/pb/1/go
"#;
        let err = parse_cue_list(yaml).unwrap_err();
        match err {
            CueIngestError::InvalidCue { cue_id, message } => {
                assert_eq!(cue_id, "bad-address");
                assert!(message.contains("must start with"));
            }
            other => panic!("expected InvalidCue, got {other:?}"),
        }
    }

    #[test]
    fn defaults_id_and_name_when_omitted() {
        let yaml = r#"
cuelist:
  name: Act One
  cues:
    - actions:
        - address: /obs/scene/Intro
"#;
        let list = parse_cue_list(yaml).expect("parse");
        assert_eq!(list.cues[0].id, "cue-0");
        assert_eq!(list.cues[0].name, "Cue 1");
    }
}
