use std::fs;
use std::io;
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record::Timestamp;
use crate::serde::ascii::{self, from_str};

// Every key of the run configuration file carries this prefix.
const KEY_PREFIX: &str = "RC_";

#[derive(Debug, Copy, Clone, PartialEq, Deserialize)]
enum Setting {
    #[serde(rename = "RC_GLOBAL_END_TIME")]
    GlobalEndTime(i64),
    #[serde(rename = "RC_POSE_REAL_TIME")]
    PoseRealTime(i64),
    #[serde(rename = "RC_POSE_VIRT_TIME")]
    PoseVirtTime(i64),
    #[serde(rename = "RC_OUTLIER_FILTERED")]
    OutlierFiltered(bool),
}

// Negative times mean the value was never recorded.
fn recorded(value: i64) -> Option<Timestamp> {
    (value >= 0).then_some(Timestamp(value))
}

/// Settings from a run's `.projrc` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunConfig {
    pub global_end_time: Option<Timestamp>,
    pub pose_real_time: Option<Timestamp>,
    pub pose_virt_time: Option<Timestamp>,
    pub outlier_filtered: bool,
}

impl RunConfig {
    /// Reads `path`, falling back to the defaults when it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(text) => RunConfig::parse(path, &text),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("no configuration at {:?}, using defaults", path);
                Ok(RunConfig::default())
            }
            Err(err) => Err(Error::io(path, err)),
        }
    }

    /// Unknown keys are skipped with a warning. A known key with a bad value
    /// is an error.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let mut config = RunConfig::default();
        for (i, line) in text.lines().enumerate() {
            let Some(key) = line.split_whitespace().next() else {
                continue;
            };
            if !key.starts_with(KEY_PREFIX) {
                warn!("key [{}] does not start with {} and is rejected", key, KEY_PREFIX);
                continue;
            }
            match from_str::<Setting>(line) {
                Ok(setting) => config.apply(setting),
                Err(ascii::Error::ExpectedEnum(_)) => {
                    warn!("key [{}] is not supported, ignoring", key);
                }
                Err(err) => {
                    return Err(Error::Config {
                        path: path.to_owned(),
                        line: i as u64 + 1,
                        reason: err.to_string(),
                    });
                }
            }
        }
        Ok(config)
    }

    fn apply(&mut self, setting: Setting) {
        match setting {
            Setting::GlobalEndTime(x) => self.global_end_time = recorded(x),
            Setting::PoseRealTime(x) => self.pose_real_time = recorded(x),
            Setting::PoseVirtTime(x) => self.pose_virt_time = recorded(x),
            Setting::OutlierFiltered(x) => self.outlier_filtered = x,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<RunConfig> {
        RunConfig::parse(Path::new("run.projrc"), text)
    }

    #[test]
    fn test_settings() {
        let config = parse(
            "RC_GLOBAL_END_TIME 123456\n\
             RC_POSE_REAL_TIME -1\n\
             RC_POSE_VIRT_TIME 77\n\
             RC_OUTLIER_FILTERED true\n",
        )
        .unwrap();
        assert_eq!(
            config,
            RunConfig {
                global_end_time: Some(Timestamp(123456)),
                pose_real_time: None,
                pose_virt_time: Some(Timestamp(77)),
                outlier_filtered: true,
            }
        );
    }

    #[test]
    fn test_rejected_keys() {
        let config = parse(
            "\n\
             GLOBAL_END_TIME 5\n\
             RC_SOMETHING_NEW 9\n\
             RC_GLOBAL_END_TIME 10\n\
             RC_OUTLIER_FILTERED 1\n",
        )
        .unwrap();
        assert_eq!(config.global_end_time, Some(Timestamp(10)));
        assert!(config.outlier_filtered);
    }

    #[test]
    fn test_bad_value() {
        let err = parse("RC_POSE_VIRT_TIME 5\nRC_GLOBAL_END_TIME soon\n").unwrap_err();
        match err {
            Error::Config { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            parse("RC_GLOBAL_END_TIME\n"),
            Err(Error::Config { line: 1, .. })
        ));
        assert!(matches!(
            parse("RC_GLOBAL_END_TIME 5 6\n"),
            Err(Error::Config { .. })
        ));
    }

    #[test]
    fn test_load_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::load(dir.path().join("run.projrc")).unwrap();
        assert_eq!(config, RunConfig::default());

        let path = dir.path().join("other.projrc");
        fs::write(&path, "RC_GLOBAL_END_TIME 42\n").unwrap();
        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.global_end_time, Some(Timestamp(42)));
    }
}
