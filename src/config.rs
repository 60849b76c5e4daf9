//! The build description, read from xforge.toml.
//!
//! Relative paths are relative to the working root.  Every table is
//! optional except [[firmware.sources]], which names what to build.

use crate::adapter::{FlashOffsets, TestFailurePolicy};
use crate::error::ConfigurationError;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const DEFAULT_FILE: &str = "xforge.toml";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub build: BuildSection,
    /// Logical helper name to executable.
    pub helpers: BTreeMap<String, PathBuf>,
    pub compile: CompileSection,
    pub firmware: FirmwareSection,
    pub link: LinkSection,
    pub image: ImageSection,
    pub partition: Option<PartitionSection>,
    pub flash: Option<FlashSection>,
    pub test: Option<TestSection>,
    pub parallelism: ParallelismSection,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSection {
    pub build_dir: PathBuf,
    pub dist_dir: PathBuf,
    /// Defaults to <build_dir>/.xforge_db.
    pub db: Option<PathBuf>,
}

impl Default for BuildSection {
    fn default() -> Self {
        BuildSection {
            build_dir: PathBuf::from("build"),
            dist_dir: PathBuf::from("dist"),
            db: None,
        }
    }
}

impl BuildSection {
    pub fn db_path(&self) -> PathBuf {
        self.db
            .clone()
            .unwrap_or_else(|| self.build_dir.join(".xforge_db"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompileSection {
    pub c_dialect: Option<String>,
    pub cxx_dialect: Option<String>,
    /// "NAME" or "NAME=VALUE".
    pub defines: Vec<String>,
    /// Flags for every compile.
    pub flags: Vec<String>,
    pub c_flags: Vec<String>,
    pub cxx_flags: Vec<String>,
}

impl Default for CompileSection {
    fn default() -> Self {
        CompileSection {
            c_dialect: Some("gnu99".into()),
            cxx_dialect: Some("gnu++11".into()),
            defines: Vec::new(),
            flags: Vec::new(),
            c_flags: Vec::new(),
            cxx_flags: Vec::new(),
        }
    }
}

/// A directory of sources, compiled one node per file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceGroup {
    pub dir: PathBuf,
    #[serde(default = "SourceGroup::default_extensions")]
    pub extensions: Vec<String>,
    /// Descend into subdirectories, skipping ones with a '.' in their name.
    #[serde(default)]
    pub recurse: bool,
    /// File names to leave out, e.g. the firmware entry point when compiling
    /// the application for host tests.
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl SourceGroup {
    fn default_extensions() -> Vec<String> {
        vec!["c".into(), "cpp".into()]
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FirmwareSection {
    /// Base name of the linked binary and images under dist_dir.
    pub name: String,
    /// Include directories for every firmware source group.
    pub include_dirs: Vec<PathBuf>,
    pub sources: Vec<SourceGroup>,
}

impl Default for FirmwareSection {
    fn default() -> Self {
        FirmwareSection {
            name: "firmware".into(),
            include_dirs: Vec::new(),
            sources: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkSection {
    pub search_dirs: Vec<PathBuf>,
    pub libraries: Vec<String>,
    pub flags: Vec<String>,
    pub group: bool,
}

impl Default for LinkSection {
    fn default() -> Self {
        LinkSection {
            search_dirs: Vec::new(),
            libraries: Vec::new(),
            flags: Vec::new(),
            group: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImageSection {
    pub enabled: bool,
    pub args: Vec<String>,
}

impl Default for ImageSection {
    fn default() -> Self {
        ImageSection {
            enabled: true,
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionSection {
    /// Partition descriptor, e.g. a CSV layout.
    pub layout: PathBuf,
    #[serde(default)]
    pub script: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlashSection {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub bootloader: PathBuf,
    pub boot_app: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub offsets: FlashOffsets,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestSection {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Base name of the test binary under <dist_dir>/test.
    #[serde(default = "TestSection::default_name")]
    pub name: String,
    pub sources: Vec<SourceGroup>,
    #[serde(default)]
    pub include_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    /// Helper overrides for the test branch, e.g. a host compiler.
    #[serde(default)]
    pub helpers: BTreeMap<String, PathBuf>,
    #[serde(default = "TestSection::default_link")]
    pub link: LinkSection,
    /// Working directory of the test binary; defaults to its directory.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub on_failure: TestFailurePolicy,
}

impl TestSection {
    fn default_name() -> String {
        "unity_test".into()
    }

    fn default_link() -> LinkSection {
        LinkSection {
            group: false,
            ..LinkSection::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParallelismSection {
    pub compile: usize,
    /// Every other scope.
    pub default: usize,
}

impl Default for ParallelismSection {
    fn default() -> Self {
        ParallelismSection {
            compile: 16,
            default: 4,
        }
    }
}

fn enabled() -> bool {
    true
}

/// Split "NAME=VALUE" into its parts.
pub fn parse_define(define: &str) -> (String, Option<String>) {
    match define.split_once('=') {
        Some((name, value)) => (name.to_string(), Some(value.to_string())),
        None => (define.to_string(), None),
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Config, ConfigurationError> {
        let config: Config =
            toml::from_str(text).map_err(|err| ConfigurationError::Invalid(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Config, ConfigurationError> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            ConfigurationError::Invalid(format!("read {}: {}", path.display(), err))
        })?;
        Config::parse(&text).map_err(|err| match err {
            ConfigurationError::Invalid(msg) => {
                ConfigurationError::Invalid(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.firmware.sources.is_empty() {
            return Err(ConfigurationError::Invalid(
                "no [[firmware.sources]] declared".into(),
            ));
        }
        let groups = self
            .firmware
            .sources
            .iter()
            .chain(self.test.iter().flat_map(|t| t.sources.iter()));
        for group in groups {
            if group.extensions.is_empty() {
                return Err(ConfigurationError::Invalid(format!(
                    "source group {}: no extensions",
                    group.dir.display()
                )));
            }
        }
        if self.parallelism.compile == 0 || self.parallelism.default == 0 {
            return Err(ConfigurationError::Invalid(
                "parallelism must be at least 1".into(),
            ));
        }
        if let Some(flash) = &self.flash {
            if flash.enabled && (self.partition.is_none() || !self.image.enabled) {
                return Err(ConfigurationError::Invalid(
                    "[flash] needs an image and a [partition] table".into(),
                ));
            }
        }
        Ok(())
    }
}
