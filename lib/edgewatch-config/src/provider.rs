use std::{
    fs,
    path::{Path, PathBuf},
};

use figment::{
    providers::{Data, Yaml},
    value::{Dict, Map},
    Error, Metadata, Profile, Provider,
};
use snafu::ResultExt as _;

use crate::{ConfigurationError, ParseFile, ReadFile};

/// A YAML configuration file, read and parsed as soon as it is opened.
///
/// `figment` file providers defer reading until extraction, which would hide a missing or malformed file until the
/// first lookup. A file holding nothing but whitespace or comments counts as an empty configuration, so a freshly
/// installed config file with every line commented out still loads.
pub struct YamlFile {
    path: PathBuf,
    data: Map<Profile, Dict>,
}

impl YamlFile {
    pub fn open<P>(path: P) -> Result<Self, ConfigurationError>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).context(ReadFile { path })?;

        let data = if is_blank(&contents) {
            Map::new()
        } else {
            Data::<Yaml>::string(&contents).data().context(ParseFile { path })?
        };

        Ok(Self {
            path: path.to_path_buf(),
            data,
        })
    }
}

fn is_blank(contents: &str) -> bool {
    contents
        .lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with('#') || line == "---")
}

impl Provider for YamlFile {
    fn metadata(&self) -> Metadata {
        Metadata::from("YAML file", self.path.as_path())
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        Ok(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn commented_out_file_is_empty_configuration() {
        let config = file("---\n# data_dir: /var/lib/edgewatch\n\n");
        let yaml = YamlFile::open(config.path()).unwrap();
        assert!(yaml.data().unwrap().is_empty());
    }

    #[test]
    fn read_and_parse_errors_name_the_file() {
        let missing = Path::new("/nonexistent/edgewatch.yaml");
        match YamlFile::open(missing) {
            Err(ConfigurationError::ReadFile { path, .. }) => assert_eq!(path, missing),
            Err(other) => panic!("expected read error, got {}", other),
            Ok(_) => panic!("expected read error"),
        }

        let malformed = file("pipelines: [unclosed\n");
        match YamlFile::open(malformed.path()) {
            Err(e @ ConfigurationError::ParseFile { .. }) => {
                assert!(e.to_string().contains(&malformed.path().display().to_string()))
            }
            Err(other) => panic!("expected parse error, got {}", other),
            Ok(_) => panic!("expected parse error"),
        }
    }
}
