use regex::Regex;
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use crate::error::{Result, StorageError};

/// Property key naming the backend to construct.
pub const PROVIDER_KEY: &str = "storageprovider";

static REGION_IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]{2,}(-[a-z]+)+-\d+$").expect("region pattern is valid")
});

/// Flat `key -> value` property bag, loaded once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    values: BTreeMap<String, String>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a `.yaml`/`.yml` file as nested mappings, anything else as `.properties` text.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            StorageError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&contents),
            _ => Ok(Self::parse(&contents)),
        }
    }

    /// Parses Java-style properties text.
    pub fn parse(text: &str) -> Self {
        let mut values = BTreeMap::new();
        let mut lines = text.lines();

        while let Some(line) = lines.next() {
            let mut logical = line.trim_start().to_string();
            if logical.is_empty() || logical.starts_with('#') || logical.starts_with('!') {
                continue;
            }

            while ends_with_continuation(&logical) {
                logical.pop();
                match lines.next() {
                    Some(next) => logical.push_str(next.trim_start()),
                    None => break,
                }
            }

            let (key, value) = split_entry(&logical);
            values.insert(unescape(key.trim_end()), unescape(value.trim_start()));
        }

        Self { values }
    }

    /// Parses YAML, flattening nested mappings into dotted keys.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let document: YamlValue = serde_yaml::from_str(text)
            .map_err(|e| StorageError::Configuration(format!("Failed to parse config file: {}", e)))?;

        let mut values = BTreeMap::new();
        flatten_yaml("", &document, &mut values);
        Ok(Self { values })
    }

    /// Returns the trimmed value, treating blank values as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

fn split_entry(line: &str) -> (&str, &str) {
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' => return (&line[..i], &line[i + 1..]),
            c if c.is_whitespace() => {
                let rest = line[i..].trim_start();
                let rest = rest
                    .strip_prefix('=')
                    .or_else(|| rest.strip_prefix(':'))
                    .unwrap_or(rest);
                return (&line[..i], rest);
            }
            _ => {}
        }
    }
    (line, "")
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

fn flatten_yaml(prefix: &str, value: &YamlValue, out: &mut BTreeMap<String, String>) {
    let join = |segment: &str| {
        if prefix.is_empty() {
            segment.to_string()
        } else {
            format!("{}.{}", prefix, segment)
        }
    };

    match value {
        YamlValue::Mapping(map) => {
            for (k, v) in map {
                if let Some(segment) = yaml_scalar(k) {
                    flatten_yaml(&join(&segment), v, out);
                }
            }
        }
        YamlValue::Sequence(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_yaml(&join(&i.to_string()), v, out);
            }
        }
        YamlValue::Tagged(tagged) => flatten_yaml(prefix, &tagged.value, out),
        scalar => {
            if let Some(text) = yaml_scalar(scalar) {
                out.insert(prefix.to_string(), text);
            }
        }
    }
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(s) => Some(s.clone()),
        YamlValue::Number(n) => Some(n.to_string()),
        YamlValue::Bool(b) => Some(b.to_string()),
        YamlValue::Null => Some(String::new()),
        _ => None,
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Expands a leading `~` to the current user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix('~'), home_dir()) {
        (Some(rest), Some(home)) => {
            let mut expanded = home.into_os_string();
            expanded.push(rest);
            PathBuf::from(expanded)
        }
        _ => PathBuf::from(path),
    }
}

pub fn is_readable_file(path: &Path) -> bool {
    path.is_file() && fs::File::open(path).is_ok()
}

pub fn is_region_identifier(region: &str) -> bool {
    REGION_IDENTIFIER.is_match(region)
}

/// Collects every configuration problem so they can be reported together.
#[derive(Debug, Default)]
pub struct Validation {
    problems: Vec<String>,
}

impl Validation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn problem(&mut self, message: impl Into<String>) {
        self.problems.push(message.into());
    }

    pub fn require<'a>(&mut self, properties: &'a Properties, key: &str) -> Option<&'a str> {
        let value = properties.get(key);
        if value.is_none() {
            self.problem(format!("{} must have a value", key));
        }
        value
    }

    /// Requires a path to a readable file, expanding `~` first.
    pub fn require_file(
        &mut self,
        properties: &Properties,
        key: &str,
        description: &str,
    ) -> Option<PathBuf> {
        let path = expand_home(self.require(properties, key)?);
        if !is_readable_file(&path) {
            self.problem(format!(
                "{} must point to a valid {} file that can be accessed",
                key, description
            ));
            return None;
        }
        Some(path)
    }

    pub fn require_region<'a>(
        &mut self,
        properties: &'a Properties,
        key: &str,
    ) -> Option<&'a str> {
        let region = self.require(properties, key)?;
        if !is_region_identifier(region) {
            self.problem(format!(
                "{} has been set to an unknown region, please check you have entered the region correctly",
                key
            ));
            return None;
        }
        Some(region)
    }

    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    /// Returns `value` if no problem was recorded, otherwise one combined error.
    pub fn finish<T>(self, value: Option<T>) -> Result<T> {
        if !self.problems.is_empty() {
            return Err(StorageError::Configuration(self.problems.join("\n")));
        }
        value.ok_or_else(|| StorageError::Configuration("Incomplete configuration".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_properties_parsing() {
        let text = r#"
# conversion service
! legacy comment
storageprovider = aws
storageprovider.aws.region=eu-west-1
storageprovider.aws.bucketname : out
storageprovider.aws.basepath=
storageprovider.aws.accesskey   AK
storageprovider.aws.secretkey=S\
    K
path\=with\:separators=value
"#;

        let props = Properties::parse(text);
        assert_eq!(props.get("storageprovider"), Some("aws"));
        assert_eq!(props.get("storageprovider.aws.region"), Some("eu-west-1"));
        assert_eq!(props.get("storageprovider.aws.bucketname"), Some("out"));
        assert_eq!(props.get("storageprovider.aws.basepath"), None);
        assert_eq!(props.get("storageprovider.aws.accesskey"), Some("AK"));
        assert_eq!(props.get("storageprovider.aws.secretkey"), Some("SK"));
        assert_eq!(props.get("path=with:separators"), Some("value"));
        assert_eq!(props.get_or("storageprovider.aws.basepath", "reports"), "reports");
    }

    #[test]
    fn test_yaml_flattening() {
        let yaml = r#"
storageprovider: gcp
storageprovider.gcp:
  projectid: my-project
  bucketname: out
  port: 8080
  enabled: true
"#;

        let props = Properties::from_yaml_str(yaml).unwrap();
        assert_eq!(props.get("storageprovider"), Some("gcp"));
        assert_eq!(props.get("storageprovider.gcp.projectid"), Some("my-project"));
        assert_eq!(props.get("storageprovider.gcp.port"), Some("8080"));
        assert_eq!(props.get("storageprovider.gcp.enabled"), Some("true"));
    }

    #[test]
    fn test_from_file_picks_format_by_extension() {
        let dir = tempfile::TempDir::new().unwrap();

        let yaml_path = dir.path().join("storage.yaml");
        fs::write(&yaml_path, "storageprovider:\n  do:\n    region: nyc3\n").unwrap();
        let props = Properties::from_file(&yaml_path).unwrap();
        assert_eq!(props.get("storageprovider.do.region"), Some("nyc3"));

        let properties_path = dir.path().join("storage.properties");
        let mut file = fs::File::create(&properties_path).unwrap();
        writeln!(file, "storageprovider.do.region=ams3").unwrap();
        let props = Properties::from_file(&properties_path).unwrap();
        assert_eq!(props.get("storageprovider.do.region"), Some("ams3"));

        let missing = Properties::from_file(dir.path().join("missing.properties"));
        assert!(matches!(missing, Err(StorageError::Configuration(_))));
    }

    #[test]
    fn test_expand_home() {
        let home = home_dir().unwrap();
        assert_eq!(expand_home("~/creds.json"), home.join("creds.json"));
        assert_eq!(expand_home("/etc/creds.json"), PathBuf::from("/etc/creds.json"));
        assert_eq!(expand_home("creds~.json"), PathBuf::from("creds~.json"));
    }

    #[test]
    fn test_region_identifiers() {
        assert!(is_region_identifier("eu-west-1"));
        assert!(is_region_identifier("us-gov-west-1"));
        assert!(is_region_identifier("us-ashburn-1"));
        assert!(!is_region_identifier("EU-WEST-1"));
        assert!(!is_region_identifier("eu-west"));
        assert!(!is_region_identifier("nowhere"));
    }

    #[test]
    fn test_validation_reports_every_problem() {
        let props: Properties = [("a.present", "yes"), ("a.region", "mars")]
            .into_iter()
            .collect();

        let mut validation = Validation::new();
        let present = validation.require(&props, "a.present");
        let first = validation.require(&props, "a.first");
        let second = validation.require(&props, "a.second");
        let region = validation.require_region(&props, "a.region");
        assert_eq!(present, Some("yes"));
        assert_eq!(validation.problems().len(), 3);

        let result = validation.finish((|| Some((first?, second?, region?)))());
        match result {
            Err(StorageError::Configuration(message)) => {
                assert!(message.contains("a.first must have a value"));
                assert!(message.contains("a.second must have a value"));
                assert!(message.contains("a.region has been set to an unknown region"));
            }
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn test_require_file_checks_readability() {
        let dir = tempfile::TempDir::new().unwrap();
        let creds = dir.path().join("creds.json");
        fs::write(&creds, "{}").unwrap();

        let props: Properties = [
            ("x.present", creds.to_str().unwrap()),
            ("x.absent", dir.path().join("nope.json").to_str().unwrap()),
            ("x.directory", dir.path().to_str().unwrap()),
        ]
        .into_iter()
        .collect();

        let mut validation = Validation::new();
        assert_eq!(
            validation.require_file(&props, "x.present", "credentials"),
            Some(creds)
        );
        assert!(validation.require_file(&props, "x.absent", "credentials").is_none());
        assert!(validation.require_file(&props, "x.directory", "credentials").is_none());
        assert_eq!(validation.problems().len(), 2);
    }
}
