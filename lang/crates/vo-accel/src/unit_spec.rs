//! Unit option parsing.
//!
//! `option := identifier [ '?' key=value (':' key=value)* ]`
//!
//! The identifier names a unit module, possibly by path. Its file stem carries
//! the feature and an optional version: `libHelloAccel_1` is feature
//! `libHelloAccel`, version `1`.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;

use crate::error::AccelError;

const MAX_IDENTIFIER_LEN: usize = 4096;
const MAX_FEATURE_LEN: usize = 64;
const MAX_VERSION_LEN: usize = 64;
const MAX_PARAMS_LEN: usize = 1024;

const PARAMS_DELIMITER: char = '?';
const PARAM_SEPARATOR: char = ':';
const KEY_VALUE_SEPARATOR: char = '=';

/// Characters left behind by unexpanded placeholders or reserved by the grammar.
const RESERVED: &[char] = &['?', '=', ':', '{', '}', '$', '%'];

/// Library suffixes stripped from a path identifier's file name.
const LIBRARY_SUFFIXES: &[&str] = &[".so", ".dylib", ".dll"];

/// A parsed unit option. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    option: String,
    identifier: String,
    feature: String,
    version: Option<String>,
    raw_params: Option<String>,
    params: IndexMap<String, String>,
}

impl UnitSpec {
    pub fn parse(option: &str) -> Result<Self, AccelError> {
        let (identifier, raw_params) = match option.split_once(PARAMS_DELIMITER) {
            Some((id, params)) => (id, Some(params)),
            None => (option, None),
        };

        validate_identifier(option, identifier)?;
        let (feature, version) = split_stem(option, identifier)?;

        let params = match raw_params {
            Some(raw) => parse_params(option, raw)?,
            None => IndexMap::new(),
        };

        Ok(Self {
            option: option.to_string(),
            identifier: identifier.to_string(),
            feature,
            version,
            raw_params: raw_params.map(str::to_string),
            params,
        })
    }

    /// The option text as given.
    pub fn option(&self) -> &str {
        &self.option
    }

    /// Identifier without parameters, used to resolve the module.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Registry key.
    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Parameter list as written after `?`, if any.
    pub fn raw_params(&self) -> Option<&str> {
        self.raw_params.as_deref()
    }

    /// Parsed parameters in first-insertion order, last value wins.
    pub fn params(&self) -> &IndexMap<String, String> {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// `feature_version`, or just `feature` when unversioned.
    pub fn display_name(&self) -> String {
        match &self.version {
            Some(v) => format!("{}_{}", self.feature, v),
            None => self.feature.clone(),
        }
    }
}

impl FromStr for UnitSpec {
    type Err = AccelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for UnitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.option)
    }
}

/// Parse every option before anything is loaded. The first invalid option
/// fails the whole sequence.
pub fn parse_all<I, S>(options: I) -> Result<Vec<UnitSpec>, AccelError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    options
        .into_iter()
        .map(|o| UnitSpec::parse(o.as_ref()))
        .collect()
}

/// Split a newline-separated unit list. Blank lines are skipped.
pub fn split_unit_list(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn validate_identifier(option: &str, identifier: &str) -> Result<(), AccelError> {
    if identifier.is_empty() {
        return Err(AccelError::invalid_spec(option, "missing unit identifier"));
    }
    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(AccelError::invalid_spec(
            option,
            format!("identifier longer than {} bytes", MAX_IDENTIFIER_LEN),
        ));
    }
    // `C:\` and `C:/` are the only places a `:` may appear.
    let rest = identifier.get(drive_prefix_len(identifier)..).unwrap_or(identifier);
    if let Some(c) = rest
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || RESERVED.contains(c))
    {
        return Err(AccelError::invalid_spec(
            option,
            format!("identifier contains invalid character {:?}", c),
        ));
    }
    Ok(())
}

/// Length of a leading Windows drive prefix such as `C:\`, or 0.
pub(crate) fn drive_prefix_len(identifier: &str) -> usize {
    match identifier.as_bytes() {
        [letter, b':', b'\\' | b'/', ..] if letter.is_ascii_alphabetic() => 3,
        _ => 0,
    }
}

fn split_stem(option: &str, identifier: &str) -> Result<(String, Option<String>), AccelError> {
    // Either separator, so drive paths name the same unit on every host.
    let file_name = identifier.rsplit(['/', '\\']).next().unwrap_or(identifier);
    if file_name.is_empty() || file_name == "." || file_name == ".." {
        return Err(AccelError::invalid_spec(option, "identifier has no file name"));
    }
    let stem = LIBRARY_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .unwrap_or(file_name);

    let (feature, version) = match stem.rsplit_once('_') {
        Some((feature, version)) if !feature.is_empty() && is_version(version) => {
            (feature, Some(version.to_string()))
        }
        _ => (stem, None),
    };
    if feature.is_empty() {
        return Err(AccelError::invalid_spec(option, "empty feature name"));
    }
    if feature.len() > MAX_FEATURE_LEN {
        return Err(AccelError::invalid_spec(
            option,
            format!("feature name longer than {} bytes", MAX_FEATURE_LEN),
        ));
    }
    Ok((feature.to_string(), version))
}

fn is_version(s: &str) -> bool {
    if s.is_empty() || s.len() > MAX_VERSION_LEN {
        return false;
    }
    let mut parts = s.split('.');
    let ok = |p: Option<&str>| p.is_some_and(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    match (parts.next(), parts.next(), parts.next()) {
        (major, None, None) => ok(major),
        (major, minor @ Some(_), None) => ok(major) && ok(minor),
        _ => false,
    }
}

fn parse_params(option: &str, raw: &str) -> Result<IndexMap<String, String>, AccelError> {
    if raw.is_empty() {
        return Err(AccelError::invalid_spec(option, "empty parameter list"));
    }
    if raw.len() > MAX_PARAMS_LEN {
        return Err(AccelError::invalid_spec(
            option,
            format!("parameter list longer than {} bytes", MAX_PARAMS_LEN),
        ));
    }

    let mut params = IndexMap::new();
    for group in raw.split(PARAM_SEPARATOR) {
        let mut kv = group.split(KEY_VALUE_SEPARATOR);
        let (key, value) = match (kv.next(), kv.next(), kv.next()) {
            (Some(key), Some(value), None) => (key, value),
            _ => {
                return Err(AccelError::invalid_spec(
                    option,
                    format!("malformed parameter `{}`, expected key=value", group),
                ));
            }
        };
        if key.is_empty() {
            return Err(AccelError::invalid_spec(option, format!("empty key in `{}`", group)));
        }
        params.insert(key.to_string(), value.to_string());
    }
    Ok(params)
}
