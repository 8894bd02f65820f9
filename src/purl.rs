use std::collections::BTreeMap;
use std::fmt;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};

use crate::error::{Error, Result};

// Characters kept readable in name/namespace/version segments.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

// Qualifier values additionally keep ':' and '/' so URLs stay legible,
// matching how package-url reference implementations encode them.
const QUALIFIER_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b':')
    .remove(b'/');

/// A Package URL (purl) in canonical form. Qualifiers are kept sorted so
/// rendering is deterministic.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PackageUrl {
    package_type: String,
    namespace: Option<String>,
    name: String,
    version: Option<String>,
    qualifiers: BTreeMap<String, String>,
    subpath: Option<String>,
}

impl PackageUrl {
    pub fn new(package_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package_type: package_type.into().to_ascii_lowercase(),
            namespace: None,
            name: name.into(),
            version: None,
            qualifiers: BTreeMap::new(),
            subpath: None,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_qualifier(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.qualifiers
                .insert(key.into().to_ascii_lowercase(), value);
        }
        self
    }

    pub fn with_subpath(mut self, subpath: impl Into<String>) -> Self {
        self.subpath = Some(subpath.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn qualifier(&self, key: &str) -> Option<&str> {
        self.qualifiers.get(key).map(String::as_str)
    }

    /// Parse a canonical purl string back into its parts. Exists mainly so
    /// emitted purls can be validated to round-trip.
    pub fn parse(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix("pkg:")
            .ok_or_else(|| Error::invalid_input(format!("not a purl: {input}")))?;

        let (rest, subpath) = match rest.split_once('#') {
            Some((left, sub)) => (left, Some(decode(sub)?)),
            None => (rest, None),
        };

        let (rest, qualifiers) = match rest.split_once('?') {
            Some((left, raw)) => (left, parse_qualifiers(raw)?),
            None => (rest, BTreeMap::new()),
        };

        let (rest, version) = match rest.rsplit_once('@') {
            Some((left, version)) => (left, Some(decode(version)?)),
            None => (rest, None),
        };

        let mut segments = rest.split('/');
        let package_type = segments
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::invalid_input(format!("purl has no type: {input}")))?;
        let mut parts: Vec<&str> = segments.collect();
        let name = parts
            .pop()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::invalid_input(format!("purl has no name: {input}")))?;

        let namespace = if parts.is_empty() {
            None
        } else {
            let decoded: Vec<String> = parts
                .into_iter()
                .map(decode)
                .collect::<Result<_>>()?;
            Some(decoded.join("/"))
        };

        Ok(Self {
            package_type: package_type.to_ascii_lowercase(),
            namespace,
            name: decode(name)?,
            version,
            qualifiers,
            subpath,
        })
    }
}

impl fmt::Display for PackageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pkg:{}", self.package_type)?;
        if let Some(namespace) = &self.namespace {
            for segment in namespace.split('/') {
                write!(f, "/{}", utf8_percent_encode(segment, SEGMENT))?;
            }
        }
        write!(f, "/{}", utf8_percent_encode(&self.name, SEGMENT))?;
        if let Some(version) = &self.version {
            write!(f, "@{}", utf8_percent_encode(version, SEGMENT))?;
        }
        let mut separator = '?';
        for (key, value) in &self.qualifiers {
            write!(
                f,
                "{separator}{key}={}",
                utf8_percent_encode(value, QUALIFIER_VALUE)
            )?;
            separator = '&';
        }
        if let Some(subpath) = &self.subpath {
            write!(f, "#{}", utf8_percent_encode(subpath, QUALIFIER_VALUE))?;
        }
        Ok(())
    }
}

fn parse_qualifiers(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut qualifiers = BTreeMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::invalid_input(format!("malformed purl qualifier: {pair}")))?;
        qualifiers.insert(key.to_ascii_lowercase(), decode(value)?);
    }
    Ok(qualifiers)
}

fn decode(input: &str) -> Result<String> {
    percent_decode_str(input)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::invalid_input(format!("purl segment is not valid UTF-8: {input}")))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn renders_npm_purl_with_vcs_url_qualifier() {
        let purl = PackageUrl::new("npm", "c2-wo-deps")
            .with_version("1.0.0")
            .with_qualifier("vcs_url", "git+https://host/c2.git@9e164b97");
        assert_eq!(
            purl.to_string(),
            "pkg:npm/c2-wo-deps@1.0.0?vcs_url=git%2Bhttps://host/c2.git%409e164b97"
        );
    }

    #[test]
    fn renders_scoped_npm_namespace() {
        let purl = PackageUrl::new("npm", "animation")
            .with_namespace("@angular")
            .with_version("12.3.1");
        assert_eq!(purl.to_string(), "pkg:npm/%40angular/animation@12.3.1");
    }

    #[test]
    fn renders_maven_purl_with_group_namespace() {
        let purl = PackageUrl::new("maven", "lib")
            .with_namespace("com.example")
            .with_version("1.0");
        assert_eq!(purl.to_string(), "pkg:maven/com.example/lib@1.0");
    }

    #[test]
    fn qualifiers_are_sorted_and_empty_values_dropped() {
        let purl = PackageUrl::new("generic", "archive.tar.gz")
            .with_qualifier("download_url", "https://example.com/archive.tar.gz")
            .with_qualifier("checksum", "sha256:deadbeef")
            .with_qualifier("empty", "");
        assert_eq!(
            purl.to_string(),
            "pkg:generic/archive.tar.gz?checksum=sha256:deadbeef&download_url=https://example.com/archive.tar.gz"
        );
    }

    #[test]
    fn renders_gem_purl_with_subpath() {
        let purl = PackageUrl::new("gem", "my-path-dep")
            .with_version("0.1.0")
            .with_qualifier("vcs_url", "git+ssh://git@github.com/user/repo.git@abc123")
            .with_subpath("vendor");
        assert_eq!(
            purl.to_string(),
            "pkg:gem/my-path-dep@0.1.0?vcs_url=git%2Bssh://git%40github.com/user/repo.git%40abc123#vendor"
        );
    }

    #[test]
    fn parses_back_what_it_renders() {
        let purl = PackageUrl::new("huggingface", "deberta-v3-base")
            .with_namespace("microsoft")
            .with_version("ab11c2f55b0e78ffde6343cd2b8ebd4ddae5d517");
        let parsed = PackageUrl::parse(&purl.to_string()).expect("parse");
        assert_eq!(parsed, purl);
        assert_eq!(parsed.to_string(), purl.to_string());
    }

    #[test]
    fn parse_rejects_non_purl() {
        assert!(PackageUrl::parse("https://example.com").is_err());
        assert!(PackageUrl::parse("pkg:").is_err());
    }

    proptest! {
        #[test]
        fn round_trips_arbitrary_names_and_versions(
            name in "[a-zA-Z0-9._@+ -]{1,32}",
            version in "[a-zA-Z0-9._@+ -]{1,16}",
        ) {
            prop_assume!(!name.trim().is_empty());
            let purl = PackageUrl::new("generic", name.clone()).with_version(version.clone());
            let rendered = purl.to_string();
            let parsed = PackageUrl::parse(&rendered).expect("parse rendered purl");
            prop_assert_eq!(parsed.name(), name.as_str());
            prop_assert_eq!(parsed.version(), Some(version.as_str()));
            prop_assert_eq!(parsed.to_string(), rendered);
        }
    }
}
