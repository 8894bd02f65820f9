use serde::{Deserialize, Serialize};

/// Property recorded on a component when its lockfile carried no checksum.
pub const MISSING_HASH_PROPERTY: &str = "airlock:missing_hash_in_file";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn missing_hash(lockfile: impl Into<String>) -> Self {
        Self::new(MISSING_HASH_PROPERTY, lockfile)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalReference {
    pub url: String,
    #[serde(rename = "type")]
    pub reference_type: String,
}

impl ExternalReference {
    pub fn distribution(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reference_type: "distribution".to_string(),
        }
    }
}

/// One SBOM entry for a resolved dependency. Identity for merging purposes
/// is the (name, version, purl) triple.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Component {
    #[serde(rename = "type")]
    pub component_type: String,
    pub name: String,
    pub version: String,
    pub purl: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<Property>,
    #[serde(
        default,
        rename = "externalReferences",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub external_references: Vec<ExternalReference>,
}

impl Component {
    pub fn library(
        name: impl Into<String>,
        version: impl Into<String>,
        purl: impl Into<String>,
    ) -> Self {
        Self {
            component_type: "library".to_string(),
            name: name.into(),
            version: version.into(),
            purl: purl.into(),
            properties: Vec::new(),
            external_references: Vec::new(),
        }
    }

    pub fn with_property(mut self, property: Property) -> Self {
        self.properties.push(property);
        self
    }

    pub fn with_external_reference(mut self, reference: ExternalReference) -> Self {
        self.external_references.push(reference);
        self
    }

    fn identity(&self) -> (&str, &str, &str) {
        (&self.name, &self.version, &self.purl)
    }
}

/// Deduplicate components by identity, keeping encounter order and unioning
/// the property sets of duplicates.
pub fn merge_components(components: Vec<Component>) -> Vec<Component> {
    let mut merged: Vec<Component> = Vec::new();
    for component in components {
        if let Some(existing) = merged
            .iter_mut()
            .find(|candidate| candidate.identity() == component.identity())
        {
            for property in component.properties {
                if !existing.properties.contains(&property) {
                    existing.properties.push(property);
                }
            }
            for reference in component.external_references {
                if !existing.external_references.contains(&reference) {
                    existing.external_references.push(reference);
                }
            }
        } else {
            merged.push(component);
        }
    }
    for component in &mut merged {
        component.properties.sort();
    }
    merged
}

/// The CycloneDX document written to `bom.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct Sbom {
    #[serde(rename = "bomFormat")]
    pub bom_format: String,
    #[serde(rename = "specVersion")]
    pub spec_version: String,
    pub version: u32,
    pub components: Vec<Component>,
}

impl Sbom {
    pub fn new(components: Vec<Component>) -> Self {
        Self {
            bom_format: "CycloneDX".to_string(),
            spec_version: "1.4".to_string(),
            version: 1,
            components,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_unions_properties_of_equal_identities() {
        let first = Component::library("lib", "1.0", "pkg:generic/lib@1.0")
            .with_property(Property::new("a", "1"));
        let second = Component::library("lib", "1.0", "pkg:generic/lib@1.0")
            .with_property(Property::new("b", "2"))
            .with_property(Property::new("a", "1"));

        let merged = merge_components(vec![first, second]);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0].properties,
            vec![Property::new("a", "1"), Property::new("b", "2")]
        );
    }

    #[test]
    fn merge_keeps_encounter_order() {
        let merged = merge_components(vec![
            Component::library("b", "1.0", "pkg:generic/b@1.0"),
            Component::library("a", "1.0", "pkg:generic/a@1.0"),
            Component::library("b", "1.0", "pkg:generic/b@1.0"),
        ]);
        let names: Vec<&str> = merged.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }

    #[test]
    fn components_with_different_purls_stay_separate() {
        let merged = merge_components(vec![
            Component::library("lib", "1.0", "pkg:gem/lib@1.0"),
            Component::library("lib", "1.0", "pkg:npm/lib@1.0"),
        ]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn sbom_serializes_as_cyclonedx() {
        let sbom = Sbom::new(vec![Component::library(
            "lib",
            "1.0",
            "pkg:generic/lib@1.0",
        )]);
        let json = serde_json::to_value(&sbom).expect("serialize sbom");
        assert_eq!(json["bomFormat"], "CycloneDX");
        assert_eq!(json["specVersion"], "1.4");
        assert_eq!(json["components"][0]["type"], "library");
        assert!(json["components"][0].get("properties").is_none());
    }

    #[test]
    fn merge_is_idempotent() {
        let components = vec![
            Component::library("lib", "1.0", "pkg:generic/lib@1.0")
                .with_property(Property::missing_hash("deps.lock")),
            Component::library("lib", "1.0", "pkg:generic/lib@1.0"),
        ];
        let once = merge_components(components);
        let twice = merge_components(once.clone());
        assert_eq!(once, twice);
    }
}
