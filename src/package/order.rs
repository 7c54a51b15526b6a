//! Ordering of installed versions.
//!
//! Versions of one package are partitioned by "flavour" attributes (for
//! example the build configuration) and ordered inside each partition by
//! comparing a tuple of converted attributes left to right.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use super::version::{AttrValue, VersionAttributes, VersionError};

/// Pseudo-attribute holding the install timestamp.
pub const INSTALL_TIME: &str = "_installTime";

/// How a raw attribute value is turned into a sort key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// Null becomes 0, strings are parsed as integers.
    Numeric,
    /// Raw value, strings compare lexically.
    Literal,
}

impl Conversion {
    pub fn apply(self, attribute: &str, value: &AttrValue) -> Result<AttrValue, VersionError> {
        match self {
            Conversion::Literal => Ok(value.clone()),
            Conversion::Numeric => match value {
                AttrValue::Null => Ok(AttrValue::Int(0)),
                AttrValue::Int(i) => Ok(AttrValue::Int(*i)),
                AttrValue::Str(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(AttrValue::Int)
                    .map_err(|_| VersionError::NotNumeric {
                        attribute: attribute.to_string(),
                        value: s.clone(),
                    }),
            },
        }
    }
}

impl FromStr for Conversion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "convert_version_subnum" | "numeric" => Ok(Conversion::Numeric),
            "literal" | "identical" | "identic" => Ok(Conversion::Literal),
            other => Err(VersionError::UnknownConversion(other.to_string())),
        }
    }
}

/// Attribute reference as written in settings: `"major"` or `["major", "numeric"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrRef {
    Name(String),
    WithConversion(String, String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrSpec {
    pub name: String,
    pub conversion: Conversion,
}

impl AttrSpec {
    pub fn new(name: &str, conversion: Conversion) -> Self {
        Self {
            name: name.to_string(),
            conversion,
        }
    }

    fn from_ref(reference: &AttrRef, default: Conversion) -> Result<Self, VersionError> {
        match reference {
            AttrRef::Name(name) => Ok(Self::new(name, default)),
            AttrRef::WithConversion(name, conversion) => Ok(Self::new(name, conversion.parse()?)),
        }
    }
}

/// Version history entry used to rank installed versions.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub package: String,
    pub attributes: VersionAttributes,
    pub installed_at: NaiveDateTime,
}

impl VersionRecord {
    pub fn full_version(&self) -> &str {
        self.attributes.full_version()
    }
}

pub type FlavourKey = Vec<AttrValue>;
pub type OrderKey = Vec<AttrValue>;

/// One flavour's versions, oldest first.
#[derive(Debug)]
pub struct Partition<'a> {
    pub flavour: FlavourKey,
    pub versions: Vec<(OrderKey, &'a VersionRecord)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionOrder {
    attributes: Vec<AttrSpec>,
    flavours: Vec<AttrSpec>,
}

impl Default for VersionOrder {
    fn default() -> Self {
        Self {
            attributes: Self::default_attributes(),
            flavours: Self::default_flavours(),
        }
    }
}

impl VersionOrder {
    pub fn new(attributes: Vec<AttrSpec>, flavours: Vec<AttrSpec>) -> Self {
        Self { attributes, flavours }
    }

    /// `major`..`patch3` numerically, then install time.
    pub fn default_attributes() -> Vec<AttrSpec> {
        let mut attrs: Vec<AttrSpec> = ["major", "minor", "patch", "patch1", "patch2", "patch3"]
            .iter()
            .map(|name| AttrSpec::new(name, Conversion::Numeric))
            .collect();
        attrs.push(AttrSpec::new(INSTALL_TIME, Conversion::Literal));
        attrs
    }

    pub fn default_flavours() -> Vec<AttrSpec> {
        vec![AttrSpec::new("buildConf", Conversion::Literal)]
    }

    /// Build an order from settings references.
    ///
    /// Missing or empty attribute lists fall back to the defaults. A missing
    /// flavour list falls back to the default flavour, while an explicitly
    /// empty one disables partitioning.
    pub fn from_refs(attributes: Option<&[AttrRef]>, flavours: Option<&[AttrRef]>) -> Result<Self, VersionError> {
        let attributes = match attributes {
            Some(refs) if !refs.is_empty() => refs
                .iter()
                .map(|r| AttrSpec::from_ref(r, Conversion::Numeric))
                .collect::<Result<Vec<_>, _>>()?,
            _ => Self::default_attributes(),
        };
        let flavours = match flavours {
            Some(refs) => refs
                .iter()
                .map(|r| AttrSpec::from_ref(r, Conversion::Literal))
                .collect::<Result<Vec<_>, _>>()?,
            None => Self::default_flavours(),
        };
        Ok(Self::new(attributes, flavours))
    }

    pub fn flavour_names(&self) -> Vec<&str> {
        self.flavours.iter().map(|a| a.name.as_str()).collect()
    }

    /// Converted `(flavour, order)` keys of a record.
    pub fn canonic_key(&self, record: &VersionRecord) -> Result<(FlavourKey, OrderKey), VersionError> {
        let attrs = &record.attributes;
        let flavour = self
            .flavours
            .iter()
            .map(|spec| spec.conversion.apply(&spec.name, &attrs.value(&spec.name)))
            .collect::<Result<Vec<_>, _>>()?;

        let order = self
            .attributes
            .iter()
            .map(|spec| {
                let raw = if spec.name == INSTALL_TIME && !attrs.contains(INSTALL_TIME) {
                    AttrValue::Int(record.installed_at.and_utc().timestamp_micros())
                } else {
                    attrs.value(&spec.name)
                };
                spec.conversion.apply(&spec.name, &raw)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok((flavour, order))
    }

    /// Partition and sort `records`. Records sharing both keys collapse to the last one.
    pub fn partition<'a>(&self, records: &'a [VersionRecord]) -> Result<Vec<Partition<'a>>, VersionError> {
        let mut by_flavour: BTreeMap<FlavourKey, BTreeMap<OrderKey, &'a VersionRecord>> = BTreeMap::new();
        for record in records {
            let (flavour, order) = self.canonic_key(record)?;
            by_flavour.entry(flavour).or_default().insert(order, record);
        }

        Ok(by_flavour
            .into_iter()
            .map(|(flavour, versions)| Partition {
                flavour,
                versions: versions.into_iter().collect(),
            })
            .collect())
    }
}
