//! Registry entity snapshots
//!
//! A snapshot is a point-in-time view of one company or individual
//! entrepreneur as read from the registry. Snapshots are plain values: every
//! observation cycle builds a new one, nothing mutates them in place.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static OGRN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{13}$").expect("valid OGRN pattern"));
static OGRNIP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{15}$").expect("valid OGRNIP pattern"));

/// Kind of registry entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Legal entity, identified by OGRN
    Company,
    /// Individual entrepreneur, identified by OGRNIP
    Entrepreneur,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Company => "company",
            EntityType::Entrepreneur => "entrepreneur",
        }
    }

    /// Whether `number` is a well-formed registration number for this type
    pub fn is_valid_registration_number(&self, number: &str) -> bool {
        match self {
            EntityType::Company => OGRN_RE.is_match(number),
            EntityType::Entrepreneur => OGRNIP_RE.is_match(number),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(EntityType::Company),
            "entrepreneur" => Ok(EntityType::Entrepreneur),
            other => Err(format!("unknown entity type '{}'", other)),
        }
    }
}

/// Stable registration number (OGRN or OGRNIP)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Postal address, every part optional
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Address {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub house: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flat: Option<String>,
}

impl Address {
    pub fn is_empty(&self) -> bool {
        self.postal_code.is_none()
            && self.region.is_none()
            && self.city.is_none()
            && self.street.is_none()
            && self.house.is_none()
            && self.flat.is_none()
    }
}

/// OKVED activity code
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCode {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ActivityCode {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: None,
        }
    }
}

/// Company founder (participant) and its share
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Founder {
    /// Tax id (INN) of the founder, when the registry provides one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inn: Option<String>,
    pub name: String,
    /// Nominal value of the share, minor currency units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_nominal: Option<i64>,
    /// Share size in hundredths of a percent (30% = 3000)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_basis_points: Option<u32>,
}

impl Founder {
    /// Key that identifies this founder across snapshots: tax id, or name
    /// when the tax id is absent.
    pub fn identity_key(&self) -> String {
        match &self.inn {
            Some(inn) => format!("inn:{}", inn),
            None => format!("name:{}", self.name),
        }
    }
}

/// Head of a company (director or managing person)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inn: Option<String>,
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
}

/// Authorized capital, amount in minor currency units
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capital {
    pub amount: i64,
    pub currency: String,
}

/// Point-in-time view of one registry entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub entity_type: EntityType,
    /// OGRN for companies, OGRNIP for entrepreneurs
    pub registration_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_on: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_activity: Option<ActivityCode>,
    #[serde(default)]
    pub additional_activities: Vec<ActivityCode>,
    #[serde(default)]
    pub founders: Vec<Founder>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head: Option<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capital: Option<Capital>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub licenses_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branches_count: Option<u32>,
}

impl EntitySnapshot {
    /// Empty snapshot carrying only the identity
    pub fn new(entity_type: EntityType, registration_number: impl Into<String>) -> Self {
        Self {
            entity_type,
            registration_number: registration_number.into(),
            inn: None,
            full_name: None,
            short_name: None,
            registered_on: None,
            status: None,
            address: None,
            main_activity: None,
            additional_activities: Vec::new(),
            founders: Vec::new(),
            head: None,
            capital: None,
            licenses_count: None,
            branches_count: None,
        }
    }

    pub fn entity_id(&self) -> EntityId {
        EntityId::new(self.registration_number.clone())
    }
}
