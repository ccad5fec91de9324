//! Per-target requirement checks.
//!
//! [`evaluate`] is a pure function of a resolved profile and a requirement set, so
//! it can be called from anywhere (profile store, CLI, tests) without storage.

use serde::{Deserialize, Serialize};

use crate::ResolvedProfile;

/// Score cost of one missing recommended field.
pub const RECOMMENDED_PENALTY: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequirementKind {
    Title,
    Description,
    Price,
    Currency,
    Location,
    PropertyType,
    Bedrooms,
    Bathrooms,
    Size,
    MinImages { count: usize },
    PermitNumber,
    AgentAttribution,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementLevel {
    #[default]
    Required,
    Recommended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    #[serde(flatten)]
    pub kind: RequirementKind,
    #[serde(default)]
    pub level: RequirementLevel,
    /// Country codes this requirement is limited to; empty applies everywhere.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub countries: Vec<String>,
}

impl Requirement {
    pub fn required(kind: RequirementKind) -> Self {
        Self {
            kind,
            level: RequirementLevel::Required,
            countries: Vec::new(),
        }
    }

    pub fn recommended(kind: RequirementKind) -> Self {
        Self {
            kind,
            level: RequirementLevel::Recommended,
            countries: Vec::new(),
        }
    }

    pub fn only_in<I, S>(mut self, countries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.countries = countries.into_iter().map(Into::into).collect();
        self
    }

    pub fn applies_in(&self, country: Option<&str>) -> bool {
        if self.countries.is_empty() {
            return true;
        }
        country.is_some_and(|c| self.countries.iter().any(|r| r.eq_ignore_ascii_case(c)))
    }
}

/// Requirements of one target, together with the locale they are judged in.
#[derive(Debug, Clone, Copy)]
pub struct RequirementSet<'a> {
    pub country: Option<&'a str>,
    pub requirements: &'a [Requirement],
}

impl<'a> RequirementSet<'a> {
    pub fn empty() -> Self {
        Self {
            country: None,
            requirements: &[],
        }
    }

    pub fn applicable(&self) -> impl Iterator<Item = &'a Requirement> {
        let country = self.country;
        self.requirements
            .iter()
            .filter(move |r| r.applies_in(country))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub score: u8,
    pub errors: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self {
            is_valid: true,
            score: 100,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

pub fn evaluate(resolved: &ResolvedProfile, requirements: &RequirementSet<'_>) -> ValidationResult {
    let mut required_count = 0usize;
    let mut missing_required = 0usize;
    let mut missing_recommended = 0usize;
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for requirement in requirements.applicable() {
        if requirement.level == RequirementLevel::Required {
            required_count += 1;
        }
        let Some(message) = unmet_message(resolved, &requirement.kind) else {
            continue;
        };
        match requirement.level {
            RequirementLevel::Required => {
                missing_required += 1;
                errors.push(message);
            }
            RequirementLevel::Recommended => {
                missing_recommended += 1;
                warnings.push(message);
            }
        }
    }

    let required_penalty = if required_count == 0 {
        0
    } else {
        missing_required * 100 / required_count
    };
    let score = 100usize
        .saturating_sub(required_penalty)
        .saturating_sub(missing_recommended * RECOMMENDED_PENALTY);

    ValidationResult {
        is_valid: errors.is_empty(),
        score: score as u8,
        errors,
        warnings,
    }
}

fn blank(value: Option<&str>) -> bool {
    value.map_or(true, |s| s.trim().is_empty())
}

fn unmet_message(resolved: &ResolvedProfile, kind: &RequirementKind) -> Option<String> {
    let missing = match kind {
        RequirementKind::Title => blank(resolved.title.as_deref()),
        RequirementKind::Description => blank(resolved.description.as_deref()),
        RequirementKind::Price => !resolved.price.is_some_and(|p| p > 0.0),
        RequirementKind::Currency => blank(resolved.currency.as_deref()),
        RequirementKind::Location => resolved.location.is_empty(),
        RequirementKind::PropertyType => blank(resolved.attributes.property_type.as_deref()),
        RequirementKind::Bedrooms => resolved.attributes.bedrooms.is_none(),
        RequirementKind::Bathrooms => resolved.attributes.bathrooms.is_none(),
        RequirementKind::Size => !resolved.attributes.size_sqm.is_some_and(|s| s > 0.0),
        RequirementKind::MinImages { count } => {
            if resolved.media.len() < *count {
                return Some(format!("minimum {count} images"));
            }
            false
        }
        RequirementKind::PermitNumber => blank(resolved.permit_number.as_deref()),
        RequirementKind::AgentAttribution => resolved.agent.is_none(),
    };
    missing.then(|| format!("missing {}", label(kind)))
}

fn label(kind: &RequirementKind) -> &'static str {
    match kind {
        RequirementKind::Title => "title",
        RequirementKind::Description => "description",
        RequirementKind::Price => "price",
        RequirementKind::Currency => "currency",
        RequirementKind::Location => "location",
        RequirementKind::PropertyType => "property type",
        RequirementKind::Bedrooms => "bedrooms",
        RequirementKind::Bathrooms => "bathrooms",
        RequirementKind::Size => "size",
        RequirementKind::MinImages { .. } => "images",
        RequirementKind::PermitNumber => "permit number",
        RequirementKind::AgentAttribution => "agent attribution",
    }
}
