//! Campaign inclusion rules.
//!
//! An ineligible recipient is removed from the pending set and never gets an
//! email.

use std::collections::{HashMap, HashSet};

use crate::model::{DataField, EligibilityRules, FieldId, InterestId, RangeLimit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    Ineligible(Reason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    NoMatchingInterest,
    Zipcode,
    BirthYear,
    Gender,
}

impl Reason {
    pub fn as_str(self) -> &'static str {
        match self {
            Reason::NoMatchingInterest => "interest",
            Reason::Zipcode => "zipcode",
            Reason::BirthYear => "birth_year",
            Reason::Gender => "gender",
        }
    }
}

/// The data fields limits are evaluated against. A limit whose field the list
/// lacks is never applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitFields {
    pub zipcode: Option<FieldId>,
    pub birth_year: Option<FieldId>,
    pub gender: Option<FieldId>,
}

impl LimitFields {
    /// Later fields override earlier ones with the same role.
    pub fn from_fields(fields: &[DataField]) -> Self {
        let mut out = Self::default();
        for field in fields {
            if field.is_gender {
                out.gender = Some(field.id);
            } else if field.is_birth_year {
                out.birth_year = Some(field.id);
            } else if field.is_zipcode() {
                out.zipcode = Some(field.id);
            }
        }
        out
    }
}

/// Out of range when the value is not a whole number.
fn outside(range: RangeLimit, value: &str) -> bool {
    value
        .trim()
        .parse::<i64>()
        .map_or(true, |v| !range.contains(v))
}

/// Whether a present value fails the check, or an absent one is disallowed.
fn fails(value: Option<&String>, include_empty: bool, rejects: impl Fn(&str) -> bool) -> bool {
    match value {
        None => !include_empty,
        Some(v) => rejects(v),
    }
}

/// Decide whether a recipient gets an email.
///
/// Interests are checked first. Of the limits, only the first whose guard holds
/// (range configured and field present) is evaluated: zipcode, else birth
/// year, else gender. A campaign with both a zipcode and a birth-year limit
/// therefore never checks the birth year.
pub fn evaluate(
    rules: &EligibilityRules,
    fields: &LimitFields,
    interests: &HashSet<InterestId>,
    values: &HashMap<FieldId, String>,
) -> Eligibility {
    if !rules.interests.is_empty() && !rules.interests.iter().any(|i| interests.contains(i)) {
        return Eligibility::Ineligible(Reason::NoMatchingInterest);
    }

    let Some(limits) = &rules.limits else {
        return Eligibility::Eligible;
    };

    let gender = limits.gender.as_deref().filter(|g| !g.is_empty());

    let failed = if let (Some(range), Some(field)) = (limits.zipcode, fields.zipcode) {
        fails(values.get(&field), limits.include_empty_zipcodes, |v| {
            outside(range, v)
        })
        .then_some(Reason::Zipcode)
    } else if let (Some(range), Some(field)) = (limits.birth_year, fields.birth_year) {
        fails(values.get(&field), limits.include_empty_birth_years, |v| {
            outside(range, v)
        })
        .then_some(Reason::BirthYear)
    } else if let (Some(wanted), Some(field)) = (gender, fields.gender) {
        fails(values.get(&field), limits.include_empty_genders, |v| {
            v != wanted
        })
        .then_some(Reason::Gender)
    } else {
        None
    };

    match failed {
        Some(reason) => Eligibility::Ineligible(reason),
        None => Eligibility::Eligible,
    }
}
