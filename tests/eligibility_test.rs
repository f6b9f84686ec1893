//! Inclusion rules: interests and demographic limits.

use std::collections::{HashMap, HashSet};

use mailq::model::{EligibilityRules, FieldId, InterestId, Limits, RangeLimit};
use mailq::personalize::{Eligibility, LimitFields, Reason};
use mailq::personalize::eligibility::evaluate;

const ZIP: FieldId = FieldId(1);
const BIRTH: FieldId = FieldId(2);
const GENDER: FieldId = FieldId(3);

fn all_fields() -> LimitFields {
    LimitFields {
        zipcode: Some(ZIP),
        birth_year: Some(BIRTH),
        gender: Some(GENDER),
    }
}

fn with_limits(limits: Limits) -> EligibilityRules {
    EligibilityRules {
        interests: Vec::new(),
        limits: Some(limits),
    }
}

fn values(pairs: &[(FieldId, &str)]) -> HashMap<FieldId, String> {
    pairs.iter().map(|(f, v)| (*f, v.to_string())).collect()
}

fn zip_limit(include_empty: bool) -> Limits {
    Limits {
        zipcode: Some(RangeLimit { from: 8000, to: 8999 }),
        include_empty_zipcodes: include_empty,
        ..Limits::default()
    }
}

#[test]
fn no_rules_means_eligible() {
    let result = evaluate(
        &EligibilityRules::default(),
        &all_fields(),
        &HashSet::new(),
        &HashMap::new(),
    );
    assert_eq!(result, Eligibility::Eligible);
}

#[test]
fn zipcode_range_is_inclusive() {
    let rules = with_limits(zip_limit(false));
    for (zip, expected) in [
        ("8000", Eligibility::Eligible),
        ("8999", Eligibility::Eligible),
        ("9000", Eligibility::Ineligible(Reason::Zipcode)),
        ("n/a", Eligibility::Ineligible(Reason::Zipcode)),
    ] {
        let result = evaluate(&rules, &all_fields(), &HashSet::new(), &values(&[(ZIP, zip)]));
        assert_eq!(result, expected, "zip {zip}");
    }
}

#[test]
fn missing_zipcode_follows_include_flag() {
    let excluded = evaluate(
        &with_limits(zip_limit(false)),
        &all_fields(),
        &HashSet::new(),
        &HashMap::new(),
    );
    assert_eq!(excluded, Eligibility::Ineligible(Reason::Zipcode));

    let included = evaluate(
        &with_limits(zip_limit(true)),
        &all_fields(),
        &HashSet::new(),
        &HashMap::new(),
    );
    assert_eq!(included, Eligibility::Eligible);
}

#[test]
fn zipcode_limit_shadows_later_limits() {
    let rules = with_limits(Limits {
        birth_year: Some(RangeLimit { from: 1980, to: 1989 }),
        gender: Some("female".to_string()),
        ..zip_limit(false)
    });
    // Birth year and gender would both fail, but only the zipcode is checked.
    let result = evaluate(
        &rules,
        &all_fields(),
        &HashSet::new(),
        &values(&[(ZIP, "8200"), (BIRTH, "1950"), (GENDER, "male")]),
    );
    assert_eq!(result, Eligibility::Eligible);
}

#[test]
fn birth_year_applies_when_list_has_no_zipcode_field() {
    let rules = with_limits(Limits {
        birth_year: Some(RangeLimit { from: 1980, to: 1989 }),
        ..zip_limit(false)
    });
    let fields = LimitFields {
        zipcode: None,
        ..all_fields()
    };
    let result = evaluate(&rules, &fields, &HashSet::new(), &values(&[(BIRTH, "1950")]));
    assert_eq!(result, Eligibility::Ineligible(Reason::BirthYear));
}

#[test]
fn gender_must_match_exactly() {
    let rules = with_limits(Limits {
        gender: Some("female".to_string()),
        ..Limits::default()
    });
    let fields = all_fields();
    let check = |g: &str| evaluate(&rules, &fields, &HashSet::new(), &values(&[(GENDER, g)]));
    assert_eq!(check("female"), Eligibility::Eligible);
    assert_eq!(check("male"), Eligibility::Ineligible(Reason::Gender));
}

#[test]
fn empty_gender_limit_is_ignored() {
    let rules = with_limits(Limits {
        gender: Some(String::new()),
        ..Limits::default()
    });
    let result = evaluate(&rules, &all_fields(), &HashSet::new(), &HashMap::new());
    assert_eq!(result, Eligibility::Eligible);
}

#[test]
fn interests_require_any_overlap() {
    let rules = EligibilityRules {
        interests: vec![InterestId(1), InterestId(2)],
        limits: None,
    };
    let held: HashSet<_> = [InterestId(2), InterestId(9)].into_iter().collect();
    assert_eq!(
        evaluate(&rules, &all_fields(), &held, &HashMap::new()),
        Eligibility::Eligible
    );

    let unrelated: HashSet<_> = [InterestId(9)].into_iter().collect();
    assert_eq!(
        evaluate(&rules, &all_fields(), &unrelated, &HashMap::new()),
        Eligibility::Ineligible(Reason::NoMatchingInterest)
    );
}

#[test]
fn interests_are_checked_before_limits() {
    let rules = EligibilityRules {
        interests: vec![InterestId(1)],
        limits: Some(zip_limit(false)),
    };
    let result = evaluate(&rules, &all_fields(), &HashSet::new(), &HashMap::new());
    assert_eq!(result, Eligibility::Ineligible(Reason::NoMatchingInterest));
}
