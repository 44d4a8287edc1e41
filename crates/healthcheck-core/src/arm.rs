//! TB study group-arm randomisation.

use std::collections::HashMap;

use rand::{Rng, seq::SliceRandom as _};
use serde::Deserialize;

use crate::{event::TbCheckValue, profile::Profile};

/// Study parameters, loaded from the `tb_study` config section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StudyConfig {
  /// Only contacts arriving with this activation code are enrolled.
  pub activation: String,
  /// Arm names; the first is the control arm.
  pub arms:       Vec<String>,
  /// Per-arm enrolment cap. `Some(0)` puts everybody in the control arm.
  #[serde(default)]
  pub limit:      Option<u64>,
}

/// Whether a TB check for a contact whose current profile is `profile` should
/// be given an arm.
pub fn eligible(config: &StudyConfig, profile: Option<&Profile>, check: &TbCheckValue) -> bool {
  if profile.is_some_and(|p| p.group_arm.is_some()) {
    return false;
  }
  check.research_consent == Some(true)
    && check.activation.as_deref() == Some(config.activation.as_str())
}

/// Draw an arm uniformly among those below the cap.
///
/// `counts` holds the current enrolment per arm; missing entries count as
/// zero. Returns `None` when no arms are configured or every arm is full.
pub fn draw_arm<R: Rng + ?Sized>(
  config: &StudyConfig,
  counts: &HashMap<String, u64>,
  rng: &mut R,
) -> Option<String> {
  if config.limit == Some(0) {
    return config.arms.first().cloned();
  }
  let open: Vec<&String> = config
    .arms
    .iter()
    .filter(|arm| match config.limit {
      Some(limit) => counts.get(*arm).copied().unwrap_or(0) < limit,
      None => true,
    })
    .collect();
  open.choose(rng).map(|arm| (*arm).clone())
}

#[cfg(test)]
mod tests {
  use rand::{SeedableRng as _, rngs::StdRng};

  use super::*;
  use crate::event::RiskLevel;

  fn config(limit: Option<u64>) -> StudyConfig {
    StudyConfig {
      activation: "tb_study_a".into(),
      arms:       vec!["control".into(), "health_literacy".into(), "planning_prompt".into()],
      limit,
    }
  }

  fn check(consent: bool, activation: Option<&str>) -> TbCheckValue {
    TbCheckValue {
      province:         None,
      city:             None,
      age:              None,
      gender:           None,
      cough:            None,
      fever:            None,
      sweat:            None,
      weight:           None,
      exposure:         None,
      tracing:          None,
      risk:             RiskLevel::Low,
      location:         None,
      city_location:    None,
      follow_up_optin:  None,
      language:         None,
      research_consent: Some(consent),
      activation:       activation.map(str::to_owned),
      group_arm:        None,
    }
  }

  #[test]
  fn zero_limit_always_picks_control() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..20 {
      let arm = draw_arm(&config(Some(0)), &HashMap::new(), &mut rng);
      assert_eq!(arm.as_deref(), Some("control"));
    }
  }

  #[test]
  fn full_arms_are_excluded() {
    let counts = HashMap::from([("control".to_owned(), 5), ("health_literacy".to_owned(), 5)]);
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..20 {
      let arm = draw_arm(&config(Some(5)), &counts, &mut rng);
      assert_eq!(arm.as_deref(), Some("planning_prompt"));
    }
  }

  #[test]
  fn all_full_assigns_nothing() {
    let counts: HashMap<String, u64> =
      config(None).arms.into_iter().map(|arm| (arm, 2)).collect();
    let mut rng = StdRng::seed_from_u64(1);
    assert_eq!(draw_arm(&config(Some(2)), &counts, &mut rng), None);
  }

  #[test]
  fn unlimited_draw_stays_within_arms() {
    let cfg = config(None);
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..50 {
      let arm = draw_arm(&cfg, &HashMap::new(), &mut rng).unwrap();
      assert!(cfg.arms.contains(&arm));
    }
  }

  #[test]
  fn eligibility_requires_consent_activation_and_no_arm() {
    let cfg = config(None);
    assert!(eligible(&cfg, None, &check(true, Some("tb_study_a"))));
    assert!(!eligible(&cfg, None, &check(false, Some("tb_study_a"))));
    assert!(!eligible(&cfg, None, &check(true, Some("other"))));
    assert!(!eligible(&cfg, None, &check(true, None)));

    let mut enrolled = Profile::new("+27821110000");
    enrolled.group_arm = Some("control".into());
    assert!(!eligible(&cfg, Some(&enrolled), &check(true, Some("tb_study_a"))));
  }
}
