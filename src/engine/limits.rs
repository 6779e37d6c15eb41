//! Classifies resolved outputs against deterministic and statistical limits.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{DeterministicScope, EngineConfig};
use crate::models::{BreachKind, DangerLevelId, InstrumentSnapshot, Interval, ViolatedBound};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Normal,
    DeterministicBreach,
    StatisticalBreach,
}

impl VerdictKind {
    pub fn breach(self) -> Option<BreachKind> {
        match self {
            VerdictKind::Normal => None,
            VerdictKind::DeterministicBreach => Some(BreachKind::Deterministic),
            VerdictKind::StatisticalBreach => Some(BreachKind::Statistical),
        }
    }
}

/// Outcome of checking one output value against one kind of limit, or
/// against all of its limits when it is within every one of them.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub output: String,
    pub kind: VerdictKind,
    pub observed: f64,
    /// Violated bound; `None` for `NORMAL`.
    pub bound: Option<ViolatedBound>,
    /// The interval the value was checked against; `None` for `NORMAL`.
    pub limit: Option<Interval>,
    /// `None` for `NORMAL`.
    pub danger_level_id: Option<DangerLevelId>,
}

impl Verdict {
    pub fn is_breach(&self) -> bool {
        self.kind != VerdictKind::Normal
    }

    fn breach(
        output: &str,
        kind: BreachKind,
        observed: f64,
        bound: ViolatedBound,
        limit: Interval,
        config: &EngineConfig,
    ) -> Self {
        let verdict_kind = match kind {
            BreachKind::Deterministic => VerdictKind::DeterministicBreach,
            BreachKind::Statistical => VerdictKind::StatisticalBreach,
        };
        Self {
            output: output.to_string(),
            kind: verdict_kind,
            observed,
            bound: Some(bound),
            limit: Some(limit),
            danger_level_id: Some(config.danger_levels.for_breach(kind)),
        }
    }
}

/// Classify each computed output value of `snapshot`'s instrument.
///
/// Limits are read from the snapshot only, so a concurrent limit edit cannot
/// change the bounds halfway through. Outputs with no usable limit produce no
/// verdict; a value within every configured limit produces one `NORMAL`
/// verdict; each breached limit produces its own breach verdict. Verdicts
/// follow the instrument's output definition order.
pub fn classify(
    snapshot: &InstrumentSnapshot,
    values: &BTreeMap<String, f64>,
    config: &EngineConfig,
) -> Vec<Verdict> {
    // ---
    let instrument = &snapshot.instrument;

    let deterministic = snapshot
        .deterministic_limit
        .as_ref()
        .map(|l| l.interval())
        .filter(|interval| {
            let usable = interval.is_usable();
            if !usable {
                warn!(
                    "Instrument {}: ignoring malformed deterministic limit {}",
                    instrument.id, interval
                );
            }
            usable
        });

    // `None` means every output is a target.
    let primary = match (config.deterministic_scope, &instrument.primary_output) {
        (DeterministicScope::EachOutput, _) => None,
        (DeterministicScope::PrimaryOutput, None) => None,
        (DeterministicScope::PrimaryOutput, Some(name)) => {
            if instrument.outputs.iter().any(|o| &o.acronym == name) {
                Some(name.as_str())
            } else {
                warn!(
                    "Instrument {}: primary output {} is not defined, \
                     checking the deterministic limit on every output",
                    instrument.id, name
                );
                None
            }
        }
    };
    let deterministic_targets = |acronym: &str| primary.map_or(true, |p| p == acronym);

    let mut verdicts = Vec::new();

    for output in &instrument.outputs {
        let Some(&value) = values.get(&output.acronym) else {
            continue;
        };

        let mut checked = false;
        let mut breached = false;

        if let Some(interval) = deterministic.filter(|_| deterministic_targets(&output.acronym)) {
            checked = true;
            if let Err(bound) = interval.check(value) {
                breached = true;
                verdicts.push(Verdict::breach(
                    &output.acronym,
                    BreachKind::Deterministic,
                    value,
                    bound,
                    interval,
                    config,
                ));
            }
        }

        if let Some(limit) = snapshot.statistical_limit_for(output.id) {
            let interval = limit.interval();
            if interval.is_usable() {
                checked = true;
                if let Err(bound) = interval.check(value) {
                    breached = true;
                    verdicts.push(Verdict::breach(
                        &output.acronym,
                        BreachKind::Statistical,
                        value,
                        bound,
                        interval,
                        config,
                    ));
                }
            } else {
                warn!(
                    "Instrument {}: ignoring malformed statistical limit {} on output {}",
                    instrument.id, interval, output.acronym
                );
            }
        }

        if checked && !breached {
            verdicts.push(Verdict {
                output: output.acronym.clone(),
                kind: VerdictKind::Normal,
                observed: value,
                bound: None,
                limit: None,
                danger_level_id: None,
            });
        }
        if !checked {
            debug!(
                "Instrument {}: no limit configured for output {}",
                instrument.id, output.acronym
            );
        }
    }

    verdicts
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::DangerLevelMapping;
    use crate::models::DeterministicLimit;
    use crate::test_support::{deterministic, output, piezometer, snapshot, statistical, values};

    #[test]
    fn test_closed_interval_boundaries() {
        // ---
        let instrument = piezometer();
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(deterministic(&instrument, 0.0, 100.0));
        let cfg = EngineConfig::default();

        let at_upper = classify(&snap, &values(&[("Level", 100.0)]), &cfg);
        assert_eq!(at_upper.len(), 1);
        assert_eq!(at_upper[0].kind, VerdictKind::Normal);

        let at_lower = classify(&snap, &values(&[("Level", 0.0)]), &cfg);
        assert_eq!(at_lower[0].kind, VerdictKind::Normal);

        let above = classify(&snap, &values(&[("Level", 100.0001)]), &cfg);
        assert_eq!(above[0].kind, VerdictKind::DeterministicBreach);
        assert_eq!(above[0].bound, Some(ViolatedBound::Upper(100.0)));
        assert_eq!(above[0].danger_level_id, Some(3));
    }

    #[test]
    fn test_no_limits_means_no_verdict() {
        // ---
        let snap = snapshot(piezometer());
        let verdicts = classify(&snap, &values(&[("Level", 1e9)]), &EngineConfig::default());
        assert!(verdicts.is_empty());
    }

    #[test]
    fn test_statistical_breach_uses_lower_default_severity() {
        // ---
        let instrument = piezometer();
        let mut snap = snapshot(instrument.clone());
        snap.statistical_limits = vec![statistical(&instrument, "Level", 5.0, 10.0)];

        let verdicts = classify(&snap, &values(&[("Level", 4.0)]), &EngineConfig::default());
        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].kind, VerdictKind::StatisticalBreach);
        assert_eq!(verdicts[0].bound, Some(ViolatedBound::Lower(5.0)));
        assert_eq!(verdicts[0].danger_level_id, Some(2));
    }

    #[test]
    fn test_both_limits_breached_yield_two_verdicts() {
        // ---
        let instrument = piezometer();
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(deterministic(&instrument, 0.0, 12.0));
        snap.statistical_limits = vec![statistical(&instrument, "Level", 0.0, 10.0)];

        let verdicts = classify(&snap, &values(&[("Level", 15.0)]), &EngineConfig::default());
        let kinds: Vec<VerdictKind> = verdicts.iter().map(|v| v.kind).collect();
        assert_eq!(
            kinds,
            vec![VerdictKind::DeterministicBreach, VerdictKind::StatisticalBreach]
        );
    }

    #[test]
    fn test_danger_mapping_is_configurable() {
        // ---
        let instrument = piezometer();
        let mut snap = snapshot(instrument.clone());
        snap.statistical_limits = vec![statistical(&instrument, "Level", 0.0, 1.0)];
        let cfg = EngineConfig {
            danger_levels: DangerLevelMapping {
                deterministic: 3,
                statistical: 4,
            },
            ..EngineConfig::default()
        };

        let verdicts = classify(&snap, &values(&[("Level", 2.0)]), &cfg);
        assert_eq!(verdicts[0].danger_level_id, Some(4));
    }

    #[test]
    fn test_malformed_limit_is_treated_as_absent() {
        // ---
        let instrument = piezometer();
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(DeterministicLimit {
            lower: Some(50.0),
            upper: Some(10.0),
            ..deterministic(&instrument, 0.0, 0.0)
        });
        snap.statistical_limits = vec![statistical(&instrument, "Level", f64::NAN, 1.0)];

        let verdicts = classify(&snap, &values(&[("Level", 30.0)]), &EngineConfig::default());
        assert!(verdicts.is_empty());
    }

    #[test]
    fn test_primary_output_scope() {
        // ---
        let mut instrument = piezometer();
        instrument.outputs.push(output("Raw", "P"));
        instrument.primary_output = Some("Level".to_string());
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(deterministic(&instrument, 0.0, 12.0));

        let vals = values(&[("Level", 15.0), ("Raw", 20.0)]);

        let each = classify(&snap, &vals, &EngineConfig::default());
        assert_eq!(each.iter().filter(|v| v.is_breach()).count(), 2);

        let cfg = EngineConfig {
            deterministic_scope: DeterministicScope::PrimaryOutput,
            ..EngineConfig::default()
        };
        let primary = classify(&snap, &vals, &cfg);
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].output, "Level");
    }

    #[test]
    fn test_unknown_primary_output_falls_back_to_every_output() {
        // ---
        let mut instrument = piezometer();
        instrument.primary_output = Some("Head".to_string());
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(deterministic(&instrument, 0.0, 12.0));

        let cfg = EngineConfig {
            deterministic_scope: DeterministicScope::PrimaryOutput,
            ..EngineConfig::default()
        };
        let verdicts = classify(&snap, &values(&[("Level", 15.0)]), &cfg);

        assert_eq!(verdicts.len(), 1);
        assert_eq!(verdicts[0].output, "Level");
        assert_eq!(verdicts[0].kind, VerdictKind::DeterministicBreach);
    }

    #[test]
    fn test_missing_primary_output_falls_back_to_every_output() {
        // ---
        let instrument = piezometer();
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(deterministic(&instrument, 0.0, 12.0));

        let cfg = EngineConfig {
            deterministic_scope: DeterministicScope::PrimaryOutput,
            ..EngineConfig::default()
        };
        let verdicts = classify(&snap, &values(&[("Level", 15.0)]), &cfg);

        assert_eq!(verdicts.len(), 1);
        assert!(verdicts[0].is_breach());
    }

    #[test]
    fn test_uncomputed_output_is_skipped() {
        // ---
        let instrument = piezometer();
        let mut snap = snapshot(instrument.clone());
        snap.deterministic_limit = Some(deterministic(&instrument, 0.0, 12.0));

        assert!(classify(&snap, &BTreeMap::new(), &EngineConfig::default()).is_empty());
    }
}
