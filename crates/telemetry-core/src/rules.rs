//! Dynamic rule engine (SPEC_FULL.md §4.D): loads the rules applicable to a
//! sensor and evaluates each one's predicate tree against an incoming
//! reading.

use anyhow::Result;

use crate::db::Db;
use crate::model::{ConditionLogic, DynamicRule, Predicate, RuleOperator, Sensor, SensorReading};

pub struct RuleEngine<'a> {
    db: &'a Db,
}

impl<'a> RuleEngine<'a> {
    pub fn new(db: &'a Db) -> Self {
        Self { db }
    }

    /// Returns every active rule bound to this sensor (by municipality and/or
    /// kind, or unbound) whose predicate tree matches the reading.
    pub async fn evaluate(&self, sensor: &Sensor, reading: &SensorReading) -> Result<Vec<DynamicRule>> {
        let candidates = self.db.rules_for_sensor(&sensor.municipality_id, &sensor.kind_code).await?;
        Ok(candidates.into_iter().filter(|rule| matches(rule, reading)).collect())
    }
}

fn matches(rule: &DynamicRule, reading: &SensorReading) -> bool {
    if rule.predicates.is_empty() {
        return false;
    }

    let mut outcomes = rule.predicates.iter().map(|p| evaluate_predicate(p, reading));
    match rule.condition_logic {
        ConditionLogic::All => outcomes.all(|b| b),
        ConditionLogic::Any => outcomes.any(|b| b),
    }
}

fn field_value(predicate: &Predicate, reading: &SensorReading) -> Option<f64> {
    match &predicate.field {
        None => Some(reading.value),
        Some(key) => crate::model::numeric_field(&reading.raw_data, key),
    }
}

fn evaluate_predicate(predicate: &Predicate, reading: &SensorReading) -> bool {
    let Some(value) = field_value(predicate, reading) else {
        return false;
    };

    match predicate.operator {
        RuleOperator::Gt => predicate.operands.first().is_some_and(|&o| value > o),
        RuleOperator::Lt => predicate.operands.first().is_some_and(|&o| value < o),
        RuleOperator::Gte => predicate.operands.first().is_some_and(|&o| value >= o),
        RuleOperator::Lte => predicate.operands.first().is_some_and(|&o| value <= o),
        RuleOperator::Eq => predicate.operands.first().is_some_and(|&o| (value - o).abs() < f64::EPSILON),
        RuleOperator::Neq => predicate.operands.first().is_some_and(|&o| (value - o).abs() >= f64::EPSILON),
        RuleOperator::Between => match (predicate.operands.first(), predicate.operands.get(1)) {
            (Some(&low), Some(&high)) => value >= low && value <= high,
            _ => false,
        },
        RuleOperator::ChangeRate => {
            let rate = crate::model::numeric_field(&reading.raw_data, "change_rate").unwrap_or(0.0);
            predicate.operands.first().is_some_and(|&threshold| rate > threshold)
        }
        RuleOperator::Delta => {
            let delta = crate::model::numeric_field(&reading.raw_data, "delta").unwrap_or(0.0);
            predicate.operands.first().is_some_and(|&threshold| delta.abs() > threshold)
        }
    }
}
