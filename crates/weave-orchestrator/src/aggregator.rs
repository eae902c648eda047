use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use weave_core::{AgentId, WeaveError, WeaveResult};

/// How several candidate results for one goal are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationStrategy {
    /// Majority vote over scalar values.
    #[default]
    Consensus,
    /// Confidence-weighted mean of numeric values.
    Weighted,
    /// Value with the highest confidence.
    Best,
    /// Every value, in candidate order.
    Ensemble,
    /// The first candidate's value.
    First,
    /// Structural merge of objects or arrays.
    Merge,
}

impl std::fmt::Display for AggregationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregationStrategy::Consensus => "consensus",
            AggregationStrategy::Weighted => "weighted",
            AggregationStrategy::Best => "best",
            AggregationStrategy::Ensemble => "ensemble",
            AggregationStrategy::First => "first",
            AggregationStrategy::Merge => "merge",
        };
        f.write_str(s)
    }
}

/// Reducers for [`ResultAggregator::aggregate_numeric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericMethod {
    #[default]
    Mean,
    Median,
    Min,
    Max,
    Sum,
}

/// One worker's answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub agent_id: AgentId,
    #[serde(default)]
    pub agent_type: String,
    pub value: Value,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl Candidate {
    /// Finite confidences are clamped into `[0, 1]`.
    pub fn new(agent_id: impl Into<AgentId>, value: Value, confidence: f64) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_type: String::new(),
            value,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn with_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }
}

/// Count of one distinct value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueCount {
    pub value: Value,
    pub count: usize,
}

/// How much a set of candidates agrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgreementAnalysis {
    /// Share of candidates holding the majority value.
    pub agreement_level: f64,
    pub distinct_values: usize,
    pub majority_value: Value,
    pub majority_count: usize,
    pub total: usize,
    /// Distinct values in first-seen order.
    pub distribution: Vec<ValueCount>,
}

/// Combines candidate results under an [`AggregationStrategy`].
#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    default_strategy: AggregationStrategy,
}

impl ResultAggregator {
    pub fn new(default_strategy: AggregationStrategy) -> Self {
        Self { default_strategy }
    }

    pub fn default_strategy(&self) -> AggregationStrategy {
        self.default_strategy
    }

    /// Aggregate with the default strategy.
    pub fn aggregate_default(&self, candidates: &[Candidate]) -> WeaveResult<Value> {
        self.aggregate(candidates, self.default_strategy)
    }

    /// Combine `candidates` into one value.
    ///
    /// No candidates yields `null`; a single candidate is returned unchanged.
    pub fn aggregate(
        &self,
        candidates: &[Candidate],
        strategy: AggregationStrategy,
    ) -> WeaveResult<Value> {
        if let Some(bad) = candidates.iter().find(|c| !c.confidence.is_finite()) {
            return Err(WeaveError::Aggregation(format!(
                "Candidate from '{}' has non-finite confidence",
                bad.agent_id
            )));
        }
        match candidates {
            [] => return Ok(Value::Null),
            [only] => return Ok(only.value.clone()),
            _ => {}
        }

        debug!(strategy = %strategy, candidates = candidates.len(), "Aggregating results");
        let value = match strategy {
            AggregationStrategy::Consensus => consensus(candidates),
            AggregationStrategy::Weighted => weighted(candidates),
            AggregationStrategy::Best => best(candidates),
            AggregationStrategy::Ensemble => {
                Value::Array(candidates.iter().map(|c| c.value.clone()).collect())
            }
            AggregationStrategy::First => candidates[0].value.clone(),
            AggregationStrategy::Merge => merge(candidates),
        };
        Ok(value)
    }

    /// Reduce the numeric candidate values. Non-numeric values are ignored;
    /// `None` when nothing numeric remains.
    pub fn aggregate_numeric(&self, candidates: &[Candidate], method: NumericMethod) -> Option<f64> {
        let mut values: Vec<f64> = candidates.iter().filter_map(|c| c.value.as_f64()).collect();
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let out = match method {
            NumericMethod::Mean => values.iter().sum::<f64>() / n,
            NumericMethod::Sum => values.iter().sum(),
            NumericMethod::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            NumericMethod::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            NumericMethod::Median => {
                values.sort_by(f64::total_cmp);
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                }
            }
        };
        Some(out)
    }

    /// Concatenate the candidate values, splicing arrays in and appending
    /// anything else as one item. With `unique`, later duplicates are dropped
    /// and the first occurrence keeps its position.
    pub fn aggregate_lists(&self, candidates: &[Candidate], unique: bool) -> Vec<Value> {
        let mut combined: Vec<Value> = Vec::new();
        for c in candidates {
            let items: Vec<&Value> = match &c.value {
                Value::Array(items) => items.iter().collect(),
                other => vec![other],
            };
            for item in items {
                if unique && combined.iter().any(|seen| same_value(seen, item)) {
                    continue;
                }
                combined.push(item.clone());
            }
        }
        combined
    }

    /// Deep-merge the object values. Non-object candidates are skipped.
    pub fn aggregate_dicts(&self, candidates: &[Candidate]) -> Map<String, Value> {
        let mut merged = Map::new();
        for c in candidates {
            if let Value::Object(map) = &c.value {
                merge_objects(&mut merged, map);
            }
        }
        merged
    }

    /// Agreement among candidate values, compared by equality. Numbers compare
    /// by value, so `42` and `42.0` agree.
    pub fn analyze_agreement(&self, candidates: &[Candidate]) -> AgreementAnalysis {
        let distribution = tally(candidates);
        let total = candidates.len();
        let (majority_value, majority_count) = majority(&distribution)
            .map(|vc| (vc.value.clone(), vc.count))
            .unwrap_or((Value::Null, 0));
        let agreement_level = if total < 2 {
            1.0
        } else {
            majority_count as f64 / total as f64
        };
        AgreementAnalysis {
            agreement_level,
            distinct_values: distribution.len(),
            majority_value,
            majority_count,
            total,
            distribution,
        }
    }
}

fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// JSON equality, except that numbers compare by numeric value.
fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Distinct values with their counts, in first-seen order.
fn tally(candidates: &[Candidate]) -> Vec<ValueCount> {
    let mut counts: Vec<ValueCount> = Vec::new();
    for c in candidates {
        match counts.iter_mut().find(|vc| same_value(&vc.value, &c.value)) {
            Some(vc) => vc.count += 1,
            None => counts.push(ValueCount {
                value: c.value.clone(),
                count: 1,
            }),
        }
    }
    counts
}

/// Highest count; the first-seen value wins a tie.
fn majority(counts: &[ValueCount]) -> Option<&ValueCount> {
    counts.iter().fold(None, |best: Option<&ValueCount>, vc| match best {
        Some(b) if b.count >= vc.count => Some(b),
        _ => Some(vc),
    })
}

fn consensus(candidates: &[Candidate]) -> Value {
    if !candidates.iter().all(|c| is_scalar(&c.value)) {
        return weighted(candidates);
    }
    let counts = tally(candidates);
    majority(&counts).map_or(Value::Null, |vc| vc.value.clone())
}

fn weighted(candidates: &[Candidate]) -> Value {
    let numbers: Option<Vec<(f64, f64)>> = candidates
        .iter()
        .map(|c| c.value.as_f64().map(|v| (v, c.confidence)))
        .collect();
    if let Some(pairs) = numbers {
        let total_weight: f64 = pairs.iter().map(|(_, w)| w).sum();
        if total_weight > 0.0 {
            let mean = pairs.iter().map(|(v, w)| v * w).sum::<f64>() / total_weight;
            if let Some(n) = serde_json::Number::from_f64(mean) {
                return Value::Number(n);
            }
        }
    }
    best(candidates)
}

fn best(candidates: &[Candidate]) -> Value {
    candidates
        .iter()
        .fold(None, |best: Option<&Candidate>, c| match best {
            Some(b) if b.confidence >= c.confidence => Some(b),
            _ => Some(c),
        })
        .map_or(Value::Null, |c| c.value.clone())
}

fn merge(candidates: &[Candidate]) -> Value {
    if candidates.iter().all(|c| c.value.is_object()) {
        let mut merged = Map::new();
        for c in candidates {
            if let Value::Object(map) = &c.value {
                merge_objects(&mut merged, map);
            }
        }
        return Value::Object(merged);
    }
    if candidates.iter().all(|c| c.value.is_array()) {
        let items = candidates
            .iter()
            .filter_map(|c| c.value.as_array())
            .flatten()
            .cloned()
            .collect();
        return Value::Array(items);
    }
    weighted(candidates)
}

fn merge_objects(into: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, incoming) in from {
        match into.get_mut(key) {
            None => {
                into.insert(key.clone(), incoming.clone());
            }
            Some(existing) => merge_value(existing, incoming),
        }
    }
}

fn merge_value(existing: &mut Value, incoming: &Value) {
    match (&mut *existing, incoming) {
        (Value::Object(a), Value::Object(b)) => return merge_objects(a, b),
        (Value::Array(a), Value::Array(b)) => return a.extend(b.iter().cloned()),
        _ => {}
    }
    if same_value(existing, incoming) {
        return;
    }
    // Conflicting values are kept side by side.
    *existing = match std::mem::take(existing) {
        Value::Array(mut items) => {
            items.push(incoming.clone());
            Value::Array(items)
        }
        other => Value::Array(vec![other, incoming.clone()]),
    };
}
